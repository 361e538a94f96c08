//! Transfer record state shared by the lifecycle manager, workers and observers.
//!
//! [`Transfer`] is the live, synchronised record; [`TransferRecord`] is the
//! plain snapshot handed to observers and to the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::planner::SegmentPlan;

/// Sentinel stored in place of an unknown total size.
const UNKNOWN_SIZE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Paused,
    Hold,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "inProgress",
            Self::Paused => "paused",
            Self::Hold => "hold",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled transfers only move again on user action.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Paused => 2,
            Self::Hold => 3,
            Self::Completed => 4,
            Self::Failed => 5,
            Self::Cancelled => 6,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InProgress,
            2 => Self::Paused,
            3 => Self::Hold,
            4 => Self::Completed,
            5 => Self::Failed,
            6 => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transfer's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub source_url: String,
    /// Post-redirect URL; `None` until metadata resolution succeeded.
    pub final_url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Snapshot of a transfer, ordered and serialisable for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub file_name: String,
    pub source_url: String,
    pub final_url: Option<String>,
    pub destination_path: PathBuf,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    pub total_size: Option<u64>,
    pub downloaded_bytes: u64,
    pub speed: f64,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Fraction in `0.0..=1.0`, or `None` while the size is unknown.
    pub fn progress(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(1.0),
            Some(total) => Some((self.downloaded_bytes as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Live transfer record. Identity is the destination path.
#[derive(Debug)]
pub struct Transfer {
    id: PathBuf,
    file_name: String,
    created_at: DateTime<Utc>,
    source: RwLock<Source>,
    total_size: AtomicU64,
    downloaded: AtomicU64,
    /// `f64` bits, bytes per second.
    speed: AtomicU64,
    status: AtomicU8,
    /// Bumped on every start so that workers of an aborted run can tell they are stale.
    session: AtomicU64,
    last_attempt_at: Mutex<DateTime<Utc>>,
    plan: Mutex<Option<Arc<SegmentPlan>>>,
}

impl Transfer {
    pub fn new(id: PathBuf, file_name: String, source: Source, total_size: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            id,
            file_name,
            created_at: now,
            source: RwLock::new(source),
            total_size: AtomicU64::new(total_size.unwrap_or(UNKNOWN_SIZE)),
            downloaded: AtomicU64::new(0),
            speed: AtomicU64::new(0f64.to_bits()),
            status: AtomicU8::new(TransferStatus::Pending.to_u8()),
            session: AtomicU64::new(0),
            last_attempt_at: Mutex::new(now),
            plan: Mutex::new(None),
        }
    }

    /// Rebuild a live record from a persisted snapshot.
    /// Speed is not carried over; it is meaningless once the process restarted.
    pub fn from_record(record: TransferRecord) -> Self {
        Self {
            id: record.destination_path,
            file_name: record.file_name,
            created_at: record.created_at,
            source: RwLock::new(Source {
                source_url: record.source_url,
                final_url: record.final_url,
                headers: record.request_headers,
            }),
            total_size: AtomicU64::new(record.total_size.unwrap_or(UNKNOWN_SIZE)),
            downloaded: AtomicU64::new(record.downloaded_bytes),
            speed: AtomicU64::new(0f64.to_bits()),
            status: AtomicU8::new(record.status.to_u8()),
            session: AtomicU64::new(0),
            last_attempt_at: Mutex::new(record.last_attempt_at),
            plan: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &Path {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Only the lifecycle manager moves a transfer between states.
    pub(crate) fn set_status(&self, status: TransferStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    pub fn total_size(&self) -> Option<u64> {
        match self.total_size.load(Ordering::SeqCst) {
            UNKNOWN_SIZE => None,
            size => Some(size),
        }
    }

    pub(crate) fn set_total_size(&self, size: Option<u64>) {
        self.total_size
            .store(size.unwrap_or(UNKNOWN_SIZE), Ordering::SeqCst);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Returns the new total.
    pub(crate) fn add_downloaded(&self, bytes: u64) -> u64 {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub(crate) fn sub_downloaded(&self, bytes: u64) {
        let _ = self
            .downloaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub(crate) fn set_downloaded(&self, bytes: u64) {
        self.downloaded.store(bytes, Ordering::SeqCst);
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed.load(Ordering::SeqCst))
    }

    pub(crate) fn set_speed(&self, bytes_per_sec: f64) {
        let value = if bytes_per_sec.is_finite() {
            bytes_per_sec.max(0.0)
        } else {
            0.0
        };
        self.speed.store(value.to_bits(), Ordering::SeqCst);
    }

    pub(crate) fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Invalidate the running session and return the id of the next one.
    pub(crate) fn next_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn source(&self) -> Source {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_source(&self, source: Source) {
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = source;
    }

    pub(crate) fn set_final_url(&self, final_url: String) {
        self.source
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .final_url = Some(final_url);
    }

    pub fn last_attempt_at(&self) -> DateTime<Utc> {
        *lock(&self.last_attempt_at)
    }

    pub(crate) fn touch_attempt(&self) {
        *lock(&self.last_attempt_at) = Utc::now();
    }

    pub(crate) fn plan(&self) -> Option<Arc<SegmentPlan>> {
        lock(&self.plan).clone()
    }

    pub(crate) fn set_plan(&self, plan: Option<Arc<SegmentPlan>>) {
        *lock(&self.plan) = plan;
    }

    pub fn record(&self) -> TransferRecord {
        let source = self.source();
        TransferRecord {
            file_name: self.file_name.clone(),
            source_url: source.source_url,
            final_url: source.final_url,
            destination_path: self.id.clone(),
            request_headers: source.headers,
            total_size: self.total_size(),
            downloaded_bytes: self.downloaded(),
            speed: self.speed(),
            status: self.status(),
            created_at: self.created_at,
            last_attempt_at: self.last_attempt_at(),
        }
    }
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
