//! Change notifications for whoever renders the transfer list.
//!
//! Workers and the lifecycle manager call [`EventHub::notify`], which only
//! pushes onto an unbounded channel. A single dispatcher task drains it and
//! hands each event to the registered [`TransferObserver`], so a slow
//! observer never stalls a download.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::state::{TransferRecord, TransferStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A record entered the registry (new download or restored snapshot).
    Added { record: TransferRecord },
    StatusChanged {
        id: PathBuf,
        status: TransferStatus,
        record: TransferRecord,
    },
    /// Throttled byte-count update; `speed` is the last sampled value.
    Progress {
        id: PathBuf,
        downloaded: u64,
        total: Option<u64>,
        speed: f64,
    },
    Failed { id: PathBuf, error: String },
    Removed { id: PathBuf },
}

impl TransferEvent {
    pub fn id(&self) -> &std::path::Path {
        match self {
            Self::Added { record } => &record.destination_path,
            Self::StatusChanged { id, .. }
            | Self::Progress { id, .. }
            | Self::Failed { id, .. }
            | Self::Removed { id } => id,
        }
    }
}

/// Receives events on the dispatcher task, one at a time.
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

/// Observer that drops everything.
pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn on_event(&self, _event: &TransferEvent) {}
}

impl<F> TransferObserver for F
where
    F: Fn(&TransferEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransferEvent) {
        self(event)
    }
}

/// Sending half of the notification channel. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl EventHub {
    /// Start the dispatcher task. It ends once every hub clone is dropped.
    pub fn spawn(observer: Arc<dyn TransferObserver>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                observer.on_event(&event);
            }
            trace!("Event dispatcher stopped");
        });
        (Self { tx }, handle)
    }

    /// Fire and continue; a closed dispatcher is not an error for the caller.
    pub fn notify(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}
