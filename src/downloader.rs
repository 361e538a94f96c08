//! Transfer lifecycle: start, pause, resume, cancel and the admission hand-off
//! between them.
//!
//! Every status transition happens under the `runs` lock, which also owns the
//! abort handle of each live run. A run carries the session number it was
//! started with; completion and failure reports from an older session are
//! ignored, so a run aborted by `pause` or `cancel` can never flip the record
//! afterwards.

use reqwest::Client;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, OpenOptions};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionController};
use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::observer::{EventHub, TransferEvent, TransferObserver};
use crate::planner::SegmentPlan;
use crate::pool::WorkerSupervisor;
use crate::progress::ProgressAggregator;
use crate::registry::Registry;
use crate::resolver;
use crate::state::{lock, Source, Transfer, TransferRecord, TransferStatus};
use crate::utils::{get_filename_from_url, sanitize_filename};
use crate::worker::{run_segment, RunContext, SegmentOutcome};

/// Totals for a status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub transfers: usize,
    pub active: usize,
    pub held: usize,
    pub completed: usize,
    pub failed: usize,
    /// Sum of the current speeds of running transfers, bytes/s.
    pub speed: f64,
}

struct ActiveRun {
    session: u64,
    handle: AbortHandle,
}

enum RunOutcome {
    Completed(Arc<ProgressAggregator>),
    Interrupted,
}

type Runs = HashMap<PathBuf, ActiveRun>;

struct Lifecycle {
    client: Client,
    config: EngineConfig,
    registry: Registry,
    admission: AdmissionController,
    supervisor: WorkerSupervisor,
    events: EventHub,
    runtime: Handle,
    runs: Mutex<Runs>,
}

fn is_current(transfer: &Transfer, session: u64) -> bool {
    transfer.session() == session && transfer.status() == TransferStatus::InProgress
}

fn forget_run(runs: &mut Runs, id: &Path, session: u64) {
    if runs.get(id).is_some_and(|run| run.session == session) {
        runs.remove(id);
    }
}

/// Create the destination (and its directory) from scratch, preallocated
/// when the size is known.
async fn prepare_destination(path: &Path, size: Option<u64>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::storage(parent, &e))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::storage(path, &e))?;
    if let Some(size) = size {
        file.set_len(size)
            .await
            .map_err(|e| DownloadError::storage(path, &e))?;
    }
    Ok(())
}

async fn discard_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Deleted file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete file"),
    }
}

impl Lifecycle {
    fn transfer(&self, id: &Path) -> Result<Arc<Transfer>> {
        self.registry.get(id).ok_or_else(|| DownloadError::NotFound {
            id: id.to_path_buf(),
        })
    }

    fn notify_status(&self, transfer: &Transfer) {
        self.events.notify(TransferEvent::StatusChanged {
            id: transfer.id().to_path_buf(),
            status: transfer.status(),
            record: transfer.record(),
        });
    }

    /// Spawn a run for a transfer that already holds an admission slot.
    fn launch(self: &Arc<Self>, runs: &mut Runs, transfer: &Arc<Transfer>) {
        let session = transfer.next_session();
        transfer.touch_attempt();
        transfer.set_speed(0.0);
        transfer.set_status(TransferStatus::InProgress);

        let lifecycle = Arc::clone(self);
        let run = Arc::clone(transfer);
        let handle = self
            .runtime
            .spawn(async move { lifecycle.drive(run, session).await });
        let active = ActiveRun {
            session,
            handle: handle.abort_handle(),
        };
        if let Some(stale) = runs.insert(transfer.id().to_path_buf(), active) {
            stale.handle.abort();
        }
        info!(path = %transfer.id().display(), session, "Transfer started");
    }

    /// Ask for a slot: start now, or park the transfer in `hold`.
    fn admit(self: &Arc<Self>, runs: &mut Runs, transfer: &Arc<Transfer>) -> Admission {
        let admission = self
            .admission
            .admit(transfer.id(), transfer.last_attempt_at());
        match admission {
            Admission::Started => self.launch(runs, transfer),
            Admission::Held => {
                transfer.set_speed(0.0);
                transfer.set_status(TransferStatus::Hold);
                info!(path = %transfer.id().display(), "Transfer held");
            }
        }
        admission
    }

    /// Stop a run that lost its slot and park it in `hold`. Its checkpoints
    /// stay, so it continues where it stopped once promoted again.
    fn demote(&self, runs: &mut Runs, transfer: &Arc<Transfer>) {
        match transfer.status() {
            TransferStatus::InProgress => {
                transfer.set_status(TransferStatus::Paused);
                transfer.set_speed(0.0);
                if let Some(run) = runs.remove(transfer.id()) {
                    run.handle.abort();
                }
                self.notify_status(transfer);
            }
            // Promoted but not started yet: only the slot goes back.
            TransferStatus::Hold => {
                self.admission.hold(transfer.id(), transfer.last_attempt_at());
                return;
            }
            _ => return,
        }
        transfer.set_status(TransferStatus::Hold);
        self.admission.hold(transfer.id(), transfer.last_attempt_at());
        info!(path = %transfer.id().display(), "Transfer held over the parallel limit");
        self.notify_status(transfer);
    }

    /// Start transfers promoted out of the held set. Slots reserved for
    /// records that are gone or no longer waiting are handed back.
    fn promote(self: &Arc<Self>, mut promoted: Vec<PathBuf>) {
        while !promoted.is_empty() {
            let mut started = Vec::new();
            let mut freed = Vec::new();
            {
                let mut runs = lock(&self.runs);
                for id in promoted.drain(..) {
                    // Demoted again before it could start.
                    if !self.admission.is_active(&id) {
                        continue;
                    }
                    match self.registry.get(&id) {
                        Some(transfer) if transfer.status() == TransferStatus::Hold => {
                            self.launch(&mut runs, &transfer);
                            started.push(transfer);
                        }
                        // Already started through an earlier promotion.
                        Some(transfer) if transfer.status() == TransferStatus::InProgress => {}
                        _ => freed.extend(self.admission.release(&id)),
                    }
                }
            }
            for transfer in &started {
                self.notify_status(transfer);
            }
            promoted = freed;
        }
    }

    async fn drive(self: Arc<Self>, transfer: Arc<Transfer>, session: u64) {
        match self.execute(&transfer, session).await {
            Ok(RunOutcome::Completed(progress)) => self.finish(&transfer, session, &progress),
            Ok(RunOutcome::Interrupted) => {
                debug!(path = %transfer.id().display(), session, "Run interrupted")
            }
            Err(err) => self.fail(&transfer, session, err),
        }
    }

    async fn execute(&self, transfer: &Arc<Transfer>, session: u64) -> Result<RunOutcome> {
        let source = transfer.source();
        let url = match source.final_url {
            Some(url) => url,
            None => {
                let meta =
                    resolver::resolve(&self.client, &source.source_url, &source.headers).await?;
                transfer.set_final_url(meta.final_url.clone());
                transfer.set_total_size(meta.size);
                meta.final_url
            }
        };

        let plan = match transfer.plan() {
            Some(plan) => plan,
            None => {
                let plan = Arc::new(SegmentPlan::new(
                    transfer.total_size(),
                    self.config.segments,
                ));
                let size = transfer.total_size().filter(|_| plan.is_ranged());
                prepare_destination(transfer.id(), size).await?;
                let installed = {
                    let _runs = lock(&self.runs);
                    let current = is_current(transfer, session);
                    if current {
                        transfer.set_downloaded(0);
                        transfer.set_plan(Some(Arc::clone(&plan)));
                    }
                    current
                };
                if !installed {
                    // Cancelled while the file was being created.
                    if transfer.status() == TransferStatus::Cancelled {
                        discard_file(transfer.id()).await;
                    }
                    return Ok(RunOutcome::Interrupted);
                }
                debug!(
                    path = %transfer.id().display(),
                    segments = plan.len(),
                    ranged = plan.is_ranged(),
                    "Planned transfer"
                );
                plan
            }
        };

        let progress = Arc::new(ProgressAggregator::new(
            transfer.downloaded(),
            self.config.publish_every,
            self.config.speed_interval,
        ));
        let ctx = Arc::new(RunContext {
            transfer: Arc::clone(transfer),
            session,
            plan: Arc::clone(&plan),
            client: self.client.clone(),
            url,
            headers: source.headers,
            progress: Arc::clone(&progress),
            events: self.events.clone(),
            chunk_size: self.config.chunk_size,
            read_timeout: self.config.read_timeout,
        });

        let pending: Vec<usize> = plan
            .slots()
            .iter()
            .filter(|slot| !slot.is_finished())
            .map(|slot| slot.segment.id)
            .collect();
        let mut completed = plan.len() - pending.len();

        let mut pool = self.supervisor.acquire(pending.len()).await?;
        for &segment in &pending {
            pool.spawn(run_segment(Arc::clone(&ctx), segment));
        }

        // Returning early drops the pool, which aborts the remaining workers.
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Ok(SegmentOutcome::Completed)) => completed += 1,
                Ok(Ok(SegmentOutcome::Interrupted)) => return Ok(RunOutcome::Interrupted),
                Ok(Err(err)) => return Err(err),
                Err(err) if err.is_cancelled() => return Ok(RunOutcome::Interrupted),
                Err(err) => return Err(DownloadError::Pool(err.to_string())),
            }
        }

        if completed == plan.len() {
            Ok(RunOutcome::Completed(progress))
        } else {
            Ok(RunOutcome::Interrupted)
        }
    }

    fn finish(self: &Arc<Self>, transfer: &Arc<Transfer>, session: u64, progress: &ProgressAggregator) {
        {
            let mut runs = lock(&self.runs);
            if !is_current(transfer, session) {
                return;
            }
            forget_run(&mut runs, transfer.id(), session);
            let total = transfer.total_size().unwrap_or_else(|| transfer.downloaded());
            transfer.set_total_size(Some(total));
            transfer.set_downloaded(total);
            transfer.set_speed(progress.final_speed(total));
            transfer.set_plan(None);
            transfer.set_status(TransferStatus::Completed);
        }
        info!(
            path = %transfer.id().display(),
            bytes = transfer.downloaded(),
            speed = transfer.speed(),
            "Transfer completed"
        );
        self.notify_status(transfer);
        self.promote(self.admission.release(transfer.id()));
    }

    /// Errors from a run that was paused, cancelled or superseded are dropped.
    fn fail(self: &Arc<Self>, transfer: &Arc<Transfer>, session: u64, err: DownloadError) {
        {
            let mut runs = lock(&self.runs);
            if !is_current(transfer, session) {
                debug!(path = %transfer.id().display(), error = %err, "Ignoring error from stale run");
                return;
            }
            forget_run(&mut runs, transfer.id(), session);
            transfer.set_speed(0.0);
            transfer.set_status(TransferStatus::Failed);
        }
        warn!(path = %transfer.id().display(), error = %err, "Transfer failed");
        self.events.notify(TransferEvent::Failed {
            id: transfer.id().to_path_buf(),
            error: err.to_string(),
        });
        self.notify_status(transfer);
        self.promote(self.admission.release(transfer.id()));
    }
}

/// Handle to the download engine. Cheap to clone; all clones drive the same
/// set of transfers.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Lifecycle>,
}

impl Downloader {
    /// Create an engine that reports every change to `observer`.
    ///
    /// Must be called from within a Tokio runtime; runs are spawned onto it.
    pub fn new(config: EngineConfig, observer: Arc<dyn TransferObserver>) -> Self {
        let config = config.normalized();
        let (events, _dispatcher) = EventHub::spawn(observer);
        let inner = Lifecycle {
            client: config.build_client(),
            registry: Registry::new(),
            admission: AdmissionController::new(config.max_parallel),
            supervisor: WorkerSupervisor::new(config.max_parallel * config.segments),
            events,
            runtime: Handle::current(),
            runs: Mutex::new(HashMap::new()),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Resolve `url`, register a transfer into `destination_dir` and start or
    /// hold it. A resolution failure is not an error here: the record is
    /// registered as `failed` and returned.
    pub async fn enqueue(
        &self,
        url: &str,
        destination_dir: impl AsRef<Path>,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<TransferRecord> {
        let inner = &self.inner;
        let headers = headers
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| inner.config.default_headers.clone());
        let dir = destination_dir.as_ref();

        let meta = match resolver::resolve(&inner.client, url, &headers).await {
            Ok(meta) => meta,
            Err(err) => {
                let file_name = get_filename_from_url(url)
                    .map(|name| sanitize_filename(&name))
                    .unwrap_or_else(|| sanitize_filename(""));
                let transfer = Arc::new(Transfer::new(
                    dir.join(&file_name),
                    file_name,
                    Source {
                        source_url: url.to_string(),
                        final_url: None,
                        headers,
                    },
                    None,
                ));
                transfer.set_status(TransferStatus::Failed);
                inner.registry.add(Arc::clone(&transfer))?;
                warn!(url, error = %err, "Could not resolve download");
                inner.events.notify(TransferEvent::Added {
                    record: transfer.record(),
                });
                inner.events.notify(TransferEvent::Failed {
                    id: transfer.id().to_path_buf(),
                    error: err.to_string(),
                });
                return Ok(transfer.record());
            }
        };

        let transfer = Arc::new(Transfer::new(
            dir.join(&meta.file_name),
            meta.file_name,
            Source {
                source_url: url.to_string(),
                final_url: Some(meta.final_url),
                headers,
            },
            meta.size,
        ));
        inner.registry.add(Arc::clone(&transfer))?;
        info!(
            url,
            path = %transfer.id().display(),
            size = ?transfer.total_size(),
            "Enqueued transfer"
        );

        // Admit before announcing, so observers never see a pending record.
        // Sent under the lock, so they precede any status change of the run.
        {
            let mut runs = lock(&inner.runs);
            inner.admit(&mut runs, &transfer);
            inner.events.notify(TransferEvent::Added {
                record: transfer.record(),
            });
            inner.notify_status(&transfer);
        }
        Ok(transfer.record())
    }

    /// Stop a running or held transfer, keeping its checkpoints. Pausing
    /// anything else is a no-op.
    pub fn pause(&self, id: &Path) -> Result<TransferRecord> {
        let inner = &self.inner;
        let transfer = inner.transfer(id)?;
        let was_running = {
            let mut runs = lock(&inner.runs);
            match transfer.status() {
                TransferStatus::InProgress => {
                    // Status first: workers see it on their next chunk even if
                    // the abort lands later.
                    transfer.set_status(TransferStatus::Paused);
                    transfer.set_speed(0.0);
                    if let Some(run) = runs.remove(id) {
                        run.handle.abort();
                    }
                    true
                }
                TransferStatus::Hold => {
                    transfer.set_status(TransferStatus::Paused);
                    inner.admission.withdraw(id);
                    false
                }
                _ => return Ok(transfer.record()),
            }
        };
        info!(path = %id.display(), bytes = transfer.downloaded(), "Transfer paused");
        inner.notify_status(&transfer);
        if was_running {
            inner.promote(inner.admission.release(id));
        }
        Ok(transfer.record())
    }

    /// Continue a paused transfer from its checkpoints, or hold it when no
    /// slot is free. Resuming a running or held transfer is a no-op.
    pub fn resume(&self, id: &Path) -> Result<TransferRecord> {
        let inner = &self.inner;
        let transfer = inner.transfer(id)?;
        {
            let mut runs = lock(&inner.runs);
            match transfer.status() {
                TransferStatus::Paused => {
                    inner.admit(&mut runs, &transfer);
                }
                TransferStatus::InProgress | TransferStatus::Hold => {
                    return Ok(transfer.record())
                }
                status => {
                    return Err(DownloadError::InvalidTransition {
                        id: id.to_path_buf(),
                        status,
                        action: "resume",
                    })
                }
            }
        }
        inner.notify_status(&transfer);
        Ok(transfer.record())
    }

    /// Stop the transfer, delete its partial file and discard progress.
    /// Cancelling a finished transfer is a no-op.
    pub async fn cancel(&self, id: &Path) -> Result<TransferRecord> {
        let inner = &self.inner;
        let transfer = inner.transfer(id)?;
        {
            let mut runs = lock(&inner.runs);
            if transfer.status().is_terminal() {
                return Ok(transfer.record());
            }
            transfer.set_status(TransferStatus::Cancelled);
            transfer.next_session();
            if let Some(run) = runs.remove(id) {
                run.handle.abort();
            }
            inner.admission.withdraw(id);
            transfer.set_downloaded(0);
            transfer.set_speed(0.0);
            transfer.set_plan(None);
        }
        info!(path = %id.display(), "Transfer cancelled");
        discard_file(id).await;
        inner.notify_status(&transfer);
        inner.promote(inner.admission.release(id));
        Ok(transfer.record())
    }

    /// Restart a failed or cancelled transfer. A failed one continues from
    /// its checkpoints; a cancelled one starts over.
    pub fn retry(&self, id: &Path) -> Result<TransferRecord> {
        let inner = &self.inner;
        let transfer = inner.transfer(id)?;
        {
            let mut runs = lock(&inner.runs);
            match transfer.status() {
                TransferStatus::Failed | TransferStatus::Cancelled => {
                    inner.admit(&mut runs, &transfer);
                }
                status => {
                    return Err(DownloadError::InvalidTransition {
                        id: id.to_path_buf(),
                        status,
                        action: "retry",
                    })
                }
            }
        }
        inner.notify_status(&transfer);
        Ok(transfer.record())
    }

    /// Point a stopped transfer at a new URL (and optionally new headers).
    /// The next start resolves the URL again and downloads from byte 0.
    pub fn update_source(
        &self,
        id: &Path,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<TransferRecord> {
        let inner = &self.inner;
        let transfer = inner.transfer(id)?;
        {
            let _runs = lock(&inner.runs);
            let status = transfer.status();
            if status == TransferStatus::InProgress {
                return Err(DownloadError::InvalidTransition {
                    id: id.to_path_buf(),
                    status,
                    action: "update the source of",
                });
            }
            let headers = headers.unwrap_or_else(|| transfer.source().headers);
            transfer.set_source(Source {
                source_url: url.to_string(),
                final_url: None,
                headers,
            });
            transfer.set_plan(None);
        }
        info!(path = %id.display(), url, "Transfer source updated");
        inner.notify_status(&transfer);
        Ok(transfer.record())
    }

    /// Detach a transfer, cancelling it first if it is not finished. With
    /// `delete_file` the downloaded file is removed as well.
    pub async fn remove(&self, id: &Path, delete_file: bool) -> Result<TransferRecord> {
        let transfer = self.inner.transfer(id)?;
        if !transfer.status().is_terminal() {
            self.cancel(id).await?;
        } else if delete_file {
            discard_file(id).await;
        }
        self.inner.registry.remove(id);
        info!(path = %id.display(), "Transfer removed");
        self.inner
            .events
            .notify(TransferEvent::Removed { id: id.to_path_buf() });
        Ok(transfer.record())
    }

    /// Pause every running and held transfer. Returns how many were paused.
    pub fn pause_all(&self) -> usize {
        let mut paused = 0;
        for transfer in self.inner.registry.list() {
            if matches!(
                transfer.status(),
                TransferStatus::InProgress | TransferStatus::Hold
            ) && self.pause(transfer.id()).is_ok()
            {
                paused += 1;
            }
        }
        paused
    }

    /// Resume every paused transfer through admission.
    pub fn resume_all(&self) -> usize {
        let mut resumed = 0;
        for transfer in self.inner.registry.list_by_status(TransferStatus::Paused) {
            if self.resume(transfer.id()).is_ok() {
                resumed += 1;
            }
        }
        resumed
    }

    /// Change the cap on running transfers. Raising it starts held
    /// transfers immediately. Lowering it stops the most recently started
    /// runs, keeping their checkpoints, and holds them until a slot frees up.
    pub fn set_max_parallel(&self, max_parallel: usize) {
        let inner = &self.inner;
        let max_parallel = max_parallel.max(1);
        inner
            .supervisor
            .ensure_capacity(max_parallel * inner.config.segments);
        let promoted = {
            let mut runs = lock(&inner.runs);
            let rebalance = inner.admission.set_max_parallel(max_parallel);
            for id in &rebalance.demoted {
                if let Some(transfer) = inner.registry.get(id) {
                    inner.demote(&mut runs, &transfer);
                }
            }
            rebalance.promoted
        };
        info!(max_parallel, "Parallel transfer limit changed");
        inner.promote(promoted);
    }

    pub fn max_parallel(&self) -> usize {
        self.inner.admission.max_parallel()
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for transfer in self.inner.registry.list() {
            summary.transfers += 1;
            match transfer.status() {
                TransferStatus::InProgress => {
                    summary.active += 1;
                    summary.speed += transfer.speed();
                }
                TransferStatus::Hold => summary.held += 1,
                TransferStatus::Completed => summary.completed += 1,
                TransferStatus::Failed => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }

    /// Records of every transfer, in registration order.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|t| t.record())
            .collect()
    }

    /// Register previously snapshotted records without resolving them again.
    /// Unfinished records come back `paused`; resuming them restarts from
    /// byte 0 since segment checkpoints are not part of the snapshot.
    pub fn restore(&self, records: Vec<TransferRecord>) -> Result<usize> {
        let mut restored = 0;
        for mut record in records {
            if !record.status.is_terminal() {
                record.status = TransferStatus::Paused;
            }
            let transfer = Arc::new(Transfer::from_record(record));
            self.inner.registry.add(Arc::clone(&transfer))?;
            self.inner.events.notify(TransferEvent::Added {
                record: transfer.record(),
            });
            restored += 1;
        }
        debug!(restored, "Restored transfers");
        Ok(restored)
    }

    pub fn get(&self, id: &Path) -> Option<TransferRecord> {
        self.inner.registry.get(id).map(|t| t.record())
    }

    pub fn list(&self) -> Vec<TransferRecord> {
        self.snapshot()
    }

    pub fn list_by_status(&self, status: TransferStatus) -> Vec<TransferRecord> {
        self.inner
            .registry
            .list_by_status(status)
            .iter()
            .map(|t| t.record())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const MIB: u64 = 1024 * 1024;

    fn body(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn range_responder(body: Vec<u8>) -> impl Fn(&Request) -> ResponseTemplate {
        move |req: &Request| {
            let Some(range) = req.headers.get("Range") else {
                return ResponseTemplate::new(200).set_body_bytes(body.clone());
            };
            let spec = range.to_str().unwrap().strip_prefix("bytes=").unwrap();
            let (start, end) = spec.split_once('-').unwrap();
            let start: usize = start.parse().unwrap();
            let end: usize = if end.is_empty() { body.len() - 1 } else { end.parse().unwrap() };
            ResponseTemplate::new(206)
                .append_header("Content-Range", format!("bytes {start}-{end}/{}", body.len()))
                .set_body_bytes(body[start..=end].to_vec())
        }
    }

    async fn wait_for(downloader: &Downloader, id: &Path, status: TransferStatus) {
        tokio::time::timeout(Duration::from_secs(20), async {
            while downloader.get(id).map(|r| r.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reached {status}", id.display()));
    }

    #[tokio::test]
    async fn resume_continues_every_segment_from_its_own_checkpoint() {
        let total = 8 * MIB;
        let content = body(total);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(range_responder(content.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let downloader = Downloader::new(EngineConfig::default(), Arc::new(NoopObserver));

        // A four-segment transfer paused after each segment wrote >= 1 MiB.
        let transfer = Arc::new(Transfer::new(
            path.clone(),
            "big.bin".to_string(),
            Source {
                source_url: server.uri(),
                final_url: Some(server.uri()),
                headers: BTreeMap::new(),
            },
            Some(total),
        ));
        let plan = Arc::new(SegmentPlan::new(Some(total), 4));
        let mut file = vec![0u8; total as usize];
        let mut written = 0;
        let mut expected_ranges = Vec::new();
        for slot in plan.slots() {
            let start = slot.segment.range_start;
            let checkpoint = start + MIB + 17 * slot.segment.id as u64;
            file[start as usize..checkpoint as usize]
                .copy_from_slice(&content[start as usize..checkpoint as usize]);
            *slot.lock_checkpoint() = checkpoint;
            written += checkpoint - start;
            expected_ranges.push(format!(
                "bytes={checkpoint}-{}",
                slot.segment.range_end.unwrap()
            ));
        }
        std::fs::write(&path, &file).unwrap();
        transfer.set_plan(Some(plan));
        transfer.set_downloaded(written);
        transfer.set_status(TransferStatus::Paused);
        downloader.inner.registry.add(transfer).unwrap();

        downloader.resume(&path).unwrap();
        wait_for(&downloader, &path, TransferStatus::Completed).await;

        let mut ranges: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.headers.get("Range").map(|v| v.to_str().unwrap().to_string()))
            .collect();
        ranges.sort();
        expected_ranges.sort();
        assert_eq!(ranges, expected_ranges);

        assert_eq!(std::fs::read(&path).unwrap(), content);
        let record = downloader.get(&path).unwrap();
        assert_eq!(record.downloaded_bytes, total);
        assert!(record.speed >= 0.0);
    }

    #[tokio::test]
    async fn segment_failure_fails_the_transfer_and_keeps_checkpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.bin");
        let downloader = Downloader::new(EngineConfig::default(), Arc::new(NoopObserver));

        let transfer = Arc::new(Transfer::new(
            path.clone(),
            "broken.bin".to_string(),
            Source {
                source_url: server.uri(),
                final_url: Some(server.uri()),
                headers: BTreeMap::new(),
            },
            Some(1000),
        ));
        transfer.set_status(TransferStatus::Paused);
        downloader.inner.registry.add(Arc::clone(&transfer)).unwrap();

        downloader.resume(&path).unwrap();
        wait_for(&downloader, &path, TransferStatus::Failed).await;

        assert!(transfer.plan().is_some(), "checkpoints survive a failure");
        assert_eq!(downloader.summary().failed, 1);
        assert_eq!(downloader.inner.admission.active_count(), 0);
    }

    #[tokio::test]
    async fn cap_changes_keep_the_worker_budget_bounded() {
        let config = EngineConfig {
            max_parallel: 4,
            segments: 4,
            ..EngineConfig::default()
        };
        let downloader = Downloader::new(config, Arc::new(NoopObserver));
        let supervisor = &downloader.inner.supervisor;
        assert_eq!(supervisor.capacity(), 16);

        for _ in 0..10 {
            downloader.set_max_parallel(1);
            downloader.set_max_parallel(4);
        }
        assert_eq!(supervisor.capacity(), 16);
        assert_eq!(supervisor.available(), 16);

        downloader.set_max_parallel(6);
        assert_eq!(supervisor.capacity(), 24);
    }

    #[tokio::test]
    async fn unknown_operations_report_not_found() {
        let downloader = Downloader::new(EngineConfig::default(), Arc::new(NoopObserver));
        let err = downloader.pause(Path::new("/nowhere.bin")).unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
    }
}
