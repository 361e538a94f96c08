use anyhow::{Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use segdl::{Downloader, Summary, TransferEvent, TransferObserver, TransferRecord, TransferStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::Args;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";

/// Renders engine events as one progress bar per transfer.
struct ProgressDisplay {
    multi: MultiProgress,
    header: ProgressBar,
    bars: Mutex<HashMap<PathBuf, ProgressBar>>,
}

impl ProgressDisplay {
    fn new() -> Self {
        let multi = MultiProgress::new();
        multi.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header = multi.add(ProgressBar::new(0));
        header.set_style(
            ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        header.set_message("Summary: resolving...");

        Self {
            multi,
            header,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, record: &TransferRecord) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        bars.entry(record.destination_path.clone())
            .or_insert_with(|| {
                let pb = self
                    .multi
                    .add(ProgressBar::new(record.total_size.unwrap_or(0)));
                pb.set_style(
                    ProgressStyle::with_template(BAR_TEMPLATE)
                        .map(|style| style.progress_chars("=>-"))
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                pb.set_position(record.downloaded_bytes);
                pb
            })
            .clone()
    }

    fn existing(&self, id: &Path) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn set_summary(&self, summary: &Summary) {
        self.header.set_message(format!(
            "Summary: Files: {}/{} | Active: {} | Held: {} | Failed: {} | Speed: {}/s",
            summary.completed,
            summary.transfers,
            summary.active,
            summary.held,
            summary.failed,
            HumanBytes(summary.speed as u64)
        ));
        self.header.tick();
    }
}

impl TransferObserver for ProgressDisplay {
    fn on_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Added { record } => {
                if !matches!(
                    record.status,
                    TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
                ) {
                    self.bar(record).set_message(format!("Queued      {}", record.file_name));
                }
            }
            TransferEvent::Progress {
                id,
                downloaded,
                total,
                ..
            } => {
                if let Some(pb) = self.existing(id) {
                    if let Some(total) = total {
                        pb.set_length(*total);
                    }
                    pb.set_position(*downloaded);
                }
            }
            TransferEvent::StatusChanged { record, .. } => {
                let pb = self.bar(record);
                let name = &record.file_name;
                match record.status {
                    TransferStatus::InProgress => pb.set_message(format!("Downloading {name}")),
                    TransferStatus::Hold => pb.set_message(format!("Waiting     {name}")),
                    TransferStatus::Paused => pb.set_message(format!("Paused      {name}")),
                    TransferStatus::Completed => {
                        if let Some(total) = record.total_size {
                            pb.set_length(total);
                            pb.set_position(total);
                        }
                        pb.finish_with_message(format!("Completed   {name}"));
                    }
                    TransferStatus::Cancelled => {
                        pb.abandon_with_message(format!("Cancelled   {name}"))
                    }
                    // The preceding `Failed` event already carries the reason.
                    TransferStatus::Failed | TransferStatus::Pending => {}
                }
            }
            TransferEvent::Failed { id, error } => {
                if let Some(pb) = self.existing(id) {
                    let name = id
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    pb.abandon_with_message(format!("Failed      {name}: {error}"));
                }
            }
            TransferEvent::Removed { id } => {
                let removed = self
                    .bars
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
                if let Some(pb) = removed {
                    self.multi.remove(&pb);
                }
            }
        }
    }
}

/// URLs from a tasks file, one per line. Blank lines and `#` comments are
/// skipped.
pub async fn read_tasks_file(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open tasks file: {:?}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut urls = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        urls.push(raw.to_string());
    }
    Ok(urls)
}

pub async fn load_state(path: &Path) -> Result<Vec<TransferRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read state file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Corrupt state file: {:?}", path))
}

pub async fn save_state(path: &Path, records: &[TransferRecord]) -> Result<()> {
    let content = serde_json::to_string_pretty(records)?;
    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write state file: {:?}", path))
}

pub async fn run_downloads(args: Args) -> Result<()> {
    let output = &args.download_dir;
    if !output.exists() {
        fs::create_dir_all(output)
            .await
            .context("Failed to create download directory")?;
    }

    let mut urls = args.urls.clone();
    if let Some(tasks_file) = &args.tasks_file {
        urls.extend(read_tasks_file(tasks_file).await?);
    }

    let display = Arc::new(ProgressDisplay::new());
    let downloader = Downloader::new(args.engine_config(), display.clone());

    let state_file = args.state_file();
    let previous = load_state(&state_file).await?;
    if !previous.is_empty() {
        let restored = downloader
            .restore(previous)
            .context("Failed to restore previous transfers")?;
        info!(restored, "Loaded previous transfers");
    }
    if args.resume {
        let resumed = downloader.resume_all();
        info!(resumed, "Resuming paused transfers");
    }

    let headers = args.request_headers();
    for url in &urls {
        if let Err(e) = downloader.enqueue(url, output, headers.clone()).await {
            warn!(url = %url, error = %e, "Could not add download");
        }
    }
    save_state(&state_file, &downloader.snapshot()).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                let paused = downloader.pause_all();
                info!(paused, "Interrupted, pausing transfers");
                break;
            }
            _ = ticker.tick() => {
                let summary = downloader.summary();
                display.set_summary(&summary);
                if summary.active == 0 && summary.held == 0 {
                    break;
                }
            }
        }
    }

    save_state(&state_file, &downloader.snapshot()).await?;
    let summary = downloader.summary();
    display.set_summary(&summary);
    display.header.finish();
    if summary.failed > 0 {
        warn!(failed = summary.failed, "Some downloads failed; see {:?}", state_file);
    }
    Ok(())
}

pub async fn list_downloads(args: &Args) -> Result<()> {
    let state_file = args.state_file();
    let records = load_state(&state_file).await?;
    if records.is_empty() {
        println!("No transfers recorded in '{:?}'.", args.download_dir);
        println!("Tip: If you used a custom download directory, please specify it with --download-dir");
        return Ok(());
    }

    let completed = records
        .iter()
        .filter(|r| r.status == TransferStatus::Completed)
        .count();
    let downloaded: u64 = records.iter().map(|r| r.downloaded_bytes).sum();
    let known: u64 = records.iter().filter_map(|r| r.total_size).sum();
    println!(
        "Summary: Files: {}/{} | Downloaded: {} / {}",
        completed,
        records.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();

    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");
    for record in &records {
        let progress = record
            .progress()
            .map(|p| format!("{:.2}%", p * 100.0))
            .unwrap_or_else(|| "-".to_string());
        let size = record
            .total_size
            .map(|s| HumanBytes(s).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            record.file_name,
            record.status.as_str(),
            progress,
            size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn tasks_file_skips_blank_lines_and_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download.txt");
        fs::write(&path, "# mirrors\nhttp://a/1.bin\n\n  http://a/2.bin  \n")
            .await
            .unwrap();

        let urls = read_tasks_file(&path).await.unwrap();
        assert_eq!(urls, vec!["http://a/1.bin", "http://a/2.bin"]);
    }

    #[tokio::test]
    async fn state_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segdl.json");
        assert!(load_state(&path).await.unwrap().is_empty());

        let record = TransferRecord {
            file_name: "a.bin".to_string(),
            source_url: "http://a/a.bin".to_string(),
            final_url: Some("http://cdn/a.bin".to_string()),
            destination_path: dir.path().join("a.bin"),
            request_headers: BTreeMap::new(),
            total_size: Some(10),
            downloaded_bytes: 4,
            speed: 0.0,
            status: TransferStatus::Paused,
            created_at: Utc::now(),
            last_attempt_at: Utc::now(),
        };
        save_state(&path, &[record.clone()]).await.unwrap();

        let loaded = load_state(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].destination_path, record.destination_path);
        assert_eq!(loaded[0].status, TransferStatus::Paused);
        assert_eq!(loaded[0].downloaded_bytes, 4);
    }
}
