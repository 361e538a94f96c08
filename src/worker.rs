//! Segment worker: fetches one byte range and writes it in place.

use futures::TryStreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::observer::{EventHub, TransferEvent};
use crate::planner::SegmentPlan;
use crate::progress::{ProgressAggregator, Publish};
use crate::state::{Transfer, TransferStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Every byte of the range is on disk.
    Completed,
    /// Stopped because the transfer was paused, held or restarted.
    Interrupted,
}

/// Everything the workers of one transfer run share.
pub struct RunContext {
    pub transfer: Arc<Transfer>,
    pub session: u64,
    pub plan: Arc<SegmentPlan>,
    pub client: Client,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub progress: Arc<ProgressAggregator>,
    pub events: EventHub,
    pub chunk_size: usize,
    pub read_timeout: Duration,
}

impl RunContext {
    /// Still the live run and not paused, held or cancelled.
    fn should_continue(&self) -> bool {
        self.transfer.session() == self.session
            && self.transfer.status() == TransferStatus::InProgress
    }

    fn publish_progress(&self, downloaded: u64) {
        self.events.notify(TransferEvent::Progress {
            id: self.transfer.id().to_path_buf(),
            downloaded,
            total: self.transfer.total_size(),
            speed: self.transfer.speed(),
        });
    }
}

pub async fn run_segment(ctx: Arc<RunContext>, segment_id: usize) -> Result<SegmentOutcome> {
    let slot = ctx
        .plan
        .slot(segment_id)
        .ok_or_else(|| DownloadError::Pool(format!("no segment {segment_id} in plan")))?;
    let segment = slot.segment;

    if slot.is_finished() {
        return Ok(SegmentOutcome::Completed);
    }
    let mut position = slot.checkpoint();
    if segment.range_end.is_some_and(|end| position > end) {
        slot.mark_finished();
        return Ok(SegmentOutcome::Completed);
    }

    let mut request = ctx.client.get(&ctx.url);
    for (name, value) in &ctx.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    match segment.range_end {
        Some(end) if ctx.plan.is_ranged() => {
            request = request.header(RANGE, format!("bytes={position}-{end}"));
        }
        _ if position > 0 => {
            request = request.header(RANGE, format!("bytes={position}-"));
        }
        _ => {}
    }

    debug!(
        path = %ctx.transfer.id().display(),
        segment = segment_id,
        from = position,
        to = ?segment.range_end,
        "Starting segment"
    );

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::network_with_status(
            format!("Segment {segment_id} request failed: {status}"),
            status.as_u16(),
        ));
    }

    let mut restart_stream = false;
    if status != StatusCode::PARTIAL_CONTENT && position > 0 {
        if ctx.plan.is_ranged() {
            return Err(DownloadError::RangeNotHonoured {
                segment: segment_id,
            });
        }
        // Unranged resume answered with the whole entity: start over at byte 0.
        {
            let mut checkpoint = slot.lock_checkpoint();
            if ctx.transfer.session() != ctx.session {
                return Ok(SegmentOutcome::Interrupted);
            }
            ctx.transfer.sub_downloaded(*checkpoint);
            *checkpoint = 0;
        }
        position = 0;
        restart_stream = true;
    } else if status != StatusCode::PARTIAL_CONTENT
        && ctx.plan.is_ranged()
        && ctx.plan.len() > 1
    {
        return Err(DownloadError::RangeNotHonoured {
            segment: segment_id,
        });
    }

    // The lifecycle creates the file before any worker runs. A missing file
    // means the transfer was cancelled and must not be recreated.
    let path = ctx.transfer.id();
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::storage(path, &e))?;
    if restart_stream {
        file.set_len(0)
            .await
            .map_err(|e| DownloadError::storage(path, &e))?;
    }
    file.seek(SeekFrom::Start(position))
        .await
        .map_err(|e| DownloadError::storage(path, &e))?;

    let stream = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut reader = Box::pin(StreamReader::new(stream));
    let mut buffer = vec![0u8; ctx.chunk_size.max(1)];
    let mut session_bytes = 0u64;

    loop {
        let read = match tokio::time::timeout(ctx.read_timeout, reader.read(&mut buffer)).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                return Err(DownloadError::network(format!(
                    "Segment {segment_id} read failed: {e}"
                )))
            }
            Err(_) => {
                return Err(DownloadError::network(format!(
                    "Segment {segment_id} read timed out after {:?}",
                    ctx.read_timeout
                )))
            }
        };
        if read == 0 {
            break;
        }
        if !ctx.should_continue() {
            debug!(segment = segment_id, at = position, "Segment interrupted");
            return Ok(SegmentOutcome::Interrupted);
        }

        // Never write past the end of the range, whatever the server sends.
        let len = match segment.range_end {
            Some(end) => read.min((end + 1 - position) as usize),
            None => read,
        };
        file.write_all(&buffer[..len])
            .await
            .map_err(|e| DownloadError::storage(path, &e))?;

        let new_total = {
            let mut checkpoint = slot.lock_checkpoint();
            if ctx.transfer.session() != ctx.session {
                return Ok(SegmentOutcome::Interrupted);
            }
            *checkpoint = position + len as u64;
            ctx.transfer.add_downloaded(len as u64)
        };
        position += len as u64;

        let before = session_bytes;
        session_bytes += len as u64;
        match ctx.progress.on_chunk(before, session_bytes, new_total) {
            Publish::Nothing => {}
            Publish::Bytes => ctx.publish_progress(new_total),
            Publish::BytesAndSpeed(speed) => {
                ctx.transfer.set_speed(speed);
                ctx.publish_progress(new_total);
            }
        }

        if segment.range_end.is_some_and(|end| position > end) {
            break;
        }
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::storage(path, &e))?;

    if let Some(end) = segment.range_end {
        if position <= end {
            return Err(DownloadError::network(format!(
                "Segment {segment_id} ended at byte {position}, expected {}",
                end + 1
            )));
        }
    }

    slot.mark_finished();
    debug!(segment = segment_id, bytes = session_bytes, "Segment finished");
    Ok(SegmentOutcome::Completed)
}
