//! Progress aggregation and throttled speed sampling.
//!
//! Workers add every chunk to the transfer's shared byte counter. Observers
//! are only told about it when a segment crosses a `publish_every` boundary,
//! and the speed figure is only recomputed when `interval` has elapsed since
//! the previous sample.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::state::lock;

/// What a worker should publish after a chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Publish {
    Nothing,
    /// Republish the byte count, keep the last speed.
    Bytes,
    /// Republish the byte count together with a fresh speed sample.
    BytesAndSpeed(f64),
}

#[derive(Debug)]
struct Sample {
    at: Instant,
    total: u64,
}

/// Per-transfer speed estimator shared by all segment workers of one run.
#[derive(Debug)]
pub struct ProgressAggregator {
    interval: Duration,
    publish_every: u64,
    started: Instant,
    start_total: u64,
    last: Mutex<Sample>,
}

impl ProgressAggregator {
    pub fn new(start_total: u64, publish_every: u64, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            publish_every: publish_every.max(1),
            started: now,
            start_total,
            last: Mutex::new(Sample {
                at: now,
                total: start_total,
            }),
        }
    }

    /// Decide what to publish after a segment moved from `before` to `after`
    /// bytes this session, with `new_total` bytes downloaded overall.
    pub fn on_chunk(&self, before: u64, after: u64, new_total: u64) -> Publish {
        if before / self.publish_every == after / self.publish_every {
            return Publish::Nothing;
        }
        self.sample(new_total, Instant::now())
    }

    fn sample(&self, new_total: u64, now: Instant) -> Publish {
        let mut last = lock(&self.last);
        let elapsed = now.saturating_duration_since(last.at);
        if elapsed < self.interval {
            return Publish::Bytes;
        }
        let speed = new_total.saturating_sub(last.total) as f64 / elapsed.as_secs_f64();
        *last = Sample {
            at: now,
            total: new_total,
        };
        Publish::BytesAndSpeed(speed)
    }

    /// Average over the whole run, used once every segment is done.
    pub fn final_speed(&self, final_total: u64) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            final_total.saturating_sub(self.start_total) as f64 / elapsed
        } else {
            0.0
        }
    }
}
