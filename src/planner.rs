//! Segment planning and per-segment checkpoints.
//!
//! A plan is fixed for the lifetime of a transfer: pausing and resuming only
//! moves each segment's checkpoint, never its range.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::state::lock;

/// One contiguous byte range of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub id: usize,
    pub range_start: u64,
    /// Inclusive end; `None` for an unranged stream of unknown length.
    pub range_end: Option<u64>,
}

impl Segment {
    pub fn len(&self) -> Option<u64> {
        self.range_end.map(|end| end + 1 - self.range_start)
    }
}

/// Split `total_size` bytes into contiguous ranges for `workers` workers.
///
/// The last segment absorbs the remainder. Transfers smaller than `workers`
/// bytes get one single-byte segment per byte.
pub fn plan_ranges(total_size: u64, workers: usize) -> Vec<Segment> {
    if total_size == 0 {
        return Vec::new();
    }
    let count = (workers.max(1) as u64).min(total_size);
    let segment_size = total_size / count;

    (0..count)
        .map(|i| {
            let range_start = i * segment_size;
            let range_end = if i == count - 1 {
                total_size - 1
            } else {
                (i + 1) * segment_size - 1
            };
            Segment {
                id: i as usize,
                range_start,
                range_end: Some(range_end),
            }
        })
        .collect()
}

/// A segment together with its resume point.
#[derive(Debug)]
pub struct SegmentSlot {
    pub segment: Segment,
    /// Next byte offset to write; everything before it is on disk.
    checkpoint: Mutex<u64>,
    finished: AtomicBool,
}

impl SegmentSlot {
    fn new(segment: Segment) -> Self {
        Self {
            checkpoint: Mutex::new(segment.range_start),
            finished: AtomicBool::new(false),
            segment,
        }
    }

    pub fn checkpoint(&self) -> u64 {
        *lock(&self.checkpoint)
    }

    /// Held while a worker records written bytes, so that a new session cannot
    /// read a checkpoint that a stale worker is about to move.
    pub(crate) fn lock_checkpoint(&self) -> MutexGuard<'_, u64> {
        lock(&self.checkpoint)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// The segments of one transfer and where each of them stopped.
#[derive(Debug)]
pub struct SegmentPlan {
    ranged: bool,
    slots: Vec<SegmentSlot>,
}

impl SegmentPlan {
    /// Plan for a transfer: ranged when the size is known and non-zero,
    /// otherwise a single unranged stream.
    pub fn new(total_size: Option<u64>, workers: usize) -> Self {
        match total_size {
            Some(size) if size > 0 => Self {
                ranged: true,
                slots: plan_ranges(size, workers)
                    .into_iter()
                    .map(SegmentSlot::new)
                    .collect(),
            },
            _ => Self::unranged(),
        }
    }

    pub fn unranged() -> Self {
        Self {
            ranged: false,
            slots: vec![SegmentSlot::new(Segment {
                id: 0,
                range_start: 0,
                range_end: None,
            })],
        }
    }

    pub fn is_ranged(&self) -> bool {
        self.ranged
    }

    pub fn slots(&self) -> &[SegmentSlot] {
        &self.slots
    }

    pub fn slot(&self, id: usize) -> Option<&SegmentSlot> {
        self.slots.get(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(total: u64, workers: usize) {
        let segments = plan_ranges(total, workers);
        let mut next = 0;
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.id, i);
            assert_eq!(segment.range_start, next, "gap or overlap at segment {i}");
            let end = segment.range_end.unwrap();
            assert!(end >= segment.range_start);
            next = end + 1;
        }
        assert_eq!(next, total, "plan for {total} bytes / {workers} workers");
    }

    #[test]
    fn even_split() {
        let segments = plan_ranges(100, 4);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].range_start, 0);
        assert_eq!(segments[0].range_end, Some(24));
        assert_eq!(segments[3].range_start, 75);
        assert_eq!(segments[3].range_end, Some(99));
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let segments = plan_ranges(100, 3);
        assert_eq!(segments[0].len(), Some(33));
        assert_eq!(segments[1].len(), Some(33));
        assert_eq!(segments[2].len(), Some(34));
        assert_eq!(segments[2].range_end, Some(99));
    }

    #[test]
    fn plans_cover_every_byte_exactly_once() {
        for total in [1, 2, 3, 4, 5, 7, 64, 1000, 1023, 10 * 1024 * 1024 + 3] {
            for workers in [1, 2, 3, 4, 8] {
                assert_exact_cover(total, workers);
            }
        }
    }

    #[test]
    fn segment_count_is_min_of_workers_and_size() {
        assert_eq!(plan_ranges(2, 4).len(), 2);
        assert_eq!(plan_ranges(4, 4).len(), 4);
        assert_eq!(plan_ranges(4096, 4).len(), 4);
        assert!(plan_ranges(0, 4).is_empty());
    }

    #[test]
    fn plan_is_deterministic() {
        assert_eq!(plan_ranges(12_345, 4), plan_ranges(12_345, 4));
    }

    #[test]
    fn unknown_size_yields_one_unranged_segment() {
        let plan = SegmentPlan::new(None, 4);
        assert!(!plan.is_ranged());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.slots()[0].segment.range_end, None);

        let plan = SegmentPlan::new(Some(0), 4);
        assert!(!plan.is_ranged());
    }

    #[test]
    fn checkpoints_start_at_range_start() {
        let plan = SegmentPlan::new(Some(1000), 4);
        let starts: Vec<u64> = plan.slots().iter().map(SegmentSlot::checkpoint).collect();
        assert_eq!(starts, vec![0, 250, 500, 750]);

        *plan.slot(2).unwrap().lock_checkpoint() = 600;
        assert_eq!(plan.slot(2).unwrap().checkpoint(), 600);
        assert_eq!(plan.slot(3).unwrap().checkpoint(), 750);
    }
}
