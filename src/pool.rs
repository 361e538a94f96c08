//! Bounded worker pools.
//!
//! Every running transfer owns one [`WorkerPool`], carved out of a shared
//! [`WorkerSupervisor`] budget. Dropping the pool aborts whatever is still
//! running in it and hands its permits back, so repeated pause/resume cycles
//! cannot grow the number of live workers.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    permits: Arc<Semaphore>,
    capacity: Arc<AtomicUsize>,
}

impl WorkerSupervisor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity: Arc::new(AtomicUsize::new(capacity)),
        }
    }

    /// Raise the budget to `capacity` workers if it is below that. The
    /// budget never shrinks.
    pub fn ensure_capacity(&self, capacity: usize) {
        let previous = self.capacity.fetch_max(capacity, Ordering::SeqCst);
        if capacity > previous {
            self.permits.add_permits(capacity - previous);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for room for `workers` workers. Pools of aborted runs release
    /// their permits as soon as they are dropped.
    pub async fn acquire<T: Send + 'static>(&self, workers: usize) -> Result<WorkerPool<T>> {
        let workers = u32::try_from(workers.max(1))
            .map_err(|_| DownloadError::Pool(format!("{workers} workers requested")))?;
        let permit = self
            .permits
            .clone()
            .acquire_many_owned(workers)
            .await
            .map_err(|e| DownloadError::Pool(e.to_string()))?;
        Ok(WorkerPool {
            tasks: JoinSet::new(),
            _permit: permit,
        })
    }
}

/// Outstanding worker tasks of one transfer run.
pub struct WorkerPool<T> {
    tasks: JoinSet<T>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Next finished worker, in completion order.
    pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.join_next().await
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dropping_a_pool_returns_its_permits() {
        let supervisor = WorkerSupervisor::new(4);
        let mut pool = supervisor.acquire::<()>(4).await.unwrap();
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(supervisor.available(), 0);

        drop(pool);
        assert_eq!(supervisor.available(), 4);
    }

    #[tokio::test]
    async fn acquire_waits_for_capacity() {
        let supervisor = WorkerSupervisor::new(2);
        let first = supervisor.acquire::<()>(2).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), supervisor.acquire::<()>(1)).await;
        assert!(waiting.is_err(), "second pool must wait for permits");

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), supervisor.acquire::<()>(1)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn join_next_yields_completed_tasks() {
        let supervisor = WorkerSupervisor::new(3);
        let mut pool = supervisor.acquire::<usize>(3).await.unwrap();
        for i in 0..3 {
            pool.spawn(async move { i * 10 });
        }
        let mut results = Vec::new();
        while let Some(res) = pool.join_next().await {
            results.push(res.unwrap());
        }
        results.sort_unstable();
        assert_eq!(results, vec![0, 10, 20]);
        assert!(pool.is_empty());
    }

    #[test]
    fn capacity_grows_only_past_its_peak() {
        let supervisor = WorkerSupervisor::new(4);
        supervisor.ensure_capacity(16);
        assert_eq!(supervisor.available(), 16);

        for _ in 0..10 {
            supervisor.ensure_capacity(4);
            supervisor.ensure_capacity(16);
        }
        assert_eq!(supervisor.capacity(), 16);
        assert_eq!(supervisor.available(), 16);

        supervisor.ensure_capacity(20);
        assert_eq!(supervisor.available(), 20);
    }
}
