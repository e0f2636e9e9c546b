//! Bounded task collections with producer-side backpressure.
//!

use crate::error::Result;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use tokio::task::{JoinHandle, JoinSet};

/// The default concurrency for bounded task collections.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// A bounded set of spawned tasks. `put` blocks the producer once the
/// in-flight count reaches the cap, and results come back in completion
/// order rather than submission order.
#[derive(Debug)]
pub struct AsyncSet<T> {
    tasks: JoinSet<T>,
    finished: VecDeque<T>,
    concurrency: usize,
}

impl<T> AsyncSet<T>
where
    T: Send + 'static,
{
    /// Create a new set with the given concurrency cap.
    pub fn new(concurrency: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            finished: VecDeque::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn a task into the set, waiting for capacity first. Results of
    /// tasks that complete while waiting are banked for the next `consume*`
    /// call.
    pub async fn put<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        while self.tasks.len() >= self.concurrency {
            if let Some(result) = self.tasks.join_next().await {
                self.finished.push_back(result?);
            }
        }

        self.tasks.spawn(task);

        Ok(())
    }

    /// Take the results of any tasks that have already completed, without
    /// blocking.
    pub fn consume_finished(&mut self) -> Result<Vec<T>> {
        let mut results: Vec<T> = self.finished.drain(..).collect();
        while let Some(result) = self.tasks.try_join_next() {
            results.push(result?);
        }

        Ok(results)
    }

    /// Wait for and take the results of all remaining tasks.
    pub async fn consume(&mut self) -> Result<Vec<T>> {
        let mut results: Vec<T> = self.finished.drain(..).collect();
        while let Some(result) = self.tasks.join_next().await {
            results.push(result?);
        }

        Ok(results)
    }

    /// The number of tasks currently in flight.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no in-flight tasks or banked results.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.finished.is_empty()
    }
}

impl<T> Default for AsyncSet<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// The FIFO analogue of [`AsyncSet`] for producers that need results in
/// submission order.
#[derive(Debug)]
pub struct AsyncQueue<T> {
    tasks: VecDeque<JoinHandle<T>>,
    finished: VecDeque<T>,
    concurrency: usize,
}

impl<T> AsyncQueue<T>
where
    T: Send + 'static,
{
    /// Create a new queue with the given concurrency cap.
    pub fn new(concurrency: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            finished: VecDeque::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn a task into the queue, waiting for capacity first.
    pub async fn put<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        while self.tasks.len() >= self.concurrency {
            if let Some(handle) = self.tasks.pop_front() {
                self.finished.push_back(handle.await?);
            }
        }

        self.tasks.push_back(tokio::spawn(task));

        Ok(())
    }

    /// Take results from the front of the queue without blocking. Stops at
    /// the first task that is still running to preserve submission order.
    pub fn consume_finished(&mut self) -> Result<Vec<T>> {
        let mut results: Vec<T> = self.finished.drain(..).collect();
        while self
            .tasks
            .front()
            .is_some_and(|handle| handle.is_finished())
        {
            let handle = self.tasks.pop_front().expect("front task exists");
            let result = FutureExt::now_or_never(handle).expect("handle already finished")?;
            results.push(result);
        }

        Ok(results)
    }

    /// Wait for and take the results of all remaining tasks in order.
    pub async fn consume(&mut self) -> Result<Vec<T>> {
        let mut results: Vec<T> = self.finished.drain(..).collect();
        while let Some(handle) = self.tasks.pop_front() {
            results.push(handle.await?);
        }

        Ok(results)
    }

    /// The number of tasks currently in flight.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no in-flight tasks or banked results.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.finished.is_empty()
    }
}

impl<T> Default for AsyncQueue<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_async_set_consumes_all() -> Result<()> {
        let mut set = AsyncSet::new(2);
        for value in 0..10u64 {
            set.put(async move { value }).await?;
        }

        let mut results = set.consume().await?;
        results.sort();

        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert!(set.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_async_set_backpressure() -> Result<()> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut set = AsyncSet::new(2);
        for _ in 0..8 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            set.put(async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
            .await?;
        }
        set.consume().await?;

        assert!(max_seen.load(Ordering::SeqCst) <= 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_async_set_surfaces_errors_once() -> Result<()> {
        let mut set: AsyncSet<crate::error::Result<u64>> = AsyncSet::new(2);
        set.put(async { Err(crate::error::Error::ParseError("failed task".to_string())) })
            .await?;
        set.put(async { Ok(42) }).await?;

        let results = set.consume().await?;
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|result| result.is_err()).count(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_async_queue_preserves_order() -> Result<()> {
        let mut queue = AsyncQueue::new(3);
        for value in 0..10u64 {
            queue
                .put(async move {
                    // Later tasks finish earlier, ordering must still hold.
                    sleep(Duration::from_millis(10u64.saturating_sub(value))).await;
                    value
                })
                .await?;
        }

        let results = queue.consume().await?;
        assert_eq!(results, (0..10).collect::<Vec<_>>());

        Ok(())
    }

    #[tokio::test]
    async fn test_async_queue_consume_finished_stops_at_running() -> Result<()> {
        let mut queue = AsyncQueue::new(4);
        queue.put(async { 1u64 }).await?;
        queue
            .put(async {
                sleep(Duration::from_millis(200)).await;
                2u64
            })
            .await?;
        queue.put(async { 3u64 }).await?;

        sleep(Duration::from_millis(20)).await;
        let finished = queue.consume_finished()?;
        assert_eq!(finished, vec![1]);

        let rest = queue.consume().await?;
        assert_eq!(rest, vec![2, 3]);

        Ok(())
    }
}
