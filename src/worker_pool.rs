//! Worker pool: a `Semaphore`-gated set of concurrent tasks pulling from a
//! `BoundedQueue` and handing each item to a caller-supplied handler.
//!
//! Shutdown has two modes: `Drain` keeps pulling from the queue until it is
//! empty and closed (used when a flow is asked to stop cleanly and still has
//! in-flight upstream data worth finishing), and `Interrupt` stops admitting
//! new work as soon as the shutdown signal fires and only waits for whatever
//! is already in flight. Both are bounded by an overall timeout; a pool that
//! blows through it returns `FlowError::ShutdownTimeout` rather than hanging
//! the process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{FlowError, Result};
use crate::metrics;
use crate::queue::{BoundedQueue, QueueClosed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Drain,
    Interrupt,
}

#[derive(Clone)]
pub struct WorkerPool {
    name: String,
    max_workers: usize,
    poll_timeout: Duration,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
            poll_timeout: Duration::from_millis(250),
        }
    }

    /// Runs until the queue closes (and, in `Drain` mode, is empty) or the
    /// shutdown signal fires. `handler` is cloned once per spawned task;
    /// make it cheap (an `Arc` inside, typically).
    pub async fn run<T, F, Fut>(
        &self,
        queue: Arc<BoundedQueue<T>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        shutdown_mode: ShutdownMode,
        shutdown_timeout: Duration,
        handler: F,
    ) -> Result<()>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        info!(pool = %self.name, workers = self.max_workers, "starting worker pool");

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::new();
        let mut shutting_down = false;

        loop {
            if shutting_down && shutdown_mode == ShutdownMode::Interrupt {
                break;
            }

            if !shutting_down {
                if let Ok(()) = shutdown_rx.try_recv() {
                    info!(pool = %self.name, mode = ?shutdown_mode, "worker pool received shutdown signal");
                    shutting_down = true;
                    if shutdown_mode == ShutdownMode::Interrupt {
                        break;
                    }
                }
            }

            metrics::set_active_workers(&self.name, (self.max_workers - semaphore.available_permits()) as i64);

            let item = match queue.get(self.poll_timeout).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    if shutting_down {
                        continue;
                    }
                    tokio::select! {
                        recv = shutdown_rx.recv() => {
                            if recv.is_ok() {
                                shutting_down = true;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                    }
                    continue;
                }
                Err(QueueClosed::Closed) => break,
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(pool = %self.name, "semaphore closed unexpectedly");
                    continue;
                }
            };

            let handler = handler.clone();
            let pool_name = self.name.clone();
            let handle = tokio::spawn(
                async move {
                    if let Err(e) = handler(item).await {
                        error!(pool = %pool_name, error = %e, "worker handler failed");
                    }
                    drop(permit);
                }
                .instrument(tracing::debug_span!("worker", pool = %self.name)),
            );

            handles.push(handle);
            handles.retain(|h| !h.is_finished());
        }

        debug!(pool = %self.name, pending = handles.len(), "waiting for in-flight work to finish");
        let wait = futures::future::join_all(handles);

        match tokio::time::timeout(shutdown_timeout, wait).await {
            Ok(_) => {
                info!(pool = %self.name, "worker pool stopped");
                Ok(())
            }
            Err(_) => Err(FlowError::ShutdownTimeout {
                stage: self.name.clone(),
                elapsed_ms: shutdown_timeout.as_millis(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn processes_items_until_queue_closes() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(16));
        for i in 0..5 {
            queue.put(i, Duration::from_millis(50)).await.unwrap();
        }
        queue.close();

        let processed = Arc::new(AtomicUsize::new(0));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let pool = WorkerPool::new("test-pool", 2);
        let counter = processed.clone();
        pool.run(queue, shutdown_rx, ShutdownMode::Drain, Duration::from_secs(2), move |_item: i32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn interrupt_mode_stops_admitting_new_work_immediately() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(16));
        queue.put(1, Duration::from_millis(50)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();

        let processed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("interrupt-pool", 2);
        let counter = processed.clone();
        pool.run(queue, shutdown_rx, ShutdownMode::Interrupt, Duration::from_secs(2), move |_item: i32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 0);
    }
}
