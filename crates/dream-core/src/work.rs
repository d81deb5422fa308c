//! Bounded processing queue with fixed worker slots
//!
//! Items are pulled by a fixed number of cooperative workers and handed to
//! a user-supplied handler. Delivery is best-effort: a handler error drops
//! the item with a warning. Callers needing durable retry put the work
//! through a queue stream instead and re-enqueue from there.

use crate::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Default number of concurrent worker slots
pub const DEFAULT_WORKER_SLOTS: usize = 5;

/// Bounded in-memory work queue
pub struct ProcessingQueue<T> {
    tx: mpsc::Sender<T>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ProcessingQueue<T> {
    /// Create a queue holding at most `capacity` undelivered items, served
    /// by `slots` workers invoking `handler`
    pub fn new<F, Fut>(capacity: usize, slots: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let workers = (0..slots.max(1))
            .map(|slot| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        let item = rx.lock().await.recv().await;
                        match item {
                            Some(item) => {
                                if let Err(error) = handler(item).await {
                                    tracing::warn!(slot, %error, "work item dropped");
                                }
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Create a queue with the default number of worker slots
    pub fn with_default_slots<F, Fut>(capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(capacity, DEFAULT_WORKER_SLOTS, handler)
    }

    /// Enqueue an item; returns false when the queue is at capacity or
    /// shut down
    pub fn try_enqueue(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Stop accepting items, drain the backlog, and wait for the workers
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
