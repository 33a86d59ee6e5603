use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Raised when a queued task could not produce a result: the queue was torn
/// down before the task ran, or the task panicked.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("action queue task did not complete")]
pub struct QueueClosed;

/// Bounded-concurrency executor. At most `width` tasks run at once; admission
/// is FIFO (the semaphore hands out permits in request order). Admitted work
/// is not cancelled by the queue; callers cancel through the inner operation.
#[derive(Clone)]
pub struct ActionQueue {
    permits: Arc<Semaphore>,
}

impl ActionQueue {
    pub fn new(width: usize) -> Self {
        ActionQueue {
            permits: Arc::new(Semaphore::new(width.max(1))),
        }
    }

    /// Schedules `task` and resolves with its result once a slot was free and
    /// the task ran. Returning the future never blocks the caller.
    pub fn run<T, E, F>(&self, task: F) -> impl Future<Output = Result<T, E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueClosed> + Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => task.await,
                Err(_) => Err(E::from(QueueClosed)),
            }
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!("queued task failed to complete: {join_error}");
                    Err(E::from(QueueClosed))
                }
            }
        }
    }
}
