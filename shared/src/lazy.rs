use crate::volatile_map::VolatileMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

/// One-shot asynchronous value: the first poller drives the producer and every
/// clone observes the same `Result`. A failed future stays failed; enclosing
/// caches must invalidate it so a retry installs a fresh one.
///
/// If every waiter is dropped mid-flight the producer is suspended, not lost:
/// the next clone to poll resumes it.
pub struct LazyFuture<T, E> {
    inner: Shared<BoxFuture<'static, Result<T, E>>>,
}

impl<T, E> Clone for LazyFuture<T, E> {
    fn clone(&self) -> Self {
        LazyFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> LazyFuture<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F>(producer: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        LazyFuture {
            inner: producer.boxed().shared(),
        }
    }

    pub async fn value(&self) -> Result<T, E> {
        self.inner.clone().await
    }
}

impl<K, T, E> VolatileMap<K, LazyFuture<T, E>>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Deduplicated read-through: installs a `LazyFuture` under `key` (or
    /// joins the one already there), awaits it, and invalidates the entry on
    /// any failure before propagating it, so the next caller retries with a
    /// fresh producer. The producer runs exactly once per TTL epoch.
    pub async fn get_or_compute<F>(&self, key: K, ttl: Duration, producer: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let future = self.get_or_install(key.clone(), ttl, || LazyFuture::new(producer));
        let result = future.value().await;
        if result.is_err() {
            self.invalidate(&key);
        }
        result
    }
}
