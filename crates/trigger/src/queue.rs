//! Rate-limited, de-duplicating work queue with single-flight per key.
//!
//! A key added while it sits in the queue is coalesced; a key added while a
//! worker holds it is marked dirty and re-delivered once `done` is called.
//! Failed keys come back through `add_rate_limited` with per-key exponential
//! backoff, reset by `forget`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    shutting_down: bool,
}

pub struct RateLimitingQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RateLimitingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(RateLimitingQueue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down || !inner.dirty.insert(key.clone()) {
            return;
        }
        if inner.processing.contains(&key) {
            // re-delivered on done()
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-add after a failure, delayed by per-key exponential backoff.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let exp = (*failures).min(27); // past this the base overflows anyway
            *failures += 1;
            let delay = BASE_DELAY
                .checked_mul(2u32.saturating_pow(exp))
                .unwrap_or(MAX_DELAY);
            delay.min(MAX_DELAY)
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Next key to work on; `None` once the queue has been shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// The worker is finished with this key. Re-queues it when it went dirty
    /// while being processed.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Clear the failure history of a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    pub fn shut_down(&self) {
        debug!("shutting down work queue");
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn adds_are_deduplicated_while_queued() {
        let q = RateLimitingQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_in_flight_is_delivered_once_until_done() {
        let q = RateLimitingQueue::new();
        q.add("k");
        let held = q.get().await.unwrap();
        assert_eq!(held, "k");

        // concurrent re-adds while the worker holds the key
        q.add("k");
        q.add("k");
        q.add("k");
        assert!(
            timeout(Duration::from_millis(50), q.get()).await.is_err(),
            "key must not be re-delivered before done"
        );

        q.done(&held);
        assert_eq!(q.get().await.as_deref(), Some("k"));
        q.done("k");
        // dirty was consumed; nothing further
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_per_key() {
        let q = RateLimitingQueue::new();
        q.add_rate_limited("k");
        assert_eq!(q.get().await.as_deref(), Some("k"));
        q.done("k");

        q.add_rate_limited("k");
        assert_eq!(q.get().await.as_deref(), Some("k"));
        q.done("k");

        // failures reset after forget
        q.forget("k");
        assert_eq!(q.inner.lock().unwrap().failures.get("k"), None);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = RateLimitingQueue::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_items() {
        let q = RateLimitingQueue::new();
        q.add("a");
        q.shut_down();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn adds_after_shutdown_are_ignored() {
        let q = RateLimitingQueue::new();
        q.shut_down();
        q.add("a");
        assert_eq!(q.get().await, None);
    }
}
