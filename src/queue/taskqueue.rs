use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::{DispatchError, Result};
use crate::model::ObjectMeta;

/// Identity of an object on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::new(&meta.namespace, &meta.name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Work queue keyed by object identity.
///
/// A key enqueued while already pending is folded into the pending entry; a
/// key enqueued while being processed is re-queued once processing ends.
/// Failed keys come back after an exponential per-key delay, reset on the
/// first success.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        })
    }

    /// Offer a key. No-op once shutdown started or if the key is already
    /// pending.
    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake waiters so they can drain.
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Next key to process, or `None` once shut down and drained.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key's processing pass finished. If it was re-enqueued in the
    /// meantime it goes straight back onto the queue.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear a key's failure history.
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().failures.remove(key);
    }

    /// Record a failure and return the delay before the key may retry.
    pub fn failure_delay(&self, key: &ObjectKey) -> Duration {
        let mut state = self.state.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        let exp = failures.saturating_sub(1).min(31);
        self.config
            .base_delay()
            .saturating_mul(1u32 << exp)
            .min(self.config.max_delay())
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Drive the queue with `handler` until cancelled and drained.
    ///
    /// Success and not-found both settle the key. Any other error schedules
    /// a delayed retry, except [`DispatchError::Fatal`] which aborts the
    /// worker and propagates.
    pub async fn run_worker<F, Fut>(
        self: Arc<Self>,
        handler: F,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        F: Fn(ObjectKey) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let queue = Arc::clone(&self);
        let drain = cancel.clone();
        tokio::spawn(async move {
            drain.cancelled().await;
            queue.shutdown();
        });

        while let Some(key) = self.next().await {
            let outcome = handler(key.clone()).await;
            match outcome {
                Ok(()) => self.forget(&key),
                Err(err) if err.is_not_found() => {
                    tracing::debug!(key = %key, "Object gone, dropping from queue");
                    self.forget(&key);
                }
                Err(DispatchError::Fatal(reason)) => {
                    self.done(&key);
                    return Err(DispatchError::Fatal(reason));
                }
                Err(err) => {
                    let delay = self.failure_delay(&key);
                    tracing::warn!(
                        key = %key,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Reconcile failed, requeueing"
                    );
                    let queue = Arc::clone(&self);
                    let retry_key = key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.enqueue(retry_key);
                    });
                }
            }
            self.done(&key);
        }
        Ok(())
    }
}
