//! Per-key cancel-and-reschedule timers.

use crate::types::channel::ChannelKey;
use crate::types::message::CorrelationId;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Timers owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Safety timeout of a stream session.
    StreamTimeout(CorrelationId),
    /// Debounced unread acknowledgment of a channel.
    UnreadAck(ChannelKey),
}

struct Slot {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs at most one delayed job per key.
///
/// Scheduling a key that is still waiting cancels the earlier job. A job that
/// has already fired runs to completion.
pub struct Debouncer<K> {
    slots: HashMap<K, Slot>,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> Debouncer<K> {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` after `delay`, superseding any waiting job for `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&mut self, key: K, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.slots.retain(|_, slot| !slot.handle.is_finished());
        if let Some(prev) = self.slots.remove(&key) {
            prev.token.cancel();
        }

        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = waiter.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            job.await;
        });
        self.slots.insert(key, Slot { token, handle });
    }

    /// Cancel the waiting job for `key`. Returns whether one was waiting.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.slots.remove(key).is_some_and(|slot| {
            slot.token.cancel();
            !slot.handle.is_finished()
        })
    }

    /// Whether a job for `key` is scheduled and has not finished.
    pub fn is_pending(&self, key: &K) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| !slot.token.is_cancelled() && !slot.handle.is_finished())
    }

    /// Cancel everything.
    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.token.cancel();
        }
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for slot in self.slots.values() {
            slot.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_job(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_supersedes_waiting_job() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = Debouncer::new();
        timers.schedule("a", Duration::from_millis(300), counter_job(&fired));
        tokio::time::sleep(Duration::from_millis(100)).await;
        timers.schedule("a", Duration::from_millis(300), counter_job(&fired));
        assert!(timers.is_pending(&"a"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = Debouncer::new();
        timers.schedule(1, Duration::from_millis(50), counter_job(&fired));
        timers.schedule(2, Duration::from_millis(50), counter_job(&fired));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!timers.is_pending(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = Debouncer::new();
        timers.schedule("a", Duration::from_millis(50), counter_job(&fired));
        assert!(timers.cancel(&"a"));
        assert!(!timers.cancel(&"a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_everything() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let mut timers = Debouncer::new();
            timers.schedule("a", Duration::from_millis(50), counter_job(&fired));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
