//! Work queue between two pipeline stages.
//!
//! One producer pushes, one consumer pops. `push` never blocks; `pop_timeout`
//! waits at most one poll interval so the consumer can observe a stop request
//! even when nothing arrives.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue depth above which a dropping queue discards its backlog.
pub const DEFAULT_DROP_BOUND: usize = 5;

/// How many drop events pass between two log lines.
const DROP_LOG_INTERVAL: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Grow without bound; nothing is ever discarded.
    #[default]
    Never,
    /// A push that finds more than `bound` items queued clears the queue
    /// first, so the depth after any push is at most `bound + 1`.
    ClearAbove(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub depth: usize,
    pub pushed: u64,
    pub dropped: u64,
    /// Highest depth observed right after a push.
    pub high_water: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    pushed: u64,
    dropped: u64,
    drop_events: u64,
    high_water: usize,
}

pub struct WorkQueue<T> {
    name: String,
    policy: DropPolicy,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(name: &str, policy: DropPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                pushed: 0,
                dropped: 0,
                drop_events: 0,
                high_water: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Appends `item` and wakes the consumer.
    pub fn push(&self, item: T) {
        let mut state = self.lock();
        if let DropPolicy::ClearAbove(bound) = self.policy {
            if state.items.len() > bound {
                let n = state.items.len() as u64;
                state.items.clear();
                state.dropped += n;
                state.drop_events += 1;
                if state.drop_events % DROP_LOG_INTERVAL == 1 {
                    log::debug!(
                        "queue {} backed up, dropped {} items ({} total)",
                        self.name,
                        n,
                        state.dropped
                    );
                }
            }
        }
        state.items.push_back(item);
        state.pushed += 1;
        state.high_water = state.high_water.max(state.items.len());
        drop(state);
        self.ready.notify_one();
    }

    /// Removes the front item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.lock();
        if let Some(item) = state.items.pop_front() {
            return Some(item);
        }
        let (mut state, _) = self
            .ready
            .wait_timeout(state, timeout)
            .unwrap_or_else(|e| e.into_inner());
        state.items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Takes everything still queued, front first.
    pub fn take_all(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            depth: state.items.len(),
            pushed: state.pushed,
            dropped: state.dropped,
            high_water: state.high_water,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let q = WorkQueue::new("fifo", DropPolicy::Never);
        for i in 0..100 {
            q.push(i);
        }
        let out: Vec<_> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(out, (0..100).collect::<Vec<_>>());
        assert_eq!(q.stats().dropped, 0);
        assert_eq!(q.stats().high_water, 100);
    }

    #[test]
    fn test_pop_timeout_returns_none_when_idle() {
        let q: WorkQueue<u32> = WorkQueue::new("idle", DropPolicy::Never);
        let start = Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let q = Arc::new(WorkQueue::new("wake", DropPolicy::Never));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(7u32);
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn test_drop_policy_bounds_depth() {
        let q = WorkQueue::new("drop", DropPolicy::ClearAbove(5));
        for i in 0..40 {
            q.push(i);
            assert!(q.len() <= 6, "depth {} after push", q.len());
        }
        let stats = q.stats();
        assert!(stats.dropped > 0);
        assert_eq!(stats.pushed, 40);
        assert!(stats.high_water <= 6);
        assert_eq!(stats.dropped as usize + stats.depth, 40);
        // survivors stay in order
        let rest = q.take_all();
        assert!(rest.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*rest.last().unwrap(), 39);
    }

    #[test]
    fn test_drop_policy_keeps_bound_plus_one() {
        let q = WorkQueue::new("edge", DropPolicy::ClearAbove(2));
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        q.push(4);
        assert_eq!(q.take_all(), vec![4]);
        assert_eq!(q.stats().dropped, 3);
    }
}
