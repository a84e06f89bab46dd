//! Time-ordered task scheduler
//!
//! A due-time priority heap with insertion-order tie-break, driven by a
//! single background loop. Firing a task spawns its callback; the loop
//! never waits for callback completion. Recurring tasks advance
//! schedule-relative (`due += interval`), so execution jitter does not
//! accumulate into drift.

use futures::future::BoxFuture;
use futures::FutureExt;
use outpost_proto::AgentError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Opaque scheduled-task identifier. Unique for the lifetime of the
/// scheduler instance; never reused after cancellation.
pub type TaskId = u64;

type Callback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    due: Instant,
    /// Insertion sequence; the earlier-scheduled task wins a due-time tie
    seq: u64,
    id: TaskId,
}

struct Entry {
    due: Instant,
    interval: Option<Duration>,
    seq: u64,
    callback: Callback,
    fired: bool,
}

/// The shared priority structure. Kept separate from the run loop so the
/// ordering rules are testable on a synthetic clock.
#[derive(Default)]
struct Core {
    heap: BinaryHeap<Reverse<HeapKey>>,
    tasks: HashMap<TaskId, Entry>,
    next_id: TaskId,
    next_seq: u64,
}

impl Core {
    fn schedule(&mut self, due: Instant, interval: Option<Duration>, callback: Callback) -> TaskId {
        self.next_id += 1;
        self.next_seq += 1;
        let id = self.next_id;
        let seq = self.next_seq;

        self.tasks.insert(
            id,
            Entry {
                due,
                interval,
                seq,
                callback,
                fired: false,
            },
        );
        self.heap.push(Reverse(HeapKey { due, seq, id }));
        id
    }

    fn cancel(&mut self, id: TaskId) -> Result<(), AgentError> {
        // A task already popped for its current firing still completes it;
        // removal here only prevents future firings.
        match self.tasks.remove(&id) {
            Some(_) => Ok(()),
            None => Err(AgentError::NotFound(format!("task {id}"))),
        }
    }

    fn reschedule(&mut self, id: TaskId, new_due: Instant) -> Result<(), AgentError> {
        let entry = self
            .tasks
            .get_mut(&id)
            .filter(|entry| !entry.fired)
            .ok_or_else(|| AgentError::NotFound(format!("task {id}")))?;

        entry.due = new_due;
        self.heap.push(Reverse(HeapKey {
            due: new_due,
            seq: entry.seq,
            id,
        }));
        Ok(())
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(key)| key.due)
    }

    /// Pop every task due at `now`, in (due, insertion) order. Stale heap
    /// keys left behind by reschedule or cancel are discarded here.
    fn pop_due(&mut self, now: Instant) -> Vec<(TaskId, Callback)> {
        let mut ready = Vec::new();

        while let Some(Reverse(key)) = self.heap.peek() {
            if key.due > now {
                break;
            }
            let Reverse(key) = self.heap.pop().expect("peeked entry vanished");

            let Some(entry) = self.tasks.get_mut(&key.id) else {
                continue; // cancelled
            };
            if entry.due != key.due {
                continue; // rescheduled; a fresher key is in the heap
            }

            entry.fired = true;
            ready.push((key.id, entry.callback.clone()));

            match entry.interval {
                Some(interval) => {
                    // Schedule-relative advancement: no drift accumulation
                    entry.due += interval;
                    self.heap.push(Reverse(HeapKey {
                        due: entry.due,
                        seq: entry.seq,
                        id: key.id,
                    }));
                }
                None => {
                    self.tasks.remove(&key.id);
                }
            }
        }

        ready
    }
}

/// Handle to the scheduler. Cloneable; all clones share one timeline.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Mutex<Core>>,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(Core::default())),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Start the background firing loop
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let core = self.core.clone();
        let wake = self.wake.clone();

        tokio::spawn(async move {
            loop {
                let next = core.lock().expect("scheduler lock poisoned").next_due();

                match next {
                    Some(due) => {
                        tokio::select! {
                            _ = sleep_until(due) => {}
                            _ = wake.notified() => continue,
                        }
                    }
                    None => {
                        wake.notified().await;
                        continue;
                    }
                }

                let ready = core
                    .lock()
                    .expect("scheduler lock poisoned")
                    .pop_due(Instant::now());
                for (id, callback) in ready {
                    debug!("Firing scheduled task {}", id);
                    tokio::spawn(callback());
                }
            }
        })
    }

    /// Schedule a one-shot callback after `delay`
    pub fn schedule_once<F, Fut>(&self, delay: Duration, callback: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(Instant::now() + delay, None, callback)
    }

    /// Schedule a recurring callback. The n-th firing is due at
    /// `now + initial_delay + n * interval` regardless of execution jitter.
    pub fn schedule_recurring<F, Fut>(
        &self,
        interval: Duration,
        initial_delay: Duration,
        callback: F,
    ) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(Instant::now() + initial_delay, Some(interval), callback)
    }

    /// Cancel a task. A firing already in progress still completes.
    pub fn cancel(&self, id: TaskId) -> Result<(), AgentError> {
        self.core.lock().expect("scheduler lock poisoned").cancel(id)
    }

    /// Move an unfired task to a new due time. Fails with `NotFound` for
    /// unknown ids and for tasks that have already fired.
    pub fn reschedule(&self, id: TaskId, delay: Duration) -> Result<(), AgentError> {
        let result = self
            .core
            .lock()
            .expect("scheduler lock poisoned")
            .reschedule(id, Instant::now() + delay);
        if result.is_ok() {
            self.wake.notify_one();
        }
        result
    }

    fn insert<F, Fut>(&self, due: Instant, interval: Option<Duration>, callback: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move || callback().boxed());
        let id = self
            .core
            .lock()
            .expect("scheduler lock poisoned")
            .schedule(due, interval, callback);
        self.wake.notify_one();
        id
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn noop() -> Callback {
        Arc::new(|| async {}.boxed())
    }

    #[test]
    fn test_due_time_ordering() {
        let mut core = Core::default();
        let t0 = Instant::now();

        let late = core.schedule(t0 + Duration::from_secs(10), None, noop());
        let early = core.schedule(t0 + Duration::from_secs(1), None, noop());

        let ready = core.pop_due(t0 + Duration::from_secs(20));
        let order: Vec<TaskId> = ready.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![early, late]);
    }

    #[test]
    fn test_equal_due_times_fire_in_insertion_order() {
        let mut core = Core::default();
        let due = Instant::now() + Duration::from_secs(1);

        let first = core.schedule(due, None, noop());
        let second = core.schedule(due, None, noop());
        let third = core.schedule(due, None, noop());

        let ready = core.pop_due(due);
        let order: Vec<TaskId> = ready.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![first, second, third]);
    }

    #[test]
    fn test_one_shot_removed_after_firing() {
        let mut core = Core::default();
        let t0 = Instant::now();

        let id = core.schedule(t0, None, noop());
        assert_eq!(core.pop_due(t0).len(), 1);

        // A subsequent cancel finds nothing
        assert!(matches!(core.cancel(id), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_recurring_advances_schedule_relative() {
        let mut core = Core::default();
        let t0 = Instant::now();
        let interval = Duration::from_secs(7);

        let id = core.schedule(t0, Some(interval), noop());

        // Pop each firing half a second late; due times must still land on
        // the `t0 + n * interval` grid
        for n in 0..5u32 {
            let jittered_now = t0 + interval * n + Duration::from_millis(500);
            let ready = core.pop_due(jittered_now);
            assert_eq!(ready.len(), 1, "firing {n} missing");
            assert_eq!(core.tasks[&id].due, t0 + interval * (n + 1), "drift at firing {n}");
        }
    }

    #[test]
    fn test_cancel_prevents_future_firings() {
        let mut core = Core::default();
        let t0 = Instant::now();

        let id = core.schedule(t0, Some(Duration::from_secs(1)), noop());
        assert_eq!(core.pop_due(t0).len(), 1);

        core.cancel(id).unwrap();
        assert!(core.pop_due(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_reschedule_moves_firing() {
        let mut core = Core::default();
        let t0 = Instant::now();

        let id = core.schedule(t0 + Duration::from_secs(1), None, noop());
        core.reschedule(id, t0 + Duration::from_secs(30)).unwrap();

        // Not due at the old time
        assert!(core.pop_due(t0 + Duration::from_secs(2)).is_empty());
        // Due at the new time
        assert_eq!(core.pop_due(t0 + Duration::from_secs(30)).len(), 1);
    }

    #[test]
    fn test_reschedule_fired_task_not_found() {
        let mut core = Core::default();
        let t0 = Instant::now();

        let id = core.schedule(t0, Some(Duration::from_secs(5)), noop());
        core.pop_due(t0);

        let result = core.reschedule(id, t0 + Duration::from_secs(1));
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_task_ids_never_reused() {
        let mut core = Core::default();
        let t0 = Instant::now();

        let first = core.schedule(t0, None, noop());
        core.cancel(first).unwrap();
        let second = core.schedule(t0, None, noop());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_zero_delay_one_shot_fires_once() {
        let scheduler = Scheduler::new();
        scheduler.start();

        let (fired_tx, mut fired_rx) = mpsc::channel::<()>(8);
        let id = scheduler.schedule_once(Duration::ZERO, move || {
            let fired_tx = fired_tx.clone();
            async move {
                let _ = fired_tx.send(()).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(2), fired_rx.recv())
            .await
            .expect("task never fired");

        // No second firing
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired_rx.try_recv().is_err());

        // And it is gone from the scheduler
        assert!(matches!(scheduler.cancel(id), Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_recurring_fires_until_cancelled() {
        let scheduler = Scheduler::new();
        scheduler.start();

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let id = scheduler.schedule_recurring(Duration::from_millis(20), Duration::ZERO, move || {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.cancel(id).unwrap();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected repeated firings, got {fired}");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired, "fired after cancel");
    }
}
