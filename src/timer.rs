//! Timer facade: deadline-ordered callbacks with lazy cancellation.
//!
//! The run loop derives its poll timeout from [`Timer::delay`] and fires due
//! entries with [`Timer::next`] once per iteration. Cancellation is a
//! sentinel: setting [`TimerTask::cancel`] does not unlink the entry, the
//! flag is consulted when the entry fires.

use crate::error::SchedError;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback fired when a timer entry comes due.
///
/// The argument is true when the entry was cancelled (sentinel set, or the
/// timer was killed) before firing.
pub type TimerCallback = Box<dyn FnOnce(bool) -> Result<(), SchedError> + Send>;

/// Handle to a posted timer entry.
pub struct TimerTask {
    cancelled: AtomicBool,
}

impl TimerTask {
    /// Mark the entry cancelled. The callback still runs at fire time with
    /// the cancelled flag set.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Whether the cancel sentinel has been set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Entry in the timer heap (min-heap by deadline, then post order)
struct TimerEntry {
    when: Instant,
    seq: u64,
    task: Arc<TimerTask>,
    callback: TimerCallback,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

/// Deadline-ordered callback queue.
pub struct Timer {
    state: Mutex<TimerState>,
}

impl Timer {
    /// Create an empty timer.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Post `callback` to fire after `delay`. Returns the cancel handle.
    pub fn post<F>(&self, delay: Duration, callback: F) -> Arc<TimerTask>
    where
        F: FnOnce(bool) -> Result<(), SchedError> + Send + 'static,
    {
        let task = Arc::new(TimerTask {
            cancelled: AtomicBool::new(false),
        });
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            when: Instant::now() + delay,
            seq,
            task: task.clone(),
            callback: Box::new(callback),
        });
        task
    }

    /// Time until the earliest entry fires. `None` when the timer is idle.
    pub fn delay(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .heap
            .peek()
            .map(|entry| entry.when.saturating_duration_since(Instant::now()))
    }

    /// Fire every due entry, earliest first. Each callback observes its own
    /// cancel sentinel. Stops at the first callback error.
    pub fn next(&self) -> Result<(), SchedError> {
        loop {
            // Pop under the lock, invoke outside: callbacks may post new
            // entries or resume coroutines that do.
            let entry = {
                let mut state = self.state.lock();
                match state.heap.peek() {
                    Some(entry) if entry.when <= Instant::now() => state.heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else {
                return Ok(());
            };
            let cancelled = entry.task.is_cancelled();
            (entry.callback)(cancelled)?;
        }
    }

    /// Discard all remaining entries, firing each with `cancelled = true`.
    pub fn kill(&self) -> Result<(), SchedError> {
        let mut first_err = None;
        loop {
            let entry = {
                let mut state = self.state.lock();
                state.heap.pop()
            };
            let Some(entry) = entry else {
                break;
            };
            entry.task.cancel();
            if let Err(err) = (entry.callback)(true) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of entries not yet fired.
    pub fn pending_count(&self) -> usize {
        self.state.lock().heap.len()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
