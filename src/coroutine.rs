//! Coroutine handle: stable identity plus scheduler-private metadata.
//!
//! The handle wraps a [`Fiber`] with a unique id, an optional human-readable
//! name, and the pending-timer slot the scheduler uses to tie timeouts to
//! suspended tasks. Handles compare equal by identity: two handles over the
//! same underlying fiber never exist.

use crate::error::SchedError;
use crate::fiber::{Fiber, FiberStatus, ResumeOutcome, ResumeValue};
use crate::timer::TimerTask;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a coroutine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CoId(u64);

static NEXT_CO_ID: AtomicU64 = AtomicU64::new(1);

impl CoId {
    /// Generate a new unique id.
    pub fn new() -> Self {
        CoId(NEXT_CO_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for CoId {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a coroutine.
pub type CoroutineHandle = Arc<Coroutine>;

/// A scheduler-managed task: fiber, identity, and scheduler-private slots.
pub struct Coroutine {
    id: CoId,
    name: Option<String>,
    fiber: Arc<Fiber>,
    /// Pending timer entry used to wake this task on timeout; cleared on resume.
    timer_task: Mutex<Option<Arc<TimerTask>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<CoroutineHandle>> = const { RefCell::new(None) };
}

impl Coroutine {
    /// Wrap an already-created fiber. Never resumes it.
    pub fn new(name: Option<String>, fiber: Arc<Fiber>) -> CoroutineHandle {
        Arc::new(Coroutine {
            id: CoId::new(),
            name,
            fiber,
            timer_task: Mutex::new(None),
        })
    }

    /// The coroutine's unique id.
    pub fn id(&self) -> CoId {
        self.id
    }

    /// The optional label given at spawn time.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Label used in diagnostics: the name, or `co-<id>`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("co-{}", self.id.0),
        }
    }

    /// Lifecycle state of the underlying fiber at call time.
    pub fn status(&self) -> FiberStatus {
        self.fiber.status()
    }

    /// Whether the task is between a resume and its next suspension.
    pub fn is_running(&self) -> bool {
        self.status() == FiberStatus::Running
    }

    /// Whether the task is parked at a suspension point.
    pub fn is_suspended(&self) -> bool {
        self.status() == FiberStatus::Suspended
    }

    /// Whether the task body has returned or panicked.
    pub fn is_dead(&self) -> bool {
        self.status() == FiberStatus::Dead
    }

    /// Resume the task with `value`, blocking until it suspends again or
    /// terminates. A panic in the body surfaces as [`SchedError::Aborted`].
    pub fn resume(&self, value: ResumeValue) -> Result<(), SchedError> {
        if !self.is_suspended() {
            return Err(SchedError::NotSuspended(self.display_name()));
        }
        match self.fiber.resume(value) {
            ResumeOutcome::Yielded(_) | ResumeOutcome::Finished => Ok(()),
            ResumeOutcome::Panicked(reason) => Err(SchedError::Aborted {
                name: self.display_name(),
                reason,
            }),
        }
    }

    /// Attach a pending timer entry to this task.
    pub fn set_timer_task(&self, task: Arc<TimerTask>) {
        *self.timer_task.lock() = Some(task);
    }

    /// Detach and cancel the pending timer entry, if any.
    pub fn cancel_timer_task(&self) {
        if let Some(task) = self.timer_task.lock().take() {
            task.cancel();
        }
    }

    /// The handle of the task running on the calling thread, if any.
    pub fn current() -> Option<CoroutineHandle> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Install `handle` as the calling thread's current task. Returns a guard
    /// that restores the previous value on drop.
    pub(crate) fn enter(handle: CoroutineHandle) -> CurrentGuard {
        CURRENT.with(|slot| {
            let previous = slot.borrow_mut().replace(handle);
            CurrentGuard { previous }
        })
    }
}

impl PartialEq for Coroutine {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Coroutine {}

impl Hash for Coroutine {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Restores the previous current-task binding when the body finishes.
pub(crate) struct CurrentGuard {
    previous: Option<CoroutineHandle>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}
