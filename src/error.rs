//! Scheduler error types.

use crate::events::ObjectKind;
use crate::poller::PollerError;

/// Errors surfaced by scheduler entry points.
///
/// Contract violations (`OutsideCoroutine`, `NotStarted`, `InvalidObject`,
/// `NotSuspended`) are returned without side effects. `Stopped` is the error
/// a suspended task observes when the run loop tears down underneath it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    /// A coroutine-only operation was called from outside any managed coroutine
    #[error("not called inside a coroutine")]
    OutsideCoroutine,

    /// A suspending operation was called before `runloop` started or after it stopped
    #[error("scheduler is not started")]
    NotStarted,

    /// The object kind cannot be waited on with `poller_wait`
    #[error("cannot wait on {0:?} objects")]
    InvalidObject(ObjectKind),

    /// Attempt to resume a coroutine that is not suspended
    #[error("coroutine {0} is not suspended")]
    NotSuspended(String),

    /// The poller reported a failure
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// A sticky error event was cached for the object
    #[error("events error")]
    EventsError,

    /// The scheduler stopped while the task was suspended
    #[error("scheduler stopped")]
    Stopped,

    /// The coroutine body panicked
    #[error("coroutine {name} aborted: {reason}")]
    Aborted {
        /// Name of the failed coroutine
        name: String,
        /// Panic payload, rendered as text
        reason: String,
    },

    /// A coroutine group operation referenced an unknown group
    #[error("unknown coroutine group {0:?}")]
    UnknownGroup(String),

    /// `co_group_begin` was called for a group that is already open
    #[error("coroutine group {0:?} is already open")]
    GroupAlreadyOpen(String),
}
