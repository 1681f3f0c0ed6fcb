//! Faber cooperative task runtime
//!
//! This crate is the scheduling substrate the Faber build utility uses to
//! drive concurrent I/O (sockets, pipes, subprocesses) inside an otherwise
//! single-threaded script host. It provides:
//! - **Fibers**: thread-backed stackful coroutines with a rendezvous
//!   suspend/resume protocol (`fiber` module); exactly one task body runs
//!   at a time.
//! - **Scheduler**: task table, ready queue, per-object wait coalescing,
//!   timeouts, groups, and the main run loop (`scheduler` module).
//! - **Poller facade**: the trait an OS readiness backend implements, plus
//!   an in-memory backend for tests and embedding (`poller` module).
//! - **Timer facade**: deadline-ordered callbacks with lazy cancellation
//!   (`timer` module).
//!
//! # Example
//!
//! ```rust,ignore
//! use faber_runtime::{EventSet, ManualPoller, Scheduler};
//! use std::sync::Arc;
//!
//! let sched = Scheduler::new(Arc::new(ManualPoller::new()));
//! let worker = sched.clone();
//! sched.co_start_named("fetch", move || {
//!     let ready = worker.poller_wait(&sock, EventSet::RECV, None).unwrap();
//!     assert!(ready.contains(EventSet::RECV));
//! })?;
//! sched.runloop()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod coroutine;
pub mod error;
pub mod events;
pub mod fiber;
pub mod poller;
pub mod scheduler;
pub mod timer;

pub use coroutine::{CoId, Coroutine, CoroutineHandle};
pub use error::SchedError;
pub use events::{EventSet, ObjectKind};
pub use fiber::{Fiber, FiberStatus, ResumeValue};
pub use poller::{
    DispatchKind, ManualPoller, PollToken, Pollable, Poller, PollerError, PollerEvent,
};
pub use scheduler::{Scheduler, SchedulerStats};
pub use timer::{Timer, TimerCallback, TimerTask};
