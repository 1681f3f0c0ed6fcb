//! Poller facade: the seam between the scheduler and an OS readiness
//! multiplexer.
//!
//! The scheduler only ever talks to the [`Poller`] trait. Production hosts
//! inject an OS-backed implementation (epoll, kqueue, IOCP); this crate ships
//! [`ManualPoller`], an in-memory backend whose readiness is injected with
//! [`ManualPoller::post`], used for embedding the runtime in tests and
//! single-process tools.

use crate::events::{EventSet, ObjectKind};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stable identity of a pollable object.
///
/// OS-backed pollers typically derive this from the underlying descriptor;
/// in-memory objects allocate fresh tokens with [`PollToken::next`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PollToken(u64);

static NEXT_POLL_TOKEN: AtomicU64 = AtomicU64::new(1);

impl PollToken {
    /// Allocate a fresh unique token.
    pub fn next() -> Self {
        PollToken(NEXT_POLL_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an externally managed identity (e.g. a file descriptor).
    pub fn from_raw(raw: u64) -> Self {
        PollToken(raw)
    }

    /// The raw token value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Contract implemented by every object the scheduler can wait on.
pub trait Pollable: Send + Sync {
    /// The object kind (socket, pipe, process).
    fn kind(&self) -> ObjectKind;

    /// Stable identity used to key per-object bookkeeping.
    fn token(&self) -> PollToken;
}

/// Which dispatcher handles events delivered for a registration.
///
/// The poller hands every ready object back as an `(object, events,
/// dispatch)` triple; the run loop routes the triple by this tag rather than
/// through stored function references.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchKind {
    /// Socket/pipe readiness, routed to the scheduler's I/O dispatcher.
    Io,
}

/// One ready object reported by [`Poller::wait`].
pub struct PollerEvent {
    /// The object that became ready.
    pub obj: Arc<dyn Pollable>,
    /// The readiness observed for it.
    pub events: EventSet,
    /// Dispatcher the registration was made with.
    pub dispatch: DispatchKind,
}

/// Errors reported by a poller backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollerError {
    /// `insert` on a token that is already registered
    #[error("object {0:?} is already registered")]
    AlreadyRegistered(PollToken),

    /// `modify`/`remove` on a token that was never registered
    #[error("object {0:?} is not registered")]
    NotRegistered(PollToken),

    /// Backend failure (syscall error, closed backend, ...)
    #[error("{0}")]
    Backend(String),
}

/// Readiness multiplexer facade.
///
/// `wait` blocks the calling thread; `spank` interrupts an in-flight `wait`
/// and is the only operation required to be safe from another thread while a
/// `wait` is running.
pub trait Poller: Send + Sync {
    /// Whether the backend supports `events` for objects of `kind`.
    ///
    /// The scheduler probes `supports(Sock, CLEAR)` once to decide whether to
    /// request edge-trigger-clear registration on sockets.
    fn supports(&self, kind: ObjectKind, events: EventSet) -> bool;

    /// Register interest in `events` for `obj`.
    fn insert(
        &self,
        obj: Arc<dyn Pollable>,
        events: EventSet,
        dispatch: DispatchKind,
    ) -> Result<(), PollerError>;

    /// Replace the registered interest for `obj`.
    fn modify(
        &self,
        obj: &dyn Pollable,
        events: EventSet,
        dispatch: DispatchKind,
    ) -> Result<(), PollerError>;

    /// Drop the registration for `obj`.
    fn remove(&self, obj: &dyn Pollable) -> Result<(), PollerError>;

    /// Block until at least one registered object is ready, the timeout
    /// elapses (`Ok(vec![])`), or `spank` is called (`Ok(vec![])`).
    ///
    /// `None` blocks indefinitely.
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<PollerEvent>, PollerError>;

    /// Wake an in-flight `wait`.
    fn spank(&self);
}

// ============================================================================
// ManualPoller
// ============================================================================

struct Registration {
    obj: Arc<dyn Pollable>,
    interest: EventSet,
    dispatch: DispatchKind,
}

struct ManualState {
    registered: FxHashMap<PollToken, Registration>,
    /// Readiness injected by `post`, in arrival order.
    pending: VecDeque<(PollToken, EventSet)>,
    spanked: bool,
}

/// In-memory poller with externally injected readiness.
///
/// Readiness posted for tokens with no registration is dropped at delivery
/// time, matching OS pollers which only report subscribed descriptors.
/// Delivery is edge-style: posted readiness is consumed by the `wait` that
/// reports it.
pub struct ManualPoller {
    state: Mutex<ManualState>,
    notify: Condvar,
    edge_clear: bool,
}

impl ManualPoller {
    /// Create a poller without edge-trigger-clear support.
    pub fn new() -> Self {
        Self::with_edge_clear(false)
    }

    /// Create a poller advertising edge-trigger-clear support for sockets.
    pub fn with_edge_clear(edge_clear: bool) -> Self {
        Self {
            state: Mutex::new(ManualState {
                registered: FxHashMap::default(),
                pending: VecDeque::new(),
                spanked: false,
            }),
            notify: Condvar::new(),
            edge_clear,
        }
    }

    /// Inject readiness for `token`. Wakes an in-flight `wait`.
    pub fn post(&self, token: PollToken, events: EventSet) {
        let mut state = self.state.lock();
        state.pending.push_back((token, events));
        self.notify.notify_all();
    }

    /// Number of live registrations.
    pub fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    /// Drain deliverable events. Pending readiness for unregistered tokens is
    /// discarded; readiness outside the registered interest (other than EOF
    /// and ERROR, which are always reported) is masked off.
    fn collect(state: &mut ManualState) -> Vec<PollerEvent> {
        let mut out: Vec<PollerEvent> = Vec::new();
        while let Some((token, events)) = state.pending.pop_front() {
            let Some(reg) = state.registered.get(&token) else {
                continue;
            };
            let mask = (reg.interest & EventSet::BOTH) | EventSet::EOF | EventSet::ERROR;
            let delivered = events & mask;
            if delivered.is_empty() {
                continue;
            }
            // Coalesce multiple posts for the same object into one report.
            if let Some(prev) = out.iter_mut().find(|e| e.obj.token() == token) {
                prev.events |= delivered;
            } else {
                out.push(PollerEvent {
                    obj: reg.obj.clone(),
                    events: delivered,
                    dispatch: reg.dispatch,
                });
            }
        }
        out
    }
}

impl Default for ManualPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for ManualPoller {
    fn supports(&self, kind: ObjectKind, events: EventSet) -> bool {
        if events.contains(EventSet::CLEAR) {
            return self.edge_clear && kind == ObjectKind::Sock;
        }
        matches!(kind, ObjectKind::Sock | ObjectKind::Pipe)
    }

    fn insert(
        &self,
        obj: Arc<dyn Pollable>,
        events: EventSet,
        dispatch: DispatchKind,
    ) -> Result<(), PollerError> {
        let token = obj.token();
        let mut state = self.state.lock();
        if state.registered.contains_key(&token) {
            return Err(PollerError::AlreadyRegistered(token));
        }
        state.registered.insert(
            token,
            Registration {
                obj,
                interest: events,
                dispatch,
            },
        );
        Ok(())
    }

    fn modify(
        &self,
        obj: &dyn Pollable,
        events: EventSet,
        dispatch: DispatchKind,
    ) -> Result<(), PollerError> {
        let token = obj.token();
        let mut state = self.state.lock();
        match state.registered.get_mut(&token) {
            Some(reg) => {
                reg.interest = events;
                reg.dispatch = dispatch;
                // Widened interest may make already-posted readiness
                // deliverable.
                self.notify.notify_all();
                Ok(())
            }
            None => Err(PollerError::NotRegistered(token)),
        }
    }

    fn remove(&self, obj: &dyn Pollable) -> Result<(), PollerError> {
        let token = obj.token();
        let mut state = self.state.lock();
        match state.registered.remove(&token) {
            Some(_) => Ok(()),
            None => Err(PollerError::NotRegistered(token)),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<PollerEvent>, PollerError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.state.lock();
        loop {
            if state.spanked {
                state.spanked = false;
                return Ok(Vec::new());
            }
            let ready = Self::collect(&mut state);
            if !ready.is_empty() {
                return Ok(ready);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    let timed_out = self
                        .notify
                        .wait_for(&mut state, deadline - now)
                        .timed_out();
                    if timed_out && !state.spanked {
                        // Drain anything that raced in with the timeout.
                        let ready = Self::collect(&mut state);
                        return Ok(ready);
                    }
                }
                None => self.notify.wait(&mut state),
            }
        }
    }

    fn spank(&self) {
        let mut state = self.state.lock();
        state.spanked = true;
        self.notify.notify_all();
    }
}
