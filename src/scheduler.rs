//! Cooperative task scheduler.
//!
//! The scheduler multiplexes many fiber-backed tasks over one poller and one
//! timer. Exactly one task body runs at a time; control transfers only at
//! explicit suspension points (`poller_wait`, `sleep`, `co_group_wait`,
//! `co_wait_exit`). The run loop owns the poller: it blocks until readiness
//! or the next timer deadline, routes readiness to waiting tasks, then fires
//! due timers.
//!
//! The scheduler is an explicit instance: hosts construct it with an injected
//! [`Poller`] backend and hand `Arc<Scheduler>` clones to task bodies.

use crate::coroutine::{CoId, Coroutine, CoroutineHandle};
use crate::error::SchedError;
use crate::events::{EventSet, ObjectKind};
use crate::fiber::{self, Fiber, ResumeValue};
use crate::poller::{DispatchKind, PollToken, Pollable, Poller};
use crate::timer::Timer;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll timeout used when the timer is idle.
const IDLE_WAIT: Duration = Duration::from_millis(1000);

// Edge-clear capability cache states.
const EDGE_CLEAR_UNKNOWN: u8 = 0;
const EDGE_CLEAR_NO: u8 = 1;
const EDGE_CLEAR_YES: u8 = 2;

/// Per-object wait bookkeeping.
///
/// One entry exists per pollable object that has ever been waited on and not
/// yet cancelled. `co_recv`/`co_send` are the tasks parked on each direction;
/// `events_wait` is the interest registered with the poller; `events_save`
/// caches readiness observed with no waiter to consume it (edge-triggered
/// sources report a transition only once).
struct PollerEntry {
    obj: Arc<dyn Pollable>,
    co_recv: Option<CoroutineHandle>,
    co_send: Option<CoroutineHandle>,
    events_wait: EventSet,
    events_save: EventSet,
}

/// A named group of tasks plus the tasks waiting for the group to drain.
#[derive(Default)]
struct GroupState {
    open: bool,
    total: usize,
    pending: FxHashSet<CoId>,
    waiters: Vec<CoroutineHandle>,
}

/// What a suspended task is parked on. Wakeup paths check the kind so a
/// stale reference (a timed-out I/O slot, a drained waiter list) can never
/// resume a task that has since parked on something else.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WaitKind {
    Io(PollToken),
    Sleep,
    TaskExit,
    Group,
}

struct Waiting {
    co: CoroutineHandle,
    kind: WaitKind,
}

struct Inner {
    /// Authoritative set of live tasks.
    tasks: FxHashMap<CoId, CoroutineHandle>,
    task_count: usize,
    /// Tasks spawned before the loop started, resumed in insertion order.
    ready: VecDeque<(CoroutineHandle, ResumeValue)>,
    /// Tasks parked inside a scheduler-managed suspension point. Membership
    /// is wakeup ownership: whoever removes an id from here resumes it.
    suspended: FxHashMap<CoId, Waiting>,
    poller_data: FxHashMap<PollToken, PollerEntry>,
    started: bool,
    groups: FxHashMap<String, GroupState>,
    exit_waiters: FxHashMap<CoId, Vec<CoroutineHandle>>,
    /// First error raised on a path with no caller to return it to (task-exit
    /// wakeups); the run loop collects it.
    deferred_error: Option<SchedError>,
    tasks_spawned: u64,
    tasks_finished: u64,
}

/// Counters reported by [`Scheduler::stats`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,
    /// Total tasks that have terminated
    pub tasks_finished: u64,
    /// Currently live tasks
    pub active_tasks: usize,
    /// Tasks currently parked at a suspension point
    pub suspended_tasks: usize,
}

/// Cooperative task scheduler over one poller and one timer.
pub struct Scheduler {
    poller: Arc<dyn Poller>,
    timer: Timer,
    inner: Mutex<Inner>,
    edge_clear: AtomicU8,
}

impl Scheduler {
    /// Create a scheduler driving the given poller backend.
    pub fn new(poller: Arc<dyn Poller>) -> Arc<Self> {
        Arc::new(Self {
            poller,
            timer: Timer::new(),
            inner: Mutex::new(Inner {
                tasks: FxHashMap::default(),
                task_count: 0,
                ready: VecDeque::new(),
                suspended: FxHashMap::default(),
                poller_data: FxHashMap::default(),
                started: false,
                groups: FxHashMap::default(),
                exit_waiters: FxHashMap::default(),
                deferred_error: None,
                tasks_spawned: 0,
                tasks_finished: 0,
            }),
            edge_clear: AtomicU8::new(EDGE_CLEAR_UNKNOWN),
        })
    }

    // ========================================================================
    // Task lifecycle
    // ========================================================================

    /// Spawn an anonymous task. Before `runloop` the task is queued; once the
    /// loop has started it is resumed immediately.
    pub fn co_start<F>(self: &Arc<Self>, body: F) -> Result<CoroutineHandle, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(None, body)
    }

    /// Spawn a named task. The name shows up in diagnostics and error text.
    pub fn co_start_named<F>(
        self: &Arc<Self>,
        name: &str,
        body: F,
    ) -> Result<CoroutineHandle, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_task(Some(name.to_string()), body)
    }

    fn spawn_task<F>(
        self: &Arc<Self>,
        name: Option<String>,
        body: F,
    ) -> Result<CoroutineHandle, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sched = Arc::downgrade(self);
        // The fiber needs its own handle for current-task tracking, but the
        // handle can only be built around the fiber. Hand it through a
        // one-shot channel: the fiber does not run until its first resume,
        // which happens strictly after the send below.
        let (handle_tx, handle_rx) = crossbeam_channel::bounded::<CoroutineHandle>(1);

        let label = name.clone().unwrap_or_else(|| "anon".to_string());
        let fiber = Fiber::spawn(&label, move || {
            let Ok(handle) = handle_rx.recv() else {
                return;
            };
            let guard = Coroutine::enter(handle.clone());
            let result = panic::catch_unwind(AssertUnwindSafe(body));
            drop(guard);
            // Exit bookkeeping runs for panicking bodies too; the panic is
            // re-raised afterwards so the resumer still observes the abort.
            if let Some(sched) = sched.upgrade() {
                sched.on_task_exit(&handle);
            }
            if let Err(payload) = result {
                panic::resume_unwind(payload);
            }
        });

        let handle = Coroutine::new(name, fiber);
        let _ = handle_tx.send(handle.clone());

        let resume_now = {
            let mut inner = self.inner.lock();
            inner.tasks.insert(handle.id(), handle.clone());
            inner.task_count += 1;
            inner.tasks_spawned += 1;
            for group in inner.groups.values_mut().filter(|g| g.open) {
                group.total += 1;
                group.pending.insert(handle.id());
            }
            if inner.started {
                true
            } else {
                inner.ready.push_back((handle.clone(), ResumeValue::Unit));
                false
            }
        };

        if resume_now {
            self.co_resume(&handle, ResumeValue::Unit)?;
        }
        Ok(handle)
    }

    /// Resume `co` with `value`; the value becomes the return of the matching
    /// suspend. Fails when `co` is not suspended or its body aborts.
    pub fn co_resume(&self, co: &CoroutineHandle, value: ResumeValue) -> Result<(), SchedError> {
        co.resume(value)
    }

    /// Suspend the calling task, yielding `value` to its resumer. Returns the
    /// value delivered by the matching resume. Only valid inside a managed
    /// task.
    pub fn co_suspend(&self, value: ResumeValue) -> Result<ResumeValue, SchedError> {
        if Coroutine::current().is_none() {
            return Err(SchedError::OutsideCoroutine);
        }
        fiber::suspend(value)
    }

    /// The handle of the task running on the calling thread, if any.
    pub fn co_running(&self) -> Option<CoroutineHandle> {
        Coroutine::current()
    }

    /// Snapshot of all live task handles.
    pub fn co_tasks(&self) -> Vec<CoroutineHandle> {
        self.inner.lock().tasks.values().cloned().collect()
    }

    /// Number of live tasks.
    pub fn co_count(&self) -> usize {
        self.inner.lock().task_count
    }

    /// Scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock();
        SchedulerStats {
            tasks_spawned: inner.tasks_spawned,
            tasks_finished: inner.tasks_finished,
            active_tasks: inner.task_count,
            suspended_tasks: inner.suspended.len(),
        }
    }

    /// Runs on the exiting task's own fiber thread, after its body returned
    /// or panicked: drops the table entry and wakes exit/group waiters.
    fn on_task_exit(self: &Arc<Self>, handle: &CoroutineHandle) {
        let (to_wake, started) = {
            let mut inner = self.inner.lock();
            inner.tasks.remove(&handle.id());
            inner.task_count = inner.task_count.saturating_sub(1);
            inner.tasks_finished += 1;

            let mut to_wake = Vec::new();
            if let Some(waiters) = inner.exit_waiters.remove(&handle.id()) {
                to_wake.extend(waiters);
            }
            for group in inner.groups.values_mut() {
                if group.pending.remove(&handle.id()) && group.pending.is_empty() {
                    to_wake.append(&mut group.waiters);
                }
            }
            // Suspended-set membership is wakeup ownership: a waiter someone
            // else already claimed (teardown, a racing group) is skipped.
            let started = inner.started;
            to_wake.retain(|w| {
                let claim = matches!(
                    inner.suspended.get(&w.id()),
                    Some(waiting) if matches!(waiting.kind, WaitKind::TaskExit | WaitKind::Group)
                );
                if claim {
                    inner.suspended.remove(&w.id());
                }
                claim
            });
            (to_wake, started)
        };

        for waiter in to_wake {
            let value = if started {
                ResumeValue::Unit
            } else {
                ResumeValue::Error(SchedError::Stopped)
            };
            if let Err(err) = waiter.resume(value) {
                self.defer_error(err);
            }
        }
    }

    fn defer_error(&self, err: SchedError) {
        let mut inner = self.inner.lock();
        inner.deferred_error.get_or_insert(err);
    }

    // ========================================================================
    // I/O suspension
    // ========================================================================

    /// Park the calling task until `obj` is ready for any of `events`
    /// (a subset of RECV|SEND), the timeout elapses, or an error occurs.
    ///
    /// Returns the subset of `events` that became ready; the empty set
    /// signals a timeout. `timeout: None` waits forever; `Some(ZERO)` times
    /// out on the next timer pass.
    ///
    /// Readiness cached from a previous delivery satisfies the wait without
    /// touching the poller.
    pub fn poller_wait(
        self: &Arc<Self>,
        obj: &Arc<dyn Pollable>,
        events: EventSet,
        timeout: Option<Duration>,
    ) -> Result<EventSet, SchedError> {
        let current = Coroutine::current().ok_or(SchedError::OutsideCoroutine)?;
        match obj.kind() {
            ObjectKind::Sock | ObjectKind::Pipe => {}
            kind => return Err(SchedError::InvalidObject(kind)),
        }

        let token = obj.token();
        {
            let mut inner = self.inner.lock();
            if !inner.started {
                return Err(SchedError::NotStarted);
            }

            // Edge-trigger request: sockets get CLEAR in their registration
            // when the backend supports it.
            let mut reg_events = events;
            if obj.kind() == ObjectKind::Sock && self.supports_edge_clear() {
                reg_events |= EventSet::CLEAR;
            }

            match inner.poller_data.get_mut(&token) {
                Some(entry) => {
                    // Cached-readiness shortcut: consume saved events without
                    // a poller round trip.
                    if !entry.events_wait.is_empty() && entry.events_save.intersects(events) {
                        if entry.events_save.contains(EventSet::ERROR) {
                            entry.events_save = EventSet::NONE;
                            return Err(SchedError::EventsError);
                        }
                        let hit = entry.events_save & events;
                        entry.events_save = entry.events_save.without(hit);
                        return Ok(hit);
                    }

                    // Reconcile the registration: drop directions nobody
                    // waits on any more, add ours, and only touch the poller
                    // when a new bit appears.
                    let mut new_wait = entry.events_wait;
                    if entry.co_recv.is_none() {
                        new_wait = new_wait.without(EventSet::RECV);
                    }
                    if entry.co_send.is_none() {
                        new_wait = new_wait.without(EventSet::SEND);
                    }
                    new_wait |= reg_events;
                    if !entry.events_wait.contains(new_wait) {
                        self.poller
                            .modify(obj.as_ref(), new_wait, DispatchKind::Io)?;
                    }
                    entry.events_wait = new_wait;
                }
                None => {
                    self.poller
                        .insert(obj.clone(), reg_events, DispatchKind::Io)?;
                    inner.poller_data.insert(
                        token,
                        PollerEntry {
                            obj: obj.clone(),
                            co_recv: None,
                            co_send: None,
                            events_wait: reg_events,
                            events_save: EventSet::NONE,
                        },
                    );
                }
            }

            if let Some(timeout) = timeout {
                let weak = Arc::downgrade(self);
                let co = current.clone();
                let timer_task = self.timer.post(timeout, move |cancelled| {
                    if cancelled {
                        return Ok(());
                    }
                    match weak.upgrade() {
                        Some(sched) => sched.io_timeout(&co, token),
                        None => Ok(()),
                    }
                });
                current.set_timer_task(timer_task);
            }

            let entry = inner
                .poller_data
                .get_mut(&token)
                .expect("entry inserted above");
            if events.contains(EventSet::RECV) {
                entry.co_recv = Some(current.clone());
            }
            if events.contains(EventSet::SEND) {
                entry.co_send = Some(current.clone());
            }
            entry.events_save = EventSet::NONE;
            inner.suspended.insert(
                current.id(),
                Waiting {
                    co: current.clone(),
                    kind: WaitKind::Io(token),
                },
            );
        }

        match fiber::suspend(ResumeValue::Unit)? {
            ResumeValue::Events(ready) => Ok(ready),
            ResumeValue::Error(err) => Err(err),
            ResumeValue::Unit => Ok(EventSet::NONE),
        }
    }

    /// Forget the wait bookkeeping for `obj` and drop its poller
    /// registration. Tasks still parked on the object are woken by the run
    /// loop's teardown or by a pending timeout. No-op for unknown objects.
    pub fn poller_cancel(&self, obj: &Arc<dyn Pollable>) -> Result<(), SchedError> {
        let token = obj.token();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.poller_data.get(&token) {
            if !entry.events_wait.is_empty() {
                self.poller.remove(obj.as_ref())?;
            }
            inner.poller_data.remove(&token);
        }
        Ok(())
    }

    /// Resume a task parked on the given kind of wait, if it still owns its
    /// wakeup. Timer callbacks land here.
    fn wake_kind(
        &self,
        co: &CoroutineHandle,
        kind: WaitKind,
        value: ResumeValue,
    ) -> Result<(), SchedError> {
        let owned = {
            let mut inner = self.inner.lock();
            match inner.suspended.get(&co.id()) {
                Some(waiting) if waiting.kind == kind => {
                    inner.suspended.remove(&co.id());
                    true
                }
                _ => false,
            }
        };
        if owned {
            co.resume(value)
        } else {
            Ok(())
        }
    }

    /// A `poller_wait` timeout fired: claim the wakeup, scrub the task out of
    /// the object's waiter slots, and resume it with the empty set.
    fn io_timeout(&self, co: &CoroutineHandle, token: PollToken) -> Result<(), SchedError> {
        let owned = {
            let mut inner = self.inner.lock();
            let owned = matches!(
                inner.suspended.get(&co.id()),
                Some(waiting) if waiting.kind == WaitKind::Io(token)
            );
            if owned {
                inner.suspended.remove(&co.id());
                if let Some(entry) = inner.poller_data.get_mut(&token) {
                    if entry.co_recv.as_ref().map(|c| c.id()) == Some(co.id()) {
                        entry.co_recv = None;
                    }
                    if entry.co_send.as_ref().map(|c| c.id()) == Some(co.id()) {
                        entry.co_send = None;
                    }
                }
            }
            owned
        };
        if owned {
            co.resume(ResumeValue::Events(EventSet::NONE))
        } else {
            Ok(())
        }
    }

    fn supports_edge_clear(&self) -> bool {
        match self.edge_clear.load(Ordering::Acquire) {
            EDGE_CLEAR_YES => true,
            EDGE_CLEAR_NO => false,
            _ => {
                let supported = self.poller.supports(ObjectKind::Sock, EventSet::CLEAR);
                let state = if supported {
                    EDGE_CLEAR_YES
                } else {
                    EDGE_CLEAR_NO
                };
                self.edge_clear.store(state, Ordering::Release);
                supported
            }
        }
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// Route readiness reported for one object to the task(s) parked on it.
    ///
    /// EOF is sticky: it is folded into the cached readiness for whichever
    /// directions the object was registered for, so the next wait is
    /// satisfied from cache. Readiness with no waiter is cached the same way.
    fn dispatch_io(&self, obj: &Arc<dyn Pollable>, mut events: EventSet) -> Result<(), SchedError> {
        let token = obj.token();

        enum Route {
            Idle,
            Merged(CoroutineHandle),
            Split {
                recv: Option<CoroutineHandle>,
                send: Option<CoroutineHandle>,
            },
        }

        let route = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.poller_data.get_mut(&token) else {
                #[cfg(debug_assertions)]
                eprintln!(
                    "scheduler: dropping {:?} for unknown object {:?}",
                    events, token
                );
                return Ok(());
            };

            if events.contains(EventSet::EOF) {
                events = events.without(EventSet::EOF);
                entry.events_save |= entry.events_wait & EventSet::BOTH;
            }

            // ERROR is direction-agnostic: it resolves waiters on both sides.
            let co_recv = if events.intersects(EventSet::RECV | EventSet::ERROR) {
                entry.co_recv.clone()
            } else {
                None
            };
            let co_send = if events.intersects(EventSet::SEND | EventSet::ERROR) {
                entry.co_send.clone()
            } else {
                None
            };

            match (co_recv, co_send) {
                (Some(recv), Some(send)) if recv.id() == send.id() => {
                    entry.co_recv = None;
                    entry.co_send = None;
                    Route::Merged(recv)
                }
                (None, None) => Route::Idle,
                (recv, send) => {
                    if recv.is_some() {
                        entry.co_recv = None;
                    }
                    if send.is_some() {
                        entry.co_send = None;
                    }
                    Route::Split { recv, send }
                }
            }
        };

        let mut delivered = false;
        match route {
            Route::Idle => {}
            Route::Merged(co) => {
                // One task on both directions: wake it once with everything.
                if self.resume_io_waiter(&co, token, events)? {
                    events = events.without(EventSet::BOTH);
                    delivered = true;
                }
            }
            Route::Split { recv, send } => {
                if let Some(co) = recv {
                    if self.resume_io_waiter(&co, token, events.without(EventSet::SEND))? {
                        events = events.without(EventSet::RECV);
                        delivered = true;
                    }
                }
                if let Some(co) = send {
                    if self.resume_io_waiter(&co, token, events.without(EventSet::RECV))? {
                        events = events.without(EventSet::SEND);
                        delivered = true;
                    }
                }
            }
        }

        // Carry unconsumed readiness for the next waiter. An error nobody
        // observed stays sticky until the next wait surfaces it.
        let mut carry = events & EventSet::BOTH;
        if !delivered && events.contains(EventSet::ERROR) {
            carry |= EventSet::ERROR;
        }
        if !carry.is_empty() {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.poller_data.get_mut(&token) {
                entry.events_save |= carry;
            }
        }
        Ok(())
    }

    /// Wake a task parked in `poller_wait`: cancel its pending timeout, claim
    /// its wakeup, and resume it with the readiness, or with an error when
    /// the events carry ERROR or the scheduler is tearing down.
    ///
    /// Returns false when the task no longer owns its wakeup (its timeout
    /// already fired); the caller then keeps the readiness cached instead.
    fn resume_io_waiter(
        &self,
        co: &CoroutineHandle,
        token: PollToken,
        events: EventSet,
    ) -> Result<bool, SchedError> {
        let (owned, started) = {
            let mut inner = self.inner.lock();
            let owned = matches!(
                inner.suspended.get(&co.id()),
                Some(waiting) if waiting.kind == WaitKind::Io(token)
            );
            if owned {
                inner.suspended.remove(&co.id());
            }
            (owned, inner.started)
        };
        if !owned {
            return Ok(false);
        }
        co.cancel_timer_task();
        debug_assert!(co.is_suspended());
        let value = if events.contains(EventSet::ERROR) {
            ResumeValue::Error(SchedError::EventsError)
        } else if !started {
            ResumeValue::Error(SchedError::Stopped)
        } else {
            ResumeValue::Events(events)
        };
        co.resume(value)?;
        Ok(true)
    }

    // ========================================================================
    // Sleep
    // ========================================================================

    /// Park the calling task for `duration`. Zero returns immediately.
    pub fn sleep(self: &Arc<Self>, duration: Duration) -> Result<(), SchedError> {
        let current = Coroutine::current().ok_or(SchedError::OutsideCoroutine)?;
        if duration.is_zero() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            if !inner.started {
                return Err(SchedError::NotStarted);
            }
            let weak = Arc::downgrade(self);
            let co = current.clone();
            let timer_task = self.timer.post(duration, move |cancelled| {
                if cancelled {
                    return Ok(());
                }
                match weak.upgrade() {
                    Some(sched) => sched.wake_kind(&co, WaitKind::Sleep, ResumeValue::Unit),
                    None => Ok(()),
                }
            });
            current.set_timer_task(timer_task);
            inner.suspended.insert(
                current.id(),
                Waiting {
                    co: current.clone(),
                    kind: WaitKind::Sleep,
                },
            );
        }
        match fiber::suspend(ResumeValue::Unit)? {
            ResumeValue::Error(err) => Err(err),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Coroutine groups
    // ========================================================================

    /// Open the named group for the duration of `scope`: every task spawned
    /// inside it becomes a member. Reopening an already-open group fails;
    /// reopening a drained group accumulates new members.
    pub fn co_group_begin<F>(self: &Arc<Self>, name: &str, scope: F) -> Result<(), SchedError>
    where
        F: FnOnce() -> Result<(), SchedError>,
    {
        {
            let mut inner = self.inner.lock();
            let group = inner.groups.entry(name.to_string()).or_default();
            if group.open {
                return Err(SchedError::GroupAlreadyOpen(name.to_string()));
            }
            group.open = true;
        }
        let result = scope();
        {
            let mut inner = self.inner.lock();
            if let Some(group) = inner.groups.get_mut(name) {
                group.open = false;
            }
        }
        result
    }

    /// Park the calling task until every member of the named group has
    /// terminated. Returns immediately when the group is already drained.
    pub fn co_group_wait(&self, name: &str) -> Result<(), SchedError> {
        let current = Coroutine::current().ok_or(SchedError::OutsideCoroutine)?;
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.started {
                    return Err(SchedError::NotStarted);
                }
                let Some(group) = inner.groups.get_mut(name) else {
                    return Err(SchedError::UnknownGroup(name.to_string()));
                };
                if group.pending.is_empty() {
                    return Ok(());
                }
                group.waiters.push(current.clone());
                inner.suspended.insert(
                    current.id(),
                    Waiting {
                        co: current.clone(),
                        kind: WaitKind::Group,
                    },
                );
            }
            if let ResumeValue::Error(err) = fiber::suspend(ResumeValue::Unit)? {
                return Err(err);
            }
            // Members may have been added since the wakeup; re-check.
        }
    }

    /// Progress of the named group as `(finished, total)`.
    pub fn co_group_count(&self, name: &str) -> Result<(usize, usize), SchedError> {
        let inner = self.inner.lock();
        match inner.groups.get(name) {
            Some(group) => Ok((group.total - group.pending.len(), group.total)),
            None => Err(SchedError::UnknownGroup(name.to_string())),
        }
    }

    /// Park the calling task until `target` has terminated. Returns
    /// immediately when it already has.
    pub fn co_wait_exit(&self, target: &CoroutineHandle) -> Result<(), SchedError> {
        let current = Coroutine::current().ok_or(SchedError::OutsideCoroutine)?;
        {
            let mut inner = self.inner.lock();
            if !inner.started {
                return Err(SchedError::NotStarted);
            }
            if !inner.tasks.contains_key(&target.id()) {
                return Ok(());
            }
            inner
                .exit_waiters
                .entry(target.id())
                .or_default()
                .push(current.clone());
            inner.suspended.insert(
                current.id(),
                Waiting {
                    co: current.clone(),
                    kind: WaitKind::TaskExit,
                },
            );
        }
        match fiber::suspend(ResumeValue::Unit)? {
            ResumeValue::Error(err) => Err(err),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Drive all tasks to completion.
    ///
    /// Resumes the queued tasks in spawn order, then loops: block in the
    /// poller for up to the next timer deadline, dispatch readiness, fire due
    /// timers. Exits when no tasks remain, [`stop`](Self::stop) is called, or
    /// a failure occurs. On exit every still-suspended task is cancelled (its
    /// blocking call returns [`SchedError::Stopped`]) and the timer is
    /// killed. Returns the first loop error, or the first teardown error when
    /// the loop itself was clean.
    pub fn runloop(self: &Arc<Self>) -> Result<(), SchedError> {
        {
            let mut inner = self.inner.lock();
            inner.started = true;
            inner.deferred_error = None;
        }
        self.supports_edge_clear();

        let mut loop_err: Option<SchedError> = None;

        // Resume tasks queued before the loop started, in insertion order.
        loop {
            let next = self.inner.lock().ready.pop_front();
            let Some((co, value)) = next else {
                break;
            };
            if let Err(err) = self.co_resume(&co, value) {
                loop_err = Some(err);
                break;
            }
        }

        while loop_err.is_none() {
            {
                let mut inner = self.inner.lock();
                if let Some(err) = inner.deferred_error.take() {
                    loop_err = Some(err);
                    break;
                }
                if !inner.started || inner.task_count == 0 {
                    break;
                }
            }

            let timeout = self.timer.delay().unwrap_or(IDLE_WAIT);
            let events = match self.poller.wait(Some(timeout)) {
                Ok(events) => events,
                Err(err) => {
                    loop_err = Some(err.into());
                    break;
                }
            };

            for event in events {
                let result = match event.dispatch {
                    DispatchKind::Io => self.dispatch_io(&event.obj, event.events),
                };
                if let Err(err) = result {
                    loop_err = Some(err);
                    break;
                }
            }
            if loop_err.is_some() {
                break;
            }

            // Timers fire strictly after all poller dispatches for the
            // iteration.
            if let Err(err) = self.timer.next() {
                loop_err = Some(err);
                break;
            }
        }

        let teardown_err = self.teardown();
        match loop_err {
            Some(err) => Err(err),
            None => match teardown_err {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    /// Cancel all remaining suspended work. Entries are released in cycle
    /// order: poller bookkeeping first, then the suspended set, then the
    /// timer; task-table entries drop as each cancelled task unwinds.
    fn teardown(self: &Arc<Self>) -> Option<SchedError> {
        let (entries, suspended) = {
            let mut inner = self.inner.lock();
            inner.started = false;
            let entries: Vec<PollerEntry> = inner.poller_data.drain().map(|(_, e)| e).collect();
            let suspended: Vec<CoroutineHandle> =
                inner.suspended.drain().map(|(_, waiting)| waiting.co).collect();
            inner.groups.clear();
            inner.exit_waiters.clear();
            (entries, suspended)
        };

        let mut first_err: Option<SchedError> = None;
        for entry in &entries {
            if !entry.events_wait.is_empty() {
                if let Err(err) = self.poller.remove(entry.obj.as_ref()) {
                    first_err.get_or_insert(err.into());
                }
            }
        }
        drop(entries);

        for co in suspended {
            co.cancel_timer_task();
            if !co.is_suspended() {
                continue;
            }
            if let Err(err) = co.resume(ResumeValue::Error(SchedError::Stopped)) {
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = self.timer.kill() {
            first_err.get_or_insert(err);
        }

        let mut inner = self.inner.lock();
        if let Some(err) = inner.deferred_error.take() {
            first_err.get_or_insert(err);
        }
        first_err
    }

    /// Stop the run loop: clears the started flag and wakes its blocking
    /// poller wait. Idempotent; callable from inside a task or from another
    /// thread to the extent the poller's `spank` is.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            inner.started = false;
        }
        self.poller.spank();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
