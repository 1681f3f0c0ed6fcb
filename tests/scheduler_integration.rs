//! Integration tests for the cooperative scheduler: readiness routing,
//! caching, timeouts, errors, and teardown.

use faber_runtime::{
    EventSet, ManualPoller, ObjectKind, PollToken, Pollable, Scheduler, SchedError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct TestObj {
    kind: ObjectKind,
    token: PollToken,
}

impl TestObj {
    fn sock() -> Arc<Self> {
        Arc::new(Self {
            kind: ObjectKind::Sock,
            token: PollToken::next(),
        })
    }

    fn pipe() -> Arc<Self> {
        Arc::new(Self {
            kind: ObjectKind::Pipe,
            token: PollToken::next(),
        })
    }

    fn proc_obj() -> Arc<Self> {
        Arc::new(Self {
            kind: ObjectKind::Proc,
            token: PollToken::next(),
        })
    }
}

impl Pollable for TestObj {
    fn kind(&self) -> ObjectKind {
        self.kind
    }
    fn token(&self) -> PollToken {
        self.token
    }
}

fn pollable(obj: &Arc<TestObj>) -> Arc<dyn Pollable> {
    obj.clone() as Arc<dyn Pollable>
}

fn new_runtime() -> (Arc<Scheduler>, Arc<ManualPoller>) {
    let poller = Arc::new(ManualPoller::new());
    (Scheduler::new(poller.clone()), poller)
}

#[test]
fn test_recv_wait_resumes_on_readiness() {
    let (sched, poller) = new_runtime();
    let sock = TestObj::sock();
    let result = Arc::new(Mutex::new(None));

    let obj = pollable(&sock);
    let waiter_sched = sched.clone();
    let slot = result.clone();
    sched
        .co_start_named("waiter", move || {
            *slot.lock() = Some(waiter_sched.poller_wait(&obj, EventSet::RECV, None));
        })
        .unwrap();

    let driver_sched = sched.clone();
    let token = sock.token();
    sched
        .co_start_named("driver", move || {
            // Let the waiter register first.
            driver_sched.sleep(Duration::from_millis(5)).unwrap();
            poller.post(token, EventSet::RECV);
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Ok(EventSet::RECV)));
    assert_eq!(sched.co_count(), 0);
}

#[test]
fn test_leftover_readiness_satisfies_next_wait_from_cache() {
    let (sched, poller) = new_runtime();
    let sock = TestObj::sock();
    let first = Arc::new(Mutex::new(None));
    let second = Arc::new(Mutex::new(None));

    let obj = pollable(&sock);
    let waiter_sched = sched.clone();
    let first_slot = first.clone();
    let second_slot = second.clone();
    let driver_poller = poller.clone();
    let token = sock.token();
    sched
        .co_start_named("scenario", move || {
            // Task A parks, gets resumed by real readiness.
            let a_sched = waiter_sched.clone();
            let a_obj = obj.clone();
            let a_slot = first_slot.clone();
            let a = waiter_sched
                .co_start_named("a", move || {
                    *a_slot.lock() = Some(a_sched.poller_wait(&a_obj, EventSet::RECV, None));
                })
                .unwrap();
            waiter_sched.sleep(Duration::from_millis(5)).unwrap();
            driver_poller.post(token, EventSet::RECV);
            waiter_sched.co_wait_exit(&a).unwrap();

            // Readiness delivered with nobody waiting is cached ...
            driver_poller.post(token, EventSet::RECV);
            waiter_sched.sleep(Duration::from_millis(5)).unwrap();

            // ... and the next wait consumes it without parking: if task B
            // had suspended it would time out and observe NONE instead.
            let b_sched = waiter_sched.clone();
            let b_obj = obj.clone();
            let b_slot = second_slot.clone();
            waiter_sched
                .co_start_named("b", move || {
                    *b_slot.lock() = Some(b_sched.poller_wait(
                        &b_obj,
                        EventSet::RECV,
                        Some(Duration::from_millis(20)),
                    ));
                })
                .unwrap();
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(first.lock().clone(), Some(Ok(EventSet::RECV)));
    assert_eq!(second.lock().clone(), Some(Ok(EventSet::RECV)));
}

#[test]
fn test_merged_recv_send_wakes_once_with_both() {
    let (sched, poller) = new_runtime();
    let pipe = TestObj::pipe();
    let result = Arc::new(Mutex::new(None));
    let wakeups = Arc::new(AtomicUsize::new(0));

    let obj = pollable(&pipe);
    let waiter_sched = sched.clone();
    let slot = result.clone();
    let count = wakeups.clone();
    sched
        .co_start_named("waiter", move || {
            let got = waiter_sched.poller_wait(&obj, EventSet::BOTH, None);
            count.fetch_add(1, Ordering::SeqCst);
            *slot.lock() = Some(got);
        })
        .unwrap();

    let driver_sched = sched.clone();
    let token = pipe.token();
    sched
        .co_start_named("driver", move || {
            driver_sched.sleep(Duration::from_millis(5)).unwrap();
            poller.post(token, EventSet::BOTH);
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Ok(EventSet::BOTH)));
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_split_recv_send_waiters_each_get_their_direction() {
    let (sched, poller) = new_runtime();
    let sock = TestObj::sock();
    let recv_result = Arc::new(Mutex::new(None));
    let send_result = Arc::new(Mutex::new(None));

    let recv_obj = pollable(&sock);
    let recv_sched = sched.clone();
    let recv_slot = recv_result.clone();
    sched
        .co_start_named("reader", move || {
            *recv_slot.lock() = Some(recv_sched.poller_wait(&recv_obj, EventSet::RECV, None));
        })
        .unwrap();

    let send_obj = pollable(&sock);
    let send_sched = sched.clone();
    let send_slot = send_result.clone();
    sched
        .co_start_named("writer", move || {
            *send_slot.lock() = Some(send_sched.poller_wait(&send_obj, EventSet::SEND, None));
        })
        .unwrap();

    let driver_sched = sched.clone();
    let token = sock.token();
    sched
        .co_start_named("driver", move || {
            driver_sched.sleep(Duration::from_millis(5)).unwrap();
            poller.post(token, EventSet::BOTH);
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(recv_result.lock().clone(), Some(Ok(EventSet::RECV)));
    assert_eq!(send_result.lock().clone(), Some(Ok(EventSet::SEND)));
}

#[test]
fn test_wait_timeout_returns_empty_set() {
    let (sched, _poller) = new_runtime();
    let sock = TestObj::sock();
    let result = Arc::new(Mutex::new(None));

    let obj = pollable(&sock);
    let waiter_sched = sched.clone();
    let slot = result.clone();
    sched
        .co_start_named("waiter", move || {
            *slot.lock() = Some(waiter_sched.poller_wait(
                &obj,
                EventSet::RECV,
                Some(Duration::from_millis(30)),
            ));
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Ok(EventSet::NONE)));
    let stats = sched.stats();
    assert_eq!(stats.suspended_tasks, 0);
    assert_eq!(stats.active_tasks, 0);
}

#[test]
fn test_error_event_fails_the_wait() {
    let (sched, poller) = new_runtime();
    let sock = TestObj::sock();
    let result = Arc::new(Mutex::new(None));
    let after = Arc::new(Mutex::new(None));

    let obj = pollable(&sock);
    let waiter_sched = sched.clone();
    let slot = result.clone();
    let after_slot = after.clone();
    sched
        .co_start_named("waiter", move || {
            *slot.lock() = Some(waiter_sched.poller_wait(&obj, EventSet::RECV, None));
            // The error is consumed by the failed wait, not left sticky.
            *after_slot.lock() = Some(waiter_sched.poller_wait(
                &obj,
                EventSet::RECV,
                Some(Duration::from_millis(10)),
            ));
        })
        .unwrap();

    let driver_sched = sched.clone();
    let token = sock.token();
    sched
        .co_start_named("driver", move || {
            driver_sched.sleep(Duration::from_millis(5)).unwrap();
            poller.post(token, EventSet::ERROR);
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Err(SchedError::EventsError)));
    assert_eq!(after.lock().clone(), Some(Ok(EventSet::NONE)));
}

#[test]
fn test_sticky_error_surfaces_on_next_wait_then_clears() {
    let (sched, poller) = new_runtime();
    let sock = TestObj::sock();
    let sticky = Arc::new(Mutex::new(None));
    let after = Arc::new(Mutex::new(None));

    let obj = pollable(&sock);
    let task_sched = sched.clone();
    let sticky_slot = sticky.clone();
    let after_slot = after.clone();
    let token = sock.token();
    sched
        .co_start_named("scenario", move || {
            // Register interest and time out, leaving the registration behind.
            let got = task_sched
                .poller_wait(&obj, EventSet::RECV, Some(Duration::from_millis(10)))
                .unwrap();
            assert_eq!(got, EventSet::NONE);

            // Readiness + error with no live waiter stays cached.
            poller.post(token, EventSet::RECV | EventSet::ERROR);
            task_sched.sleep(Duration::from_millis(5)).unwrap();

            *sticky_slot.lock() = Some(task_sched.poller_wait(&obj, EventSet::RECV, None));
            *after_slot.lock() = Some(task_sched.poller_wait(
                &obj,
                EventSet::RECV,
                Some(Duration::from_millis(10)),
            ));
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(sticky.lock().clone(), Some(Err(SchedError::EventsError)));
    // The sticky cache was cleared along with the error.
    assert_eq!(after.lock().clone(), Some(Ok(EventSet::NONE)));
}

#[test]
fn test_eof_is_retained_for_the_next_wait() {
    let (sched, poller) = new_runtime();
    let pipe = TestObj::pipe();
    let result = Arc::new(Mutex::new(None));

    let obj = pollable(&pipe);
    let task_sched = sched.clone();
    let slot = result.clone();
    let token = pipe.token();
    sched
        .co_start_named("scenario", move || {
            // Register interest, then time out so nobody is waiting.
            let got = task_sched
                .poller_wait(&obj, EventSet::RECV, Some(Duration::from_millis(10)))
                .unwrap();
            assert_eq!(got, EventSet::NONE);

            // EOF with no waiter becomes cached readiness for the
            // registered direction.
            poller.post(token, EventSet::EOF);
            task_sched.sleep(Duration::from_millis(5)).unwrap();

            // Satisfied from cache; a parked wait would observe NONE.
            *slot.lock() = Some(task_sched.poller_wait(
                &obj,
                EventSet::RECV,
                Some(Duration::from_millis(10)),
            ));
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Ok(EventSet::RECV)));
}

#[test]
fn test_stop_cancels_suspended_waits() {
    let (sched, _poller) = new_runtime();
    let sock_a = TestObj::sock();
    let sock_b = TestObj::sock();
    let result_a = Arc::new(Mutex::new(None));
    let result_b = Arc::new(Mutex::new(None));

    let obj_a = pollable(&sock_a);
    let sched_a = sched.clone();
    let slot_a = result_a.clone();
    sched
        .co_start_named("a", move || {
            *slot_a.lock() = Some(sched_a.poller_wait(&obj_a, EventSet::RECV, None));
        })
        .unwrap();

    let obj_b = pollable(&sock_b);
    let sched_b = sched.clone();
    let slot_b = result_b.clone();
    sched
        .co_start_named("b", move || {
            *slot_b.lock() = Some(sched_b.poller_wait(&obj_b, EventSet::RECV, None));
        })
        .unwrap();

    let stopper = sched.clone();
    sched
        .co_start_named("stopper", move || {
            stopper.sleep(Duration::from_millis(10)).unwrap();
            stopper.stop();
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result_a.lock().clone(), Some(Err(SchedError::Stopped)));
    assert_eq!(result_b.lock().clone(), Some(Err(SchedError::Stopped)));
    assert_eq!(sched.co_count(), 0);
    assert!(sched.co_tasks().is_empty());
}

#[test]
fn test_stop_cancels_sleepers() {
    let (sched, _poller) = new_runtime();
    let result = Arc::new(Mutex::new(None));

    let sleeper = sched.clone();
    let slot = result.clone();
    sched
        .co_start_named("sleeper", move || {
            *slot.lock() = Some(sleeper.sleep(Duration::from_secs(60)));
        })
        .unwrap();

    let stopper = sched.clone();
    sched
        .co_start_named("stopper", move || {
            stopper.sleep(Duration::from_millis(10)).unwrap();
            stopper.stop();
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Err(SchedError::Stopped)));
    assert_eq!(sched.co_count(), 0);
}

#[test]
fn test_wait_on_process_object_is_rejected() {
    let (sched, _poller) = new_runtime();
    let proc_obj = TestObj::proc_obj();
    let result = Arc::new(Mutex::new(None));

    let obj = pollable(&proc_obj);
    let task_sched = sched.clone();
    let slot = result.clone();
    sched
        .co_start(move || {
            *slot.lock() = Some(task_sched.poller_wait(&obj, EventSet::RECV, None));
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(
        result.lock().clone(),
        Some(Err(SchedError::InvalidObject(ObjectKind::Proc)))
    );
}

#[test]
fn test_wait_outside_coroutine_is_rejected() {
    let (sched, _poller) = new_runtime();
    let sock = TestObj::sock();
    let obj = pollable(&sock);
    assert_eq!(
        sched.poller_wait(&obj, EventSet::RECV, None),
        Err(SchedError::OutsideCoroutine)
    );
}

#[test]
fn test_poller_cancel_is_idempotent() {
    let (sched, poller) = new_runtime();
    let sock = TestObj::sock();

    let obj = pollable(&sock);
    let task_sched = sched.clone();
    let task_poller = poller.clone();
    sched
        .co_start_named("canceller", move || {
            let got = task_sched
                .poller_wait(&obj, EventSet::RECV, Some(Duration::from_millis(10)))
                .unwrap();
            assert_eq!(got, EventSet::NONE);
            assert_eq!(task_poller.registered_count(), 1);

            task_sched.poller_cancel(&obj).unwrap();
            assert_eq!(task_poller.registered_count(), 0);
            // Second cancel is a no-op on an unknown object.
            task_sched.poller_cancel(&obj).unwrap();
        })
        .unwrap();

    sched.runloop().unwrap();
}

#[test]
fn test_edge_clear_sockets_still_deliver() {
    let poller = Arc::new(ManualPoller::with_edge_clear(true));
    let sched = Scheduler::new(poller.clone());
    let sock = TestObj::sock();
    let result = Arc::new(Mutex::new(None));

    let obj = pollable(&sock);
    let waiter_sched = sched.clone();
    let slot = result.clone();
    sched
        .co_start_named("waiter", move || {
            *slot.lock() = Some(waiter_sched.poller_wait(&obj, EventSet::RECV, None));
        })
        .unwrap();

    let driver_sched = sched.clone();
    let token = sock.token();
    sched
        .co_start_named("driver", move || {
            driver_sched.sleep(Duration::from_millis(5)).unwrap();
            poller.post(token, EventSet::RECV);
        })
        .unwrap();

    sched.runloop().unwrap();
    assert_eq!(result.lock().clone(), Some(Ok(EventSet::RECV)));
}

#[test]
fn test_runloop_after_stop_runs_fresh_tasks() {
    let (sched, _poller) = new_runtime();

    let stopper = sched.clone();
    sched
        .co_start(move || {
            stopper.stop();
        })
        .unwrap();
    sched.runloop().unwrap();
    assert_eq!(sched.co_count(), 0);

    // A fresh batch runs on the next loop.
    let ran = Arc::new(AtomicUsize::new(0));
    let count = ran.clone();
    sched
        .co_start(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    sched.runloop().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_many_tasks_with_mixed_waits() {
    let (sched, poller) = new_runtime();
    let finished = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        let sock = TestObj::sock();
        let obj = pollable(&sock);
        let token = sock.token();
        let task_sched = sched.clone();
        let task_poller = poller.clone();
        let count = finished.clone();
        sched
            .co_start_named(&format!("task{}", i), move || {
                task_sched.sleep(Duration::from_millis(i)).unwrap();
                let driver_sched = task_sched.clone();
                task_sched
                    .co_start(move || {
                        driver_sched.sleep(Duration::from_millis(2)).unwrap();
                        task_poller.post(token, EventSet::RECV);
                    })
                    .unwrap();
                let got = task_sched.poller_wait(&obj, EventSet::RECV, None).unwrap();
                assert_eq!(got, EventSet::RECV);
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    sched.runloop().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 10);
    assert_eq!(sched.co_count(), 0);
}
