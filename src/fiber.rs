//! Thread-backed stackful coroutines.
//!
//! Each fiber owns an OS thread, but control is handed over with rendezvous
//! channels so that exactly one side (the resumer or the fiber body) runs
//! at any moment. That preserves the cooperative single-runner contract: no
//! two task bodies ever execute in parallel, and control only transfers at
//! explicit suspension points.
//!
//! The primitive is deliberately small: [`Fiber::spawn`] creates a parked
//! fiber, [`Fiber::resume`] hands it a [`ResumeValue`] and blocks until it
//! yields back, and [`suspend`] is the fiber-side inverse.

use crate::error::SchedError;
use crate::events::EventSet;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

/// Value delivered across a suspend/resume edge.
#[derive(Debug, Clone)]
pub enum ResumeValue {
    /// No payload: the initial resume of a fresh fiber, or a sleep wakeup.
    Unit,
    /// Readiness delivered to an I/O wait; the empty set signals a timeout.
    Events(EventSet),
    /// The suspension failed; the suspending primitive returns this error.
    Error(SchedError),
}

/// Lifecycle state of a fiber, as seen by the resuming side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Parked at a suspension point (or not yet started).
    Suspended,
    /// Between a resume and the matching yield.
    Running,
    /// The body returned or panicked.
    Dead,
}

const STATUS_SUSPENDED: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_DEAD: u8 = 2;

/// What a resume observed when control came back.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The fiber suspended again.
    Yielded(ResumeValue),
    /// The body returned.
    Finished,
    /// The body panicked; the payload is rendered as text.
    Panicked(String),
}

enum FiberReport {
    Yielded(ResumeValue),
    Finished,
    Panicked(String),
}

/// Fiber-side channel endpoints, installed in thread-local storage for the
/// lifetime of the body.
struct FiberSide {
    resume_rx: Receiver<ResumeValue>,
    report_tx: Sender<FiberReport>,
}

thread_local! {
    static CURRENT_SIDE: RefCell<Option<FiberSide>> = const { RefCell::new(None) };
}

/// Resumer-side handle to a fiber.
pub struct Fiber {
    resume_tx: Sender<ResumeValue>,
    report_rx: Receiver<FiberReport>,
    status: AtomicU8,
}

impl Fiber {
    /// Spawn a fiber running `body`. The fiber starts parked: `body` does not
    /// execute until the first [`resume`](Self::resume).
    pub fn spawn<F>(label: &str, body: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        // Rendezvous channels: a send completes only when the peer receives,
        // so the two threads hand control back and forth without overlap.
        let (resume_tx, resume_rx) = bounded::<ResumeValue>(0);
        let (report_tx, report_rx) = bounded::<FiberReport>(0);

        let fiber = Arc::new(Fiber {
            resume_tx,
            report_rx,
            status: AtomicU8::new(STATUS_SUSPENDED),
        });

        let builder = thread::Builder::new().name(format!("faber-co-{}", label));
        builder
            .spawn(move || {
                let side = FiberSide {
                    resume_rx: resume_rx.clone(),
                    report_tx: report_tx.clone(),
                };
                CURRENT_SIDE.with(|slot| *slot.borrow_mut() = Some(side));

                // Park until the first resume. A disconnect means the handle
                // was dropped before the fiber ever ran.
                if resume_rx.recv().is_err() {
                    return;
                }

                let result = panic::catch_unwind(AssertUnwindSafe(body));
                CURRENT_SIDE.with(|slot| *slot.borrow_mut() = None);

                let report = match result {
                    Ok(()) => FiberReport::Finished,
                    Err(payload) => FiberReport::Panicked(panic_message(payload)),
                };
                let _ = report_tx.send(report);
            })
            .expect("failed to spawn fiber thread");

        fiber
    }

    /// Current lifecycle state.
    pub fn status(&self) -> FiberStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_SUSPENDED => FiberStatus::Suspended,
            STATUS_RUNNING => FiberStatus::Running,
            _ => FiberStatus::Dead,
        }
    }

    /// Hand `value` to the fiber and block until it yields, returns, or
    /// panics. The caller must hold no locks shared with fiber bodies.
    ///
    /// Calling this on a fiber that is not suspended is a protocol violation;
    /// the scheduler guards for it before calling down.
    pub fn resume(&self, value: ResumeValue) -> ResumeOutcome {
        debug_assert_eq!(self.status(), FiberStatus::Suspended);
        self.status.store(STATUS_RUNNING, Ordering::Release);

        if self.resume_tx.send(value).is_err() {
            // Fiber thread is gone without reporting.
            self.status.store(STATUS_DEAD, Ordering::Release);
            return ResumeOutcome::Panicked("fiber thread terminated".to_string());
        }
        match self.report_rx.recv() {
            Ok(FiberReport::Yielded(value)) => {
                self.status.store(STATUS_SUSPENDED, Ordering::Release);
                ResumeOutcome::Yielded(value)
            }
            Ok(FiberReport::Finished) => {
                self.status.store(STATUS_DEAD, Ordering::Release);
                ResumeOutcome::Finished
            }
            Ok(FiberReport::Panicked(reason)) => {
                self.status.store(STATUS_DEAD, Ordering::Release);
                ResumeOutcome::Panicked(reason)
            }
            Err(_) => {
                self.status.store(STATUS_DEAD, Ordering::Release);
                ResumeOutcome::Panicked("fiber thread terminated".to_string())
            }
        }
    }
}

/// Suspend the calling fiber, yielding `value` to its resumer. Returns the
/// value passed to the next resume.
///
/// Must be called on a fiber thread. If the resumer side has gone away the
/// fiber is orphaned and receives [`SchedError::Stopped`] so its body can
/// unwind.
pub fn suspend(value: ResumeValue) -> Result<ResumeValue, SchedError> {
    CURRENT_SIDE.with(|slot| {
        let side = slot.borrow();
        let Some(side) = side.as_ref() else {
            return Err(SchedError::OutsideCoroutine);
        };
        if side.report_tx.send(FiberReport::Yielded(value)).is_err() {
            return Ok(ResumeValue::Error(SchedError::Stopped));
        }
        match side.resume_rx.recv() {
            Ok(value) => Ok(value),
            Err(_) => Ok(ResumeValue::Error(SchedError::Stopped)),
        }
    })
}

/// Whether the calling thread is a live fiber body.
pub fn on_fiber() -> bool {
    CURRENT_SIDE.with(|slot| slot.borrow().is_some())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
