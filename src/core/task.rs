//! Cancellable work items.
//!
//! Ported from `TaskCancelableImpl`: the handle given to the poster owns a
//! strong slot; the copy kept in the runtime queue only ever holds a weak
//! reference captured at construction. `cancel()` clears the strong slot
//! under a lock so it can never race with an in-flight `run()` that has
//! already upgraded its weak reference -- once `cancel()` returns, no
//! future `run()` call can succeed, though one that is already executing is
//! allowed to finish.
use std::sync::{Arc, Mutex, Weak};

type BoxedOnce = Box<dyn FnOnce() + Send + 'static>;
type BoxedRepeat = Box<dyn FnMut() -> u64 + Send + 'static>;

/// A one-shot unit of work posted to a reactor or worker pool.
///
/// Cloning a `Task` shares the same cancellation state; whichever clone
/// calls `cancel()` first wins, and every clone observes the cancellation.
#[derive(Clone)]
pub struct Task {
    strong: Arc<Mutex<Option<Arc<Mutex<Option<BoxedOnce>>>>>>,
    weak: Weak<Mutex<Option<BoxedOnce>>>,
}

/// Handle returned to the poster of a [`Task`]; dropping it does not
/// cancel the task, matching `async`'s fire-and-forget contract. Use
/// [`TaskHandle::cancel`] explicitly.
pub type TaskHandle = Task;

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cell: Arc<Mutex<Option<BoxedOnce>>> = Arc::new(Mutex::new(Some(Box::new(f))));
        let weak = Arc::downgrade(&cell);
        Task {
            strong: Arc::new(Mutex::new(Some(cell))),
            weak,
        }
    }

    /// Prevents this task from ever running. Idempotent; race-free with a
    /// concurrent `run()` on another clone (the strong slot is taken under
    /// a lock, and `run()` only ever observes the state through the weak
    /// reference).
    pub fn cancel(&self) {
        self.strong.lock().unwrap().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.strong.lock().unwrap().is_none()
    }

    /// Runs the task if it has not been cancelled. Returns `true` if the
    /// callable actually ran.
    pub fn run(self) -> bool {
        match self.weak.upgrade() {
            Some(cell) => match cell.lock().unwrap().take() {
                Some(f) => {
                    f();
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

/// A repeatable delay task: its callable returns the next delay in
/// milliseconds (`0` to stop). Modeled separately from [`Task`] rather than
/// unifying `FnOnce` and repeatable `FnMut` behind one generic abstraction
/// -- the two have different cancellation/return shapes and forcing them
/// into one type would cost more in indirection than it saves in code.
#[derive(Clone)]
pub struct DelayTask {
    strong: Arc<Mutex<Option<Arc<Mutex<BoxedRepeat>>>>>,
    weak: Weak<Mutex<BoxedRepeat>>,
}

pub type DelayTaskHandle = DelayTask;

impl DelayTask {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> u64 + Send + 'static,
    {
        let cell: Arc<Mutex<BoxedRepeat>> = Arc::new(Mutex::new(Box::new(f)));
        let weak = Arc::downgrade(&cell);
        DelayTask {
            strong: Arc::new(Mutex::new(Some(cell))),
            weak,
        }
    }

    pub fn cancel(&self) {
        self.strong.lock().unwrap().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.strong.lock().unwrap().is_none()
    }

    /// Fires the delay task once. Returns `Some(next_delay_ms)` if it ran
    /// and should be rescheduled with a positive delay, or `None` if it was
    /// cancelled, upgrade failed, or it returned `0` (stop).
    pub fn fire(&self) -> Option<u64> {
        let cell = self.weak.upgrade()?;
        let next = (cell.lock().unwrap())();
        if next == 0 {
            None
        } else {
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn cancel_before_run_suppresses_execution() {
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let task = Task::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        let handle = task.clone();
        handle.cancel();
        assert!(!task.run());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn uncancelled_task_runs_once() {
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let task = Task::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.run());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_task_reschedules_until_zero() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let dt = DelayTask::new(move || {
            let n = count2.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                1000
            } else {
                0
            }
        });
        assert_eq!(dt.fire(), Some(1000));
        assert_eq!(dt.fire(), Some(1000));
        assert_eq!(dt.fire(), None);
    }

    #[test]
    fn cancelled_delay_task_never_fires_again() {
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let dt = DelayTask::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
            1000
        });
        let handle = dt.clone();
        dt.fire();
        handle.cancel();
        assert_eq!(dt.fire(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
