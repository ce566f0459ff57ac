//! Thin periodic-timer handle over a reactor delay task.
//!
//! Ported from `Timer`: `start` installs a delay task whose callback
//! upgrades a weak reference to the timer, invokes the user's callback,
//! and returns the same interval to keep firing -- or `0` to stop if the
//! timer has already been dropped. `stop`/`Drop` cancel the underlying
//! delay task.
use std::sync::{Arc, Mutex};

use crate::core::reactor::ReactorHandle;
use crate::core::task::DelayTaskHandle;

struct Inner {
    callback: Box<dyn FnMut() -> bool + Send>,
}

/// A periodic timer. `on_tick` is called on the owning reactor's thread
/// every `interval`; returning `false` from it stops the timer (equivalent
/// to calling [`Timer::stop`]).
pub struct Timer {
    inner: Arc<Mutex<Inner>>,
    handle: Mutex<Option<DelayTaskHandle>>,
    reactor: ReactorHandle,
}

impl Timer {
    pub fn new<F>(reactor: ReactorHandle, on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Timer {
            inner: Arc::new(Mutex::new(Inner {
                callback: Box::new(on_tick),
            })),
            handle: Mutex::new(None),
            reactor,
        }
    }

    /// Starts the timer with the given interval in milliseconds. A no-op if
    /// the timer is already running; call `stop` first to change the
    /// interval.
    pub fn start(&self, interval_ms: u64) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let task_handle = self.reactor.add_delay_task(interval_ms, move || {
            let keep_going = (inner.lock().unwrap().callback)();
            if keep_going {
                interval_ms
            } else {
                0
            }
        });
        *handle = Some(task_handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.cancel();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
