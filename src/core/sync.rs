//! Blocking primitives backing the worker pool and `sync`/`sync_first`
//! synchronous task submission.
//!
//! Ported from `util::Semphore` and the gate `TaskExecutor::sync`/
//! `sync_first` build on top of a semaphore-like wait: a caller posts a
//! task asynchronously, then blocks on a one-shot gate that the task signals
//! when it finishes -- even if the task panics, so a synchronous submission
//! can never hang forever because the posted work failed.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

/// Counting semaphore; `wait()` blocks while the count is zero, `post(n)`
/// increments it and wakes waiters.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn post(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }
}

/// A one-shot gate used to implement `sync`/`sync_first`: the submitting
/// thread creates a gate, posts a task that calls `signal()` around the
/// real work, and blocks in `wait()` until that happens.
#[derive(Clone)]
pub struct OnceGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl OnceGate {
    pub fn new() -> Self {
        OnceGate {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        *done = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }
}

impl Default for OnceGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f`, catching a panic so the gate is guaranteed to fire, then
/// re-propagates nothing -- a panicking synchronous task is logged and
/// swallowed, matching the "task exception: logged, swallowed" error kind.
pub fn run_and_signal<F: FnOnce() + Send>(gate: &OnceGate, f: F) {
    let result = catch_unwind(AssertUnwindSafe(f));
    gate.signal();
    if let Err(payload) = result {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(panic = %msg, "synchronous task panicked; gate signalled anyway");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn semaphore_blocks_then_unblocks() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait();
        });
        thread::sleep(Duration::from_millis(20));
        sem.post(1);
        handle.join().unwrap();
    }

    #[test]
    fn gate_fires_even_on_panic() {
        let gate = OnceGate::new();
        run_and_signal(&gate, || panic!("boom"));
        gate.wait();
    }

    #[test]
    fn gate_fires_on_success() {
        let gate = OnceGate::new();
        run_and_signal(&gate, || {});
        gate.wait();
    }
}
