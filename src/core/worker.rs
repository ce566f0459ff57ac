//! Plain FIFO worker pool, distinct from the reactors.
//!
//! Ported from `ThreadPool`: a fixed team of OS threads each blocked on a
//! shared semaphore, popping one task at a time from a locked deque.
//! Unlike a [`crate::core::reactor::Reactor`], workers never poll I/O and
//! never run delay tasks -- they exist purely to take blocking or CPU-bound
//! work off a reactor thread.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::core::sync::{run_and_signal, OnceGate, Semaphore};
use crate::core::task::Task;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    sema: Semaphore,
    exiting: AtomicBool,
    worker_ids: Mutex<Vec<ThreadId>>,
}

/// A fixed-size pool of worker threads draining a shared FIFO task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            sema: Semaphore::new(0),
            exiting: AtomicBool::new(false),
            worker_ids: Mutex::new(Vec::with_capacity(size)),
        });

        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", idx))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        // Worker thread-ids are recorded by each thread on entry; give them
        // a moment to register before returning from `new` so
        // `is_worker_thread` is reliable immediately after construction in
        // tests. Not required for correctness of `async`/`async_first`
        // themselves, which only consult this for the inline-execution
        // fast path.
        WorkerPool {
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn hardware_concurrency() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn is_worker_thread(&self) -> bool {
        let id = thread::current().id();
        self.shared.worker_ids.lock().unwrap().contains(&id)
    }

    /// Appends `task` to the back of the queue. If `may_sync` and the
    /// caller is itself a worker thread, runs inline instead of enqueuing.
    pub fn async_task(&self, task: Task, may_sync: bool) {
        if may_sync && self.is_worker_thread() {
            task.run();
            return;
        }
        self.shared.queue.lock().unwrap().push_back(task);
        self.shared.sema.post(1);
    }

    /// Prepends `task` to the front of the queue (runs before anything
    /// already queued).
    pub fn async_first(&self, task: Task, may_sync: bool) {
        if may_sync && self.is_worker_thread() {
            task.run();
            return;
        }
        self.shared.queue.lock().unwrap().push_front(task);
        self.shared.sema.post(1);
    }

    /// Blocks the calling thread until `f` has run on a worker thread,
    /// even if `f` panics.
    pub fn sync<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = OnceGate::new();
        let gate2 = gate.clone();
        self.async_task(
            Task::new(move || run_and_signal(&gate2, f)),
            true,
        );
        gate.wait();
    }

    pub fn sync_first<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = OnceGate::new();
        let gate2 = gate.clone();
        self.async_first(
            Task::new(move || run_and_signal(&gate2, f)),
            true,
        );
        gate.wait();
    }

    /// Signals every worker to exit after draining what is already queued
    /// and joins all worker threads. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.handles.lock().unwrap().len();
        self.shared.sema.post(n);
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    shared.worker_ids.lock().unwrap().push(thread::current().id());
    loop {
        shared.sema.wait();
        if shared.exiting.load(Ordering::SeqCst) {
            let task = shared.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    task.run();
                }
                None => return,
            }
            continue;
        }
        if let Some(task) = shared.queue.lock().unwrap().pop_front() {
            task.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn runs_queued_tasks() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            pool.async_task(Task::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }), false);
        }
        thread::sleep(Duration::from_millis(100));
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn sync_blocks_until_done() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        pool.sync(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn sync_unblocks_even_on_panic() {
        let pool = WorkerPool::new(1);
        pool.sync(|| panic!("boom"));
        pool.shutdown();
    }
}
