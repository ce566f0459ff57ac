//! CPU load estimation over a sliding window of sleep/wake transitions.
//!
//! Ported from `ThreadLoadCounter`: every transition between "sleeping in
//! the kernel poll call" and "running tasks" closes an interval and records
//! its length; the window is capped by both a sample count and a maximum
//! elapsed duration, whichever is hit first.
use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

struct Sample {
    sleeping: bool,
    micros: u64,
}

struct Inner {
    samples: VecDeque<Sample>,
    total_micros: u64,
    sleeping: bool,
    last_transition: Instant,
    max_samples: usize,
    max_micros: u64,
}

/// Tracks how busy a single reactor or worker thread has been recently.
///
/// `on_sleep`/`on_wakeup` must only be called from the thread being
/// measured; `load` may be called from any thread.
pub struct LoadCounter {
    inner: Mutex<Inner>,
}

impl LoadCounter {
    pub fn new(max_samples: usize, max_micros: u64) -> Self {
        LoadCounter {
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(max_samples),
                total_micros: 0,
                sleeping: false,
                last_transition: Instant::now(),
                max_samples,
                max_micros,
            }),
        }
    }

    /// Call immediately before blocking in the kernel poll call.
    pub fn on_sleep(&self) {
        self.transition(true);
    }

    /// Call immediately after the kernel poll call returns.
    pub fn on_wakeup(&self) {
        self.transition(false);
    }

    fn transition(&self, entering_sleep: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_transition).as_micros() as u64;
        let was_sleeping = inner.sleeping;
        inner.last_transition = now;
        inner.sleeping = entering_sleep;
        push_sample(&mut inner, was_sleeping, elapsed);
    }

    /// Integer busy percentage over the retained window, `0..=100`.
    ///
    /// The currently-open interval (since the last transition) is counted
    /// against whichever state the counter is presently in, so `load()`
    /// reflects "right now" even between transitions.
    pub fn load(&self) -> u32 {
        let inner = self.inner.lock();
        let open_micros = inner.last_transition.elapsed().as_micros() as u64;
        let total = inner.total_micros + open_micros;
        if total == 0 {
            return 0;
        }
        let mut busy = open_micros_if_busy(inner.sleeping, open_micros);
        for s in &inner.samples {
            if !s.sleeping {
                busy += s.micros;
            }
        }
        ((busy as u128 * 100) / total as u128) as u32
    }
}

fn open_micros_if_busy(sleeping: bool, micros: u64) -> u64 {
    if sleeping {
        0
    } else {
        micros
    }
}

fn push_sample(inner: &mut Inner, sleeping: bool, micros: u64) {
    inner.samples.push_back(Sample { sleeping, micros });
    inner.total_micros += micros;
    while inner.samples.len() > inner.max_samples
        || inner.total_micros > inner.max_micros
    {
        match inner.samples.pop_front() {
            Some(s) => inner.total_micros = inner.total_micros.saturating_sub(s.micros),
            None => break,
        }
    }
}

impl Default for LoadCounter {
    fn default() -> Self {
        LoadCounter::new(32, 2_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn idle_counter_reports_zero() {
        let lc = LoadCounter::default();
        lc.on_sleep();
        assert_eq!(lc.load(), 0);
    }

    #[test]
    fn busy_counter_reports_nonzero() {
        let lc = LoadCounter::default();
        lc.on_wakeup();
        sleep(Duration::from_millis(5));
        assert!(lc.load() > 0);
    }

    #[test]
    fn window_is_bounded_by_sample_count() {
        let lc = LoadCounter::new(4, 2_000_000);
        for _ in 0..20 {
            lc.on_wakeup();
            lc.on_sleep();
        }
        assert!(lc.inner.lock().samples.len() <= 4);
    }
}
