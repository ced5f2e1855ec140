//! Periodic and one-shot timers.
//!
//! A single mutex-guarded min-heap, woken by a condvar, exactly as
//! `original_source/poseidon/static/timer_scheduler.cpp`'s `thread_loop`
//! does it. Timers are held weakly: if every [`TimerHandle`] for a timer
//! is dropped, the next pop simply discards the entry instead of firing it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::time::{SteadyTime, MAX_TIMER_DURATION};

/// The callback invoked on each tick, receiving the time point it was
/// scheduled for (not necessarily "now", under scheduler load).
pub trait Callback: Send {
    fn on_tick(&self, scheduled_for: SteadyTime);
}

impl<F: Fn(SteadyTime) + Send> Callback for F {
    fn on_tick(&self, scheduled_for: SteadyTime) {
        self(scheduled_for)
    }
}

struct TimerState {
    callback: Box<dyn Callback>,
}

/// A strong handle to a registered timer. Dropping every clone of this
/// handle cancels the timer (the scheduler discards it lazily on its next
/// due pop, same as the original's `wtimer.lock()` failing).
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerState>,
}

struct QueuedTimer {
    timer: Weak<TimerState>,
    next: SteadyTime,
    period: Duration,
}

/// Ordered so a max-heap of `Reverse(next)` behaves as a min-heap on
/// `next`, matching `Timer_Comparator`'s `operator>`.
struct HeapKey(Reverse<SteadyTime>);

struct Entry {
    key: HeapKey,
    timer: QueuedTimer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key.0 == other.key.0
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.0.cmp(&other.key.0)
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    avail: Condvar,
}

/// Runs timers on whichever thread calls [`TimerScheduler::thread_loop`].
///
/// Cloning a `TimerScheduler` gives another handle to the same queue, so
/// [`insert_weak`](Self::insert_weak) can be called from any thread while
/// one dedicated thread drives `thread_loop`.
#[derive(Clone)]
pub struct TimerScheduler {
    shared: Arc<Shared>,
}

impl TimerScheduler {
    pub fn new() -> TimerScheduler {
        TimerScheduler {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                avail: Condvar::new(),
            }),
        }
    }

    /// Registers `callback` to fire after `delay`, then every `period`
    /// thereafter (or once, if `period` is zero). Returns a handle that
    /// keeps the timer alive; the scheduler itself only holds a weak
    /// reference, so a dropped handle stops future firings.
    pub fn insert_weak(
        &self,
        delay: Duration,
        period: Duration,
        callback: impl Callback + 'static,
    ) -> Result<TimerHandle> {
        if delay > MAX_TIMER_DURATION {
            return Err(Error::Config(format!("timer delay out of range: {delay:?}")));
        }
        if period > MAX_TIMER_DURATION {
            return Err(Error::Config(format!("timer period out of range: {period:?}")));
        }

        let state = Arc::new(TimerState {
            callback: Box::new(callback),
        });
        let next = SteadyTime::now() + delay;
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(Entry {
            key: HeapKey(Reverse(next)),
            timer: QueuedTimer {
                timer: Arc::downgrade(&state),
                next,
                period,
            },
        });
        self.shared.avail.notify_one();
        Ok(TimerHandle { inner: state })
    }

    /// Runs one scheduler iteration: blocks until a timer is registered,
    /// waits for the earliest one to come due, then fires it. Exceptions
    /// thrown by user code are not part of Rust's model; panics propagate,
    /// matching `POSEIDON_CATCH_EVERYTHING`'s "log and move on" intent only
    /// insofar as the caller is expected to run this inside a
    /// `catch_unwind` boundary (see `process::run_supervised`).
    pub fn thread_loop(&self) {
        let mut heap = self.shared.heap.lock().unwrap();
        while heap.is_empty() {
            heap = self.shared.avail.wait(heap).unwrap();
        }

        let now = SteadyTime::now();
        let due = heap.peek().unwrap().timer.next;
        if now < due {
            let (guard, _timeout) = self
                .shared
                .avail
                .wait_timeout(heap, due - now)
                .unwrap();
            drop(guard);
            return;
        }

        let mut entry = heap.pop().unwrap();
        let scheduled_for = entry.timer.next;
        let timer = match entry.timer.timer.upgrade() {
            Some(t) => t,
            None => return,
        };

        if !entry.timer.period.is_zero() {
            entry.timer.next = entry.timer.next + entry.timer.period;
            entry.key = HeapKey(Reverse(entry.timer.next));
            heap.push(entry);
        }
        drop(heap);

        timer.callback.on_tick(scheduled_for);
    }

    /// Runs [`thread_loop`](Self::thread_loop) until `shutdown` returns
    /// true.
    pub fn run_forever(&self, mut shutdown: impl FnMut() -> bool) {
        while !shutdown() {
            self.thread_loop();
        }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn one_shot_timer_fires_once() {
        let scheduler = TimerScheduler::new();
        let (tx, rx) = mpsc::channel();
        let _handle = scheduler
            .insert_weak(Duration::from_millis(5), Duration::ZERO, move |_| {
                tx.send(()).unwrap();
            })
            .unwrap();

        let worker = scheduler.clone();
        std::thread::spawn(move || loop {
            worker.thread_loop();
        });

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn periodic_timer_fires_repeatedly() {
        let scheduler = TimerScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let _handle = scheduler
            .insert_weak(Duration::from_millis(2), Duration::from_millis(2), move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let worker = scheduler.clone();
        std::thread::spawn(move || loop {
            worker.thread_loop();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn dropped_handle_cancels_timer() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = scheduler
            .insert_weak(Duration::from_millis(10), Duration::ZERO, move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(handle);

        let worker = scheduler.clone();
        std::thread::spawn(move || loop {
            worker.thread_loop();
        });

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
