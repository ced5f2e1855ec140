//! Background work offloaded from fibers: blocking calls that must not
//! run on a scheduler thread (DNS resolution, and anything else a caller
//! wraps as a [`Task`]).
//!
//! Grounded on `original_source/poseidon/static/task_executor.cpp`: a
//! single mutex-guarded pair of FIFO queues (front/back), woken by a
//! condvar. Unlike [`crate::timer::TimerScheduler`]'s weak timers, the
//! queues hold a strong `Arc<dyn Task>`: once `launch` returns, the pool
//! itself keeps the task alive until `execute`+`finalize` complete,
//! regardless of whether the caller keeps its [`TaskHandle`].

pub mod dns;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A unit of background work. `finalize` always runs after `execute`,
/// even if `execute` panics (matching `POSEIDON_CATCH_EVERYTHING` around
/// both calls in the original source).
pub trait Task: Send + Sync {
    fn execute(&self);
    fn finalize(&self) {}
}

/// An opaque handle to a queued task. The pool holds its own strong
/// reference from enqueue until the task finishes, so dropping every
/// clone of this handle does not cancel anything; it exists only so
/// callers have something to hold (and, in the future, could use to
/// poll completion).
#[derive(Clone)]
pub struct TaskHandle {
    #[allow(dead_code)]
    inner: Arc<dyn Task>,
}

struct Shared {
    front: Mutex<VecDeque<Arc<dyn Task>>>,
    back: Mutex<VecDeque<Arc<dyn Task>>>,
    avail: Condvar,
}

/// A pool of worker threads draining one shared task queue.
///
/// Like [`crate::fiber::FiberScheduler`] and
/// [`crate::timer::TimerScheduler`], the queue itself is thread-safe and
/// cheap to clone; callers drive worker threads with
/// [`TaskPool::thread_loop`] or [`TaskPool::spawn_workers`].
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<Shared>,
}

impl TaskPool {
    pub fn new() -> TaskPool {
        TaskPool {
            shared: Arc::new(Shared {
                front: Mutex::new(VecDeque::new()),
                back: Mutex::new(VecDeque::new()),
                avail: Condvar::new(),
            }),
        }
    }

    /// Enqueues `task`. The pool holds a strong reference from this call
    /// until `execute`+`finalize` complete; the returned handle is not
    /// required to keep the task alive.
    pub fn launch(&self, task: impl Task + 'static) -> TaskHandle {
        let task: Arc<dyn Task> = Arc::new(task);
        self.shared.back.lock().unwrap().push_back(task.clone());
        self.shared.avail.notify_one();
        TaskHandle { inner: task }
    }

    /// Pops and runs one task, blocking until one is available. Mirrors
    /// `Task_Executor::thread_loop`'s front/back swap-when-empty trick so
    /// enqueue stays O(1) and amortized-FIFO ordering holds.
    pub fn thread_loop(&self) {
        let mut front = self.shared.front.lock().unwrap();
        loop {
            if !front.is_empty() {
                break;
            }
            let mut back = self.shared.back.lock().unwrap();
            if !back.is_empty() {
                std::mem::swap(&mut *front, &mut *back);
                break;
            }
            drop(back);
            front = self.shared.avail.wait(front).unwrap();
        }

        let task = front.pop_front().unwrap();
        drop(front);

        struct FinalizeOnDrop<'a>(&'a dyn Task);
        impl Drop for FinalizeOnDrop<'_> {
            fn drop(&mut self) {
                self.0.finalize();
            }
        }
        let _finalize = FinalizeOnDrop(&*task);
        task.execute();
    }

    /// Runs [`thread_loop`](Self::thread_loop) until `shutdown` returns
    /// true.
    pub fn run_forever(&self, mut shutdown: impl FnMut() -> bool) {
        while !shutdown() {
            self.thread_loop();
        }
    }

    /// Spawns `n` OS threads, each running [`run_forever`](Self::run_forever)
    /// against the same `shutdown` predicate.
    pub fn spawn_workers(
        &self,
        n: usize,
        shutdown: impl Fn() -> bool + Send + Sync + Clone + 'static,
    ) -> Vec<std::thread::JoinHandle<()>> {
        (0..n)
            .map(|i| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                std::thread::Builder::new()
                    .name(format!("poseidon-task-{i}"))
                    .spawn(move || pool.run_forever(|| shutdown()))
                    .expect("failed to spawn task pool worker")
            })
            .collect()
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}
