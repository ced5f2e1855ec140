//! Cooperative multitasking.
//!
//! With the fiber module you can launch cooperatively-scheduled
//! user-space execution contexts ([`Fiber`]s) onto a [`FiberScheduler`],
//! and suspend the currently running one on [`yield_now`] or
//! [`suspend_on`] a [`Future`](future::Future). Suspension points are the
//! *only* place a fiber may give up the scheduler thread; reactor and
//! timer callbacks never suspend (spec §5).
//!
//! Grounded on `tarantool::fiber` (states, stack-cache shape) and
//! `original_source/poseidon/static/fiber_scheduler.cpp` (the exact
//! heap-with-lazy-reheapify algorithm, reproduced in [`FiberScheduler::tick`]).

pub mod context;
pub mod future;
pub mod stack;

use std::cell::Cell;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::FiberConfig;
use crate::time::SteadyTime;
use context::Context;
use future::{Future as PFuture, FutureFailure, WakeToken};
use stack::Stack;

/// Minimum backoff applied when the scheduler has nothing due; grows
/// exponentially (roughly `x*9+7` nanoseconds per original source) up to
/// [`MAX_BACKOFF`].
const MAX_BACKOFF: Duration = Duration::from_millis(200);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a fiber for logging and handle equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FiberState {
    Pending,
    Suspended,
    Running,
    Terminated,
}

/// A unit of cooperatively-scheduled work.
///
/// Implemented for any `FnOnce() + Send`, so most callers just pass a
/// closure to [`FiberScheduler::launch`].
pub trait Fiber: Send {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send> Fiber for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Type-erased readiness query for whatever [`Future`](future::Future) a
/// suspended fiber is watching, so the scheduler can poll it without
/// knowing its payload type.
trait AnyFuture: Send {
    fn is_ready(&self) -> bool;
}

impl<T: Clone + Send + 'static> AnyFuture for PFuture<T> {
    fn is_ready(&self) -> bool {
        PFuture::is_ready(self)
    }
}

/// A handle to a launched fiber, usable from any thread.
#[derive(Clone)]
pub struct FiberHandle {
    id: FiberId,
    abandoned: Arc<AtomicBool>,
}

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Marks the fiber abandoned. It is still drained by the scheduler
    /// (cooperation is required, spec §9 open question); user code inside
    /// the fiber is expected to observe [`is_abandoned`] and return
    /// promptly.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }
}

thread_local! {
    static CURRENT: Cell<Option<CurrentFiber>> = Cell::new(None);
}

/// Raw pointers into the scheduler thread's `tick()` stack frame, valid
/// only for the duration a particular fiber is checked out and running.
/// This is how free functions like [`yield_now`] reach back into the
/// `FiberSlot` sitting on the scheduler's native stack without it being
/// passed explicitly through every call in the fiber's call graph --
/// mirroring how `tarantool::fiber`'s free functions implicitly operate
/// on "the currently running fiber".
#[derive(Clone, Copy)]
struct CurrentFiber {
    self_ctx: *mut libc::ucontext_t,
    outer_ctx: *mut libc::ucontext_t,
    abandoned: *const AtomicBool,
    async_time: *const Arc<AtomicU64>,
    wake: *const Arc<(Mutex<()>, Condvar)>,
    watched_future: *mut Option<Box<dyn AnyFuture>>,
}

/// True if the currently running fiber has been [`FiberHandle::abandon`]ed.
///
/// # Panics
/// Panics if called outside a running fiber.
pub fn is_abandoned() -> bool {
    CURRENT.with(|cell| {
        let cur = cell.get().expect("fiber::is_abandoned called outside a fiber");
        // SAFETY: `cur` is only populated while its fiber is checked out
        // and running on this thread.
        unsafe { (*cur.abandoned).load(Ordering::Acquire) }
    })
}

/// Suspends the currently running fiber unconditionally, resuming it on
/// some later scheduler iteration.
///
/// # Panics
/// Panics if called outside a running fiber.
pub fn yield_now() {
    suspend_on::<()>(None);
}

/// Suspends the currently running fiber until `future` becomes ready (or
/// `fail_timeout` forces a resume), attaching a [`WakeToken`] so the
/// resolver can wake the scheduler immediately. Returns `None` if the
/// fiber was forcibly resumed without the future ever becoming ready.
///
/// # Panics
/// Panics if called outside a running fiber.
pub fn suspend_on<T: Clone + Send + 'static>(
    future: Option<PFuture<T>>,
) -> Option<Result<T, FutureFailure>> {
    let cur = CURRENT.with(|cell| cell.get()).expect("fiber::suspend_on called outside a fiber");
    let now = SteadyTime::now();

    // SAFETY: `cur`'s pointers are valid for the duration of this call,
    // per `CurrentFiber`'s contract.
    unsafe {
        (*cur.async_time).store(now.as_nanos(), Ordering::Release);

        if let Some(ref f) = future {
            if f.is_ready() {
                // Already resolved: don't switch away at all.
                return f.try_get();
            }
            let token = WakeToken::new(Arc::downgrade(&*cur.async_time), (*cur.wake).clone());
            f.attach_waiter(token, now);
            *cur.watched_future = Some(Box::new(f.clone()));
        } else {
            *cur.watched_future = None;
        }

        context::swap_raw(cur.self_ctx, cur.outer_ctx);
    }

    future.and_then(|f| f.try_get())
}

struct FiberSlot {
    id: FiberId,
    check_time: SteadyTime,
    yield_time: SteadyTime,
    async_time: Arc<AtomicU64>,
    abandoned: Arc<AtomicBool>,
    state: FiberState,
    stack: Option<Stack>,
    context: Option<Context>,
    watched_future: Option<Box<dyn AnyFuture>>,
    body: Option<Box<dyn Fiber>>,
    /// Flipped by the fiber body itself, from inside the fiber's own stack,
    /// the instant `body.run()` returns -- the only reliable signal that
    /// the switch back to `outer` was the automatic `uc_link` one and not
    /// an explicit yield, since both land at the same Rust-level return
    /// point after `switch_to`.
    finished: Arc<AtomicBool>,
}

/// Min-heap ordering on `check_time`, ties broken by insertion order so
/// `BinaryHeap` (a max-heap) behaves as the spec's min-heap.
struct HeapEntry {
    check_time: SteadyTime,
    seq: u64,
    slot: FiberSlot,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.check_time == other.check_time && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the smallest
        // check_time (and, for ties, the earliest sequence number) on top.
        other
            .check_time
            .cmp(&self.check_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PendingLaunch {
    id: FiberId,
    abandoned: Arc<AtomicBool>,
    body: Box<dyn Fiber>,
}

/// A thread-safe handle used to launch fibers onto a [`FiberScheduler`]
/// running on another thread.
#[derive(Clone)]
pub struct FiberSpawner {
    pending: Arc<Mutex<VecDeque<PendingLaunch>>>,
    wake: Arc<(Mutex<()>, Condvar)>,
}

impl FiberSpawner {
    /// Takes ownership of `body`, enqueues it for launch, and returns a
    /// handle immediately. Thread-safe.
    pub fn launch(&self, body: impl Fiber + 'static) -> FiberHandle {
        let id = FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed));
        let abandoned = Arc::new(AtomicBool::new(false));
        self.pending.lock().unwrap().push_back(PendingLaunch {
            id,
            abandoned: abandoned.clone(),
            body: Box::new(body),
        });
        let (_lock, cvar) = &*self.wake;
        cvar.notify_all();
        FiberHandle { id, abandoned }
    }
}

/// Runs fibers cooperatively on the thread that calls [`FiberScheduler::tick`]
/// / [`FiberScheduler::run_forever`].
pub struct FiberScheduler {
    heap: BinaryHeap<HeapEntry>,
    pending: Arc<Mutex<VecDeque<PendingLaunch>>>,
    wake: Arc<(Mutex<()>, Condvar)>,
    outer: Context,
    next_seq: u64,
    backoff: Duration,
    warn_timeout: Duration,
    fail_timeout: Duration,
    stack_vm_size: usize,
}

const DEFAULT_STACK_VM_SIZE: usize = 256 * 1024;

impl FiberScheduler {
    pub fn new(config: &FiberConfig) -> (FiberScheduler, FiberSpawner) {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let wake = Arc::new((Mutex::new(()), Condvar::new()));
        let scheduler = FiberScheduler {
            heap: BinaryHeap::new(),
            pending: pending.clone(),
            wake: wake.clone(),
            outer: Context::empty(),
            next_seq: 0,
            backoff: Duration::ZERO,
            warn_timeout: config.warn_timeout(),
            fail_timeout: config.fail_timeout(),
            stack_vm_size: config.stack_vm_size.map(|v| v as usize).unwrap_or(DEFAULT_STACK_VM_SIZE),
        };
        (scheduler, FiberSpawner { pending, wake })
    }

    fn drain_pending(&mut self) {
        let mut pending = self.pending.lock().unwrap();
        let now = SteadyTime::now();
        for launch in pending.drain(..) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.heap.push(HeapEntry {
                check_time: now,
                seq,
                slot: FiberSlot {
                    id: launch.id,
                    check_time: now,
                    yield_time: now,
                    async_time: Arc::new(AtomicU64::new(now.as_nanos())),
                    abandoned: launch.abandoned,
                    state: FiberState::Pending,
                    stack: None,
                    context: None,
                    watched_future: None,
                    body: Some(launch.body),
                    finished: Arc::new(AtomicBool::new(false)),
                },
            });
        }
    }

    /// Runs one scheduler iteration. Intended to be called repeatedly by
    /// the scheduler thread until shutdown, per spec §4.1 `thread_loop`.
    pub fn tick(&mut self, shutdown: bool) {
        self.drain_pending();

        if self.heap.is_empty() {
            self.sleep_backoff(MAX_BACKOFF);
            return;
        }

        if !shutdown {
            let now = SteadyTime::now();
            if self.heap.peek().unwrap().check_time > now {
                self.reheapify_if_stale();
                let wait = match self.heap.peek() {
                    Some(e) if e.check_time > now => e.check_time - now,
                    _ => Duration::ZERO,
                };
                if !wait.is_zero() {
                    self.sleep_backoff(wait.min(MAX_BACKOFF));
                    return;
                }
            }
        }
        self.backoff = Duration::ZERO;

        let mut entry = self.heap.pop().unwrap();

        if entry.slot.state == FiberState::Terminated {
            // Stack already released in the branch below that observed
            // termination; nothing further to do.
            return;
        }

        let now = SteadyTime::now();
        let next_check = (entry.slot.check_time + self.warn_timeout)
            .min(entry.slot.yield_time + self.fail_timeout);
        entry.slot.async_time.compare_exchange(
            entry.slot.check_time.as_nanos(),
            next_check.as_nanos(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ).ok();
        entry.slot.check_time = next_check;

        let should_warn = now >= entry.slot.yield_time + self.warn_timeout;
        let should_fail = now >= entry.slot.yield_time + self.fail_timeout;

        if let Some(watched) = entry.slot.watched_future.as_deref() {
            if should_warn && !should_fail {
                log::warn!(
                    "fiber {:?} has been suspended for {:?}",
                    entry.slot.id,
                    now - entry.slot.yield_time
                );
            }
            if should_fail {
                log::error!(
                    "fiber {:?} has been suspended for {:?}; this looks like a deadlock",
                    entry.slot.id,
                    now - entry.slot.yield_time
                );
            }
            if !shutdown && !should_fail && !watched.is_ready() {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.heap.push(HeapEntry {
                    check_time: entry.slot.check_time,
                    seq,
                    slot: entry.slot,
                });
                return;
            }
        }

        if entry.slot.state == FiberState::Pending {
            let stack = match Stack::acquire(self.stack_vm_size) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("failed to allocate stack for fiber {:?}: {e}", entry.slot.id);
                    // Drop the fiber without ever running it.
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    entry.slot.state = FiberState::Terminated;
                    self.heap.push(HeapEntry {
                        check_time: entry.slot.check_time,
                        seq,
                        slot: entry.slot,
                    });
                    return;
                }
            };
            let mut body = Some(entry.slot.body.take().expect("pending fiber has no body"));
            let finished = entry.slot.finished.clone();

            let context = Context::new(&stack, &mut self.outer, move || {
                if let Some(b) = body.take() {
                    b.run();
                }
                // Runs on the fiber's own stack, just before control falls
                // off the end of the trampoline and `uc_link` switches back
                // to the scheduler -- the only point from which we can tell
                // apart "body finished" from "body yielded".
                finished.store(true, Ordering::Release);
            });
            entry.slot.context = Some(context);
            entry.slot.stack = Some(stack);
        }

        entry.slot.state = FiberState::Running;

        // SAFETY: self_ctx will be filled in via `as_raw_mut` just below,
        // immediately before the actual switch; no other fiber is created
        // or switched to on this thread in between.
        let self_ctx = entry
            .slot
            .context
            .as_mut()
            .expect("fiber must have a context before resuming")
            .as_raw_mut();
        CURRENT.with(|c| {
            c.set(Some(CurrentFiber {
                self_ctx,
                outer_ctx: self.outer.as_raw_mut(),
                abandoned: &*entry.slot.abandoned,
                async_time: &entry.slot.async_time,
                wake: &self.wake,
                watched_future: &mut entry.slot.watched_future,
            }))
        });

        self.outer.switch_to(entry.slot.context.as_mut().unwrap());

        CURRENT.with(|c| c.set(None));

        let terminated = entry.slot.finished.load(Ordering::Acquire);

        if terminated {
            if let Some(stack) = entry.slot.stack.take() {
                stack.release();
            }
            // Entry is simply dropped: spec step 4 "If E.state ==
            // terminated, free its stack ... and drop it."
        } else {
            entry.slot.state = FiberState::Suspended;
            let seq = self.next_seq;
            self.next_seq += 1;
            self.heap.push(HeapEntry {
                check_time: entry.slot.check_time,
                seq,
                slot: entry.slot,
            });
        }
    }

    /// Runs [`tick`](Self::tick) until `shutdown` returns true and the
    /// heap has drained.
    pub fn run_forever(&mut self, mut shutdown: impl FnMut() -> bool) {
        loop {
            let should_shutdown = shutdown();
            self.tick(should_shutdown);
            if should_shutdown && self.heap.is_empty() {
                return;
            }
        }
    }

    /// Rebuilds the heap if any entry's cached `check_time` no longer
    /// matches its live `async_time` (set by a `WakeToken::pulse` from a
    /// concurrently-resolved future). `BinaryHeap` has no decrease-key
    /// operation, so like the original source we just drain and rebuild.
    fn reheapify_if_stale(&mut self) {
        let mut changed = false;
        let mut entries: Vec<HeapEntry> = std::mem::take(&mut self.heap).into_vec();
        for entry in entries.iter_mut() {
            let async_time = SteadyTime::from_nanos(entry.slot.async_time.load(Ordering::Acquire));
            if async_time != entry.check_time {
                entry.check_time = async_time;
                entry.slot.check_time = async_time;
                changed = true;
            }
        }
        let _ = changed;
        self.heap = BinaryHeap::from(entries);
    }

    fn sleep_backoff(&mut self, cap: Duration) {
        let next = (self.backoff.as_nanos() as u64 * 9 + 7).min(cap.as_nanos() as u64);
        self.backoff = Duration::from_nanos(next).min(MAX_BACKOFF);
        if self.backoff.is_zero() {
            return;
        }
        let (lock, cvar) = &*self.wake;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, self.backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FiberConfig;
    use std::sync::mpsc;

    fn test_scheduler() -> (FiberScheduler, FiberSpawner) {
        let mut config = FiberConfig::default();
        config.stack_vm_size = Some(256 * 1024);
        FiberScheduler::new(&config)
    }

    #[test]
    fn launched_fiber_runs_to_completion() {
        let (mut sched, spawner) = test_scheduler();
        let (tx, rx) = mpsc::channel();
        spawner.launch(move || {
            tx.send(42).unwrap();
        });

        for _ in 0..100 {
            sched.tick(false);
            if let Ok(v) = rx.try_recv() {
                assert_eq!(v, 42);
                return;
            }
        }
        panic!("fiber never ran");
    }

    #[test]
    fn yield_now_resumes_on_a_later_tick() {
        let (mut sched, spawner) = test_scheduler();
        let (tx, rx) = mpsc::channel();
        spawner.launch(move || {
            tx.send("before").unwrap();
            yield_now();
            tx.send("after").unwrap();
        });

        let mut seen = Vec::new();
        for _ in 0..200 {
            sched.tick(false);
            while let Ok(v) = rx.try_recv() {
                seen.push(v);
            }
            if seen.len() == 2 {
                break;
            }
        }
        assert_eq!(seen, vec!["before", "after"]);
    }

    #[test]
    fn future_resolved_concurrently_wakes_fiber() {
        let (mut sched, spawner) = test_scheduler();
        let (future, resolver) = future::channel::<i32>();
        let (tx, rx) = mpsc::channel();

        spawner.launch(move || {
            let result = suspend_on(Some(future));
            tx.send(result.unwrap().unwrap()).unwrap();
        });

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.resolve_success(7, SteadyTime::now());
        });

        let mut got = None;
        for _ in 0..500 {
            sched.tick(false);
            if let Ok(v) = rx.try_recv() {
                got = Some(v);
                break;
            }
        }
        assert_eq!(got, Some(7));
    }
}
