//! Stack-switching primitive.
//!
//! A `ucontext_t`-based mechanism per spec §9 "Coroutines via stack
//! switching": `makecontext`/`swapcontext` give us a setjmp/longjmp-style
//! primitive without an extra crate dependency, matching
//! `original_source/poseidon/static/fiber_scheduler.cpp`'s own approach one
//! to one (down to `uc_link` resuming the scheduler context automatically
//! when a fiber function returns normally).

use std::mem::MaybeUninit;

use super::stack::Stack;

/// One side of a switchable pair of execution contexts.
pub struct Context {
    ucontext: libc::ucontext_t,
}

// SAFETY: a Context is only ever touched by the single OS thread that owns
// its scheduler; it is moved into place, never shared, across fiber
// launch/resume/terminate.
unsafe impl Send for Context {}

thread_local! {
    /// The entry point for the context currently being started via
    /// `makecontext`. `makecontext` only portably accepts `int` arguments,
    /// so the closure is smuggled through thread-local storage instead:
    /// the scheduler thread sets this immediately before the first
    /// `swapcontext` into a freshly made context, and the trampoline reads
    /// it back before any other fiber on this thread could have overwritten it.
    static PENDING_ENTRY: std::cell::Cell<*mut Box<dyn FnMut()>> =
        std::cell::Cell::new(std::ptr::null_mut());
}

extern "C" fn trampoline() {
    let raw = PENDING_ENTRY.with(|cell| cell.replace(std::ptr::null_mut()));
    debug_assert!(!raw.is_null(), "trampoline invoked with no pending entry");
    // SAFETY: `raw` was produced by `Box::into_raw` in `Context::new` and
    // is read back exactly once, from the same thread, before any other
    // fiber starts on it.
    let mut entry = unsafe { Box::from_raw(raw) };
    entry();
    // Returning here resumes `uc_link` (the scheduler's outer context).
}

impl Context {
    /// An empty context, suitable only as the "current" side of a
    /// `swap()` (e.g. the scheduler thread's own outer context) or as a
    /// `uc_link` target.
    pub fn empty() -> Context {
        // SAFETY: zeroed ucontext_t is never dereferenced by us directly;
        // getcontext() below fills it in before first use as a `from` side.
        let mut ucontext: libc::ucontext_t = unsafe { MaybeUninit::zeroed().assume_init() };
        // SAFETY: ucontext is valid storage for getcontext's out-pointer.
        unsafe {
            libc::getcontext(&mut ucontext);
        }
        Context { ucontext }
    }

    /// Builds a context that, when first switched into, calls `entry()`
    /// on `stack`, then resumes `link` when `entry` returns normally.
    pub fn new(stack: &Stack, link: &mut Context, entry: impl FnMut() + 'static) -> Context {
        let mut ucontext: libc::ucontext_t = unsafe { MaybeUninit::zeroed().assume_init() };
        // SAFETY: ucontext is freshly allocated local storage.
        unsafe {
            libc::getcontext(&mut ucontext);
        }
        let (sp, size) = stack.region();
        ucontext.uc_stack.ss_sp = sp;
        ucontext.uc_stack.ss_size = size;
        ucontext.uc_stack.ss_flags = 0;
        ucontext.uc_link = &mut link.ucontext;

        // SAFETY: trampoline takes no arguments, matching the `0` below;
        // ucontext's stack fields were just set to a valid mapped region.
        unsafe {
            libc::makecontext(&mut ucontext, trampoline_fn(), 0);
        }

        let boxed: Box<Box<dyn FnMut()>> = Box::new(Box::new(entry));
        PENDING_ENTRY.with(|cell| cell.set(Box::into_raw(boxed)));

        Context { ucontext }
    }

    /// Switches from `self` into `to`. Returns once some later call
    /// switches back into `self`.
    pub fn switch_to(&mut self, to: &mut Context) {
        // SAFETY: both ucontext_t values are valid (either from
        // `getcontext` or `makecontext`); swapcontext saves the current
        // machine state into `self` and restores it from `to`.
        unsafe {
            libc::swapcontext(&mut self.ucontext, &to.ucontext);
        }
    }

    /// A raw pointer to the underlying `ucontext_t`, for code running
    /// *inside* a fiber (on its own stack, with no safe `&mut Context` of
    /// its own) that needs to switch back out. See [`swap_raw`].
    pub fn as_raw_mut(&mut self) -> *mut libc::ucontext_t {
        &mut self.ucontext
    }
}

/// Switches from the context at `from` into the context at `to`.
///
/// # Safety
/// Both pointers must reference live `ucontext_t` values produced by this
/// module, and must not be aliased by any other in-flight switch.
pub unsafe fn swap_raw(from: *mut libc::ucontext_t, to: *mut libc::ucontext_t) {
    libc::swapcontext(from, to);
}

fn trampoline_fn() -> extern "C" fn() {
    trampoline
}
