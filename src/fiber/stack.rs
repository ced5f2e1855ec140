//! Fiber stack allocation and the process-wide free-stack cache.
//!
//! Each stack is mapped separately with `PROT_NONE` guard pages at both
//! ends (spec §5 "Memory"). Freed stacks go back onto a lock-free LIFO so
//! that launching a fiber rarely costs a fresh `mmap`. Grounded on
//! `original_source/poseidon/static/fiber_scheduler.cpp`'s
//! `do_allocate_stack`/`do_free_stack` (`Cached_Stack`), re-expressed with
//! `std::sync::atomic` in place of the original's hand-rolled atomics.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{Error, Result};

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[repr(C)]
struct CachedStackHeader {
    next: AtomicPtr<CachedStackHeader>,
    vm_size: usize,
}

static STACK_CACHE: AtomicPtr<CachedStackHeader> = AtomicPtr::new(ptr::null_mut());

/// An exclusively-owned fiber stack. Dropping it returns the mapping to the
/// cache rather than unmapping it, unless its size no longer matches the
/// configured size (in which case it is unmapped on next allocation).
pub struct Stack {
    map_base: *mut c_void,
    map_size: usize,
    usable: *mut CachedStackHeader,
    vm_size: usize,
}

// SAFETY: a Stack is only ever touched by the fiber scheduler thread; it is
// moved, never shared, across fiber launch/terminate.
unsafe impl Send for Stack {}

impl Stack {
    /// Pointer to the top of the usable region and its size, for
    /// `ucontext_t::uc_stack`.
    pub fn region(&self) -> (*mut c_void, usize) {
        (self.usable as *mut c_void, self.vm_size)
    }

    /// Allocates (or recycles) a stack of exactly `vm_size` bytes.
    pub fn acquire(vm_size: usize) -> Result<Stack> {
        let mut candidate = STACK_CACHE.swap(ptr::null_mut(), Ordering::AcqRel);

        loop {
            if candidate.is_null() {
                return Self::map_new(vm_size);
            }
            // SAFETY: candidate came from a prior `release()` of a Stack we
            // own, or from another thread's release via the atomic list.
            let header = unsafe { &*candidate };
            if header.vm_size == vm_size {
                let next = header.next.load(Ordering::Acquire);
                // Put the remainder of the popped chain back for others.
                if !next.is_null() {
                    Self::push_chain(next);
                }
                let page = page_size();
                return Ok(Stack {
                    map_base: (candidate as *mut u8).wrapping_sub(page) as *mut c_void,
                    map_size: vm_size + 2 * page,
                    usable: candidate,
                    vm_size,
                });
            }

            // Wrong size: unmap this entry and keep scanning the chain.
            let next = header.next.load(Ordering::Acquire);
            let page = page_size();
            let map_base = (candidate as *mut u8).wrapping_sub(page) as *mut c_void;
            let map_size = header.vm_size + 2 * page;
            // SAFETY: map_base/map_size describe the mapping created in
            // `map_new` for this cached entry.
            unsafe {
                libc::munmap(map_base, map_size);
            }
            candidate = next;
        }
    }

    fn map_new(vm_size: usize) -> Result<Stack> {
        let page = page_size();
        let map_size = vm_size + 2 * page;
        // SAFETY: requesting anonymous, non-executable memory with no fd.
        let map_base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map_base == libc::MAP_FAILED {
            return Err(Error::Resource(format!(
                "mmap failed for stack of size {vm_size}: {}",
                std::io::Error::last_os_error()
            )));
        }
        let usable = (map_base as *mut u8).wrapping_add(page) as *mut c_void;
        // SAFETY: usable..usable+vm_size lies strictly inside map_base's
        // mapping, with guard pages of size `page` on both sides.
        let rc = unsafe { libc::mprotect(usable, vm_size, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            unsafe {
                libc::munmap(map_base, map_size);
            }
            return Err(Error::Resource(format!(
                "mprotect failed for stack of size {vm_size}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Stack {
            map_base,
            map_size,
            usable: usable as *mut CachedStackHeader,
            vm_size,
        })
    }

    fn push_chain(head: *mut CachedStackHeader) {
        let mut cur = STACK_CACHE.load(Ordering::Acquire);
        loop {
            // SAFETY: head was just popped from the same cache and is not
            // observed by any other thread until this CAS succeeds.
            unsafe { &*head }.next.store(cur, Ordering::Relaxed);
            match STACK_CACHE.compare_exchange_weak(
                cur,
                head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Releases the stack back to the cache for reuse.
    pub fn release(self) {
        // SAFETY: `usable` points to vm_size writable bytes we own
        // exclusively; writing the header in place is valid as long as
        // vm_size >= size_of::<CachedStackHeader>(), guaranteed by the
        // 64 KiB minimum stack size.
        unsafe {
            (*self.usable).vm_size = self.vm_size;
            (*self.usable).next = AtomicPtr::new(ptr::null_mut());
        }
        Stack::push_chain(self.usable);
        std::mem::forget(self);
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Only reached if `release` was not called (e.g. an error path) --
        // unmap directly rather than leaking.
        // SAFETY: map_base/map_size were produced by `map_new` for this
        // stack and have not been unmapped yet.
        unsafe {
            libc::munmap(self.map_base, self.map_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trips_through_cache() {
        let size = page_size() * 16;
        let stack = Stack::acquire(size).unwrap();
        let (ptr1, _) = stack.region();
        stack.release();

        let stack2 = Stack::acquire(size).unwrap();
        let (ptr2, _) = stack2.region();
        assert_eq!(ptr1, ptr2, "same-size stack should be recycled");
        stack2.release();
    }

    #[test]
    fn mismatched_size_is_not_reused() {
        let page = page_size();
        let a = Stack::acquire(page * 16).unwrap();
        a.release();
        let b = Stack::acquire(page * 32).unwrap();
        b.release();
    }
}
