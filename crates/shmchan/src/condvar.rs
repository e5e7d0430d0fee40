//! Cross-process condition variable.
//!
//! A `pthread_cond_t` in shared memory, process-shared and bound to
//! `CLOCK_MONOTONIC` so timed waits are immune to wall-clock jumps. Always
//! paired with a [`RobustMutex`] held by the caller on entry; spurious
//! wakeups are permitted and callers must retest their predicates.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::LockError;
use crate::robust::{RobustMutex, check, timespec_after};

/// The shared-memory cell holding the condvar state.
#[repr(C)]
pub struct CondVarCell {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

/// A view of a [`CondVarCell`] in mapped memory.
#[derive(Clone, Copy)]
pub struct CondVar {
    cell: NonNull<CondVarCell>,
}

// SAFETY: pthread condvars are made for concurrent cross-process use; the
// view holds only a stable pointer into the mapping.
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    /// Initialize the cell as a process-shared, monotonic-clock condvar.
    ///
    /// # Safety
    ///
    /// `cell` must point into writable mapped memory, be called exactly
    /// once per cell, and complete before any other process touches it.
    pub unsafe fn init_cell(cell: *mut CondVarCell) -> Result<(), LockError> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: attr is a valid uninitialized attribute object.
        unsafe {
            check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            let attr_ptr = attr.as_mut_ptr();
            check(libc::pthread_condattr_setpshared(
                attr_ptr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_condattr_setclock(
                attr_ptr,
                libc::CLOCK_MONOTONIC,
            ))?;
            let rc = libc::pthread_cond_init((*cell).inner.get(), attr_ptr);
            libc::pthread_condattr_destroy(attr_ptr);
            check(rc)
        }
    }

    /// Wrap an initialized cell.
    ///
    /// # Safety
    ///
    /// `cell` must point to a cell initialized by [`CondVar::init_cell`]
    /// and remain mapped for the lifetime of the view.
    pub unsafe fn from_cell(cell: *mut CondVarCell) -> Self {
        Self {
            cell: NonNull::new(cell).expect("condvar cell must be non-null"),
        }
    }

    #[inline]
    fn raw(&self) -> *mut libc::pthread_cond_t {
        // SAFETY: cell points to an initialized, mapped cell.
        unsafe { (*self.cell.as_ptr()).inner.get() }
    }

    /// Atomically release `mutex` and wait; the mutex is re-acquired on
    /// return. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &RobustMutex) -> Result<(), LockError> {
        // SAFETY: both cells are initialized; caller holds the mutex.
        match unsafe { libc::pthread_cond_wait(self.raw(), mutex_raw(mutex)) } {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                // A peer died holding the mutex while we waited; we now own
                // it in inconsistent state. Restore and let the caller
                // retest its predicate.
                mutex.make_consistent()
            }
            rc => Err(LockError::Os(rc)),
        }
    }

    /// Like [`CondVar::wait`] with a relative monotonic timeout.
    pub fn wait_for(&self, mutex: &RobustMutex, duration: Duration) -> Result<(), LockError> {
        let deadline = timespec_after(libc::CLOCK_MONOTONIC, duration)?;
        self.wait_until(mutex, &deadline)
    }

    /// Like [`CondVar::wait`] with an absolute `CLOCK_MONOTONIC` deadline.
    pub fn wait_until(
        &self,
        mutex: &RobustMutex,
        deadline: &libc::timespec,
    ) -> Result<(), LockError> {
        // SAFETY: both cells are initialized; caller holds the mutex.
        match unsafe { libc::pthread_cond_timedwait(self.raw(), mutex_raw(mutex), deadline) } {
            0 => Ok(()),
            libc::ETIMEDOUT => Err(LockError::TimedOut),
            libc::EOWNERDEAD => mutex.make_consistent(),
            rc => Err(LockError::Os(rc)),
        }
    }

    /// Wake one waiter. A notification with no waiter is dropped.
    pub fn notify_one(&self) -> Result<(), LockError> {
        // SAFETY: cell is initialized.
        check(unsafe { libc::pthread_cond_signal(self.raw()) })
    }

    /// Wake all waiters.
    pub fn notify_all(&self) -> Result<(), LockError> {
        // SAFETY: cell is initialized.
        check(unsafe { libc::pthread_cond_broadcast(self.raw()) })
    }
}

#[inline]
fn mutex_raw(mutex: &RobustMutex) -> *mut libc::pthread_mutex_t {
    // RobustMutex exposes its raw pointer only inside the crate.
    mutex.raw_for_cond()
}
