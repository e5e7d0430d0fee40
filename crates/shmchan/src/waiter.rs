//! Predicate waiting with broadcast shutdown.
//!
//! A `Waiter` composes a robust mutex, a condvar, and a quit flag in one
//! shared-memory cell. Blocking queue and pool operations park here after
//! their lock-free fast path exhausts its spin budget; `quit_waiting` wakes
//! every parked peer and makes them return `Shutdown`.
//!
//! A waiter-presence counter lets notifiers skip the mutex entirely while
//! nobody is parked, so the lock-free fast path stays lock-free. The
//! counter is incremented under the mutex before the first predicate test
//! and read behind a seq-cst fence, which closes the classic
//! missed-wakeup window: either the notifier observes the waiter and takes
//! the mutex, or the waiter's predicate test observes the notifier's
//! prior write.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::time::Duration;

use crate::condvar::{CondVar, CondVarCell};
use crate::error::LockError;
use crate::robust::{RobustMutex, RobustMutexCell, timespec_after};

/// The shared-memory cell backing a [`Waiter`].
#[repr(C)]
pub struct WaiterCell {
    mutex: RobustMutexCell,
    cond: CondVarCell,
    quit: AtomicU32,
    waiters: AtomicU32,
}

/// A view of a [`WaiterCell`] in mapped memory.
#[derive(Clone, Copy)]
pub struct Waiter {
    cell: NonNull<WaiterCell>,
    mutex: RobustMutex,
    cond: CondVar,
}

// SAFETY: the underlying primitives are cross-process; the view holds only
// stable pointers into the mapping.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Waiter {
    /// Initialize the cell.
    ///
    /// # Safety
    ///
    /// `cell` must point into writable mapped memory, be called exactly
    /// once per cell, and complete before any other process touches it.
    pub unsafe fn init_cell(cell: *mut WaiterCell) -> Result<(), LockError> {
        // SAFETY: forwarded contract.
        unsafe {
            RobustMutex::init_cell(&raw mut (*cell).mutex)?;
            CondVar::init_cell(&raw mut (*cell).cond)?;
            (*cell).quit = AtomicU32::new(0);
            (*cell).waiters = AtomicU32::new(0);
        }
        Ok(())
    }

    /// Wrap an initialized cell.
    ///
    /// # Safety
    ///
    /// `cell` must point to a cell initialized by [`Waiter::init_cell`] and
    /// remain mapped for the lifetime of the view.
    pub unsafe fn from_cell(cell: *mut WaiterCell) -> Self {
        // SAFETY: forwarded contract.
        unsafe {
            Self {
                cell: NonNull::new(cell).expect("waiter cell must be non-null"),
                mutex: RobustMutex::from_cell(&raw mut (*cell).mutex),
                cond: CondVar::from_cell(&raw mut (*cell).cond),
            }
        }
    }

    #[inline]
    fn quit_flag(&self) -> &AtomicU32 {
        // SAFETY: cell points to an initialized, mapped cell.
        unsafe { &(*self.cell.as_ptr()).quit }
    }

    #[inline]
    fn waiter_count(&self) -> &AtomicU32 {
        // SAFETY: cell points to an initialized, mapped cell.
        unsafe { &(*self.cell.as_ptr()).waiters }
    }

    /// True once `quit_waiting` has been invoked.
    #[inline]
    pub fn quit(&self) -> bool {
        self.quit_flag().load(Ordering::Acquire) != 0
    }

    /// Block until `pred` holds or the waiter is quit.
    ///
    /// Returns `Ok(true)` when the predicate held, `Ok(false)` on quit.
    pub fn wait(&self, pred: impl Fn() -> bool) -> Result<bool, LockError> {
        self.mutex.lock()?;
        self.waiter_count().fetch_add(1, Ordering::SeqCst);
        let outcome = loop {
            if self.quit_flag().load(Ordering::Acquire) != 0 {
                break false;
            }
            if pred() {
                break true;
            }
            if let Err(e) = self.cond.wait(&self.mutex) {
                self.waiter_count().fetch_sub(1, Ordering::SeqCst);
                let _ = self.mutex.unlock();
                return Err(e);
            }
        };
        self.waiter_count().fetch_sub(1, Ordering::SeqCst);
        self.mutex.unlock()?;
        Ok(outcome)
    }

    /// Like [`Waiter::wait`] with a relative monotonic timeout.
    ///
    /// Returns `Err(LockError::TimedOut)` when the deadline passes with the
    /// predicate still false.
    pub fn wait_for(
        &self,
        pred: impl Fn() -> bool,
        duration: Duration,
    ) -> Result<bool, LockError> {
        let deadline = timespec_after(libc::CLOCK_MONOTONIC, duration)?;
        self.mutex.lock()?;
        self.waiter_count().fetch_add(1, Ordering::SeqCst);
        let outcome = loop {
            if self.quit_flag().load(Ordering::Acquire) != 0 {
                break false;
            }
            if pred() {
                break true;
            }
            match self.cond.wait_until(&self.mutex, &deadline) {
                Ok(()) => {}
                Err(LockError::TimedOut) => {
                    // Deadline reached; one last predicate check under the
                    // lock before reporting the timeout.
                    let satisfied = pred();
                    let quit = self.quit_flag().load(Ordering::Acquire) != 0;
                    self.waiter_count().fetch_sub(1, Ordering::SeqCst);
                    self.mutex.unlock()?;
                    if quit {
                        return Ok(false);
                    }
                    if satisfied {
                        return Ok(true);
                    }
                    return Err(LockError::TimedOut);
                }
                Err(e) => {
                    self.waiter_count().fetch_sub(1, Ordering::SeqCst);
                    let _ = self.mutex.unlock();
                    return Err(e);
                }
            }
        };
        self.waiter_count().fetch_sub(1, Ordering::SeqCst);
        self.mutex.unlock()?;
        Ok(outcome)
    }

    /// Wake one waiter. Lock-free when nobody is parked.
    pub fn notify(&self) -> Result<(), LockError> {
        if !self.has_waiters() {
            return Ok(());
        }
        self.mutex.lock()?;
        let result = self.cond.notify_one();
        self.mutex.unlock()?;
        result
    }

    /// Wake all waiters. Lock-free when nobody is parked.
    pub fn broadcast(&self) -> Result<(), LockError> {
        if !self.has_waiters() {
            return Ok(());
        }
        self.mutex.lock()?;
        let result = self.cond.notify_all();
        self.mutex.unlock()?;
        result
    }

    #[inline]
    fn has_waiters(&self) -> bool {
        // Pairs with the seq-cst increment in the wait paths: a waiter we
        // miss here incremented after this fence, so its predicate test
        // observes the state change that preceded this notify.
        fence(Ordering::SeqCst);
        self.waiter_count().load(Ordering::SeqCst) != 0
    }

    /// Set the quit flag under the mutex and wake everything. All current
    /// and future waits return the quit outcome.
    pub fn quit_waiting(&self) -> Result<(), LockError> {
        self.mutex.lock()?;
        self.quit_flag().store(1, Ordering::SeqCst);
        let result = self.cond.notify_all();
        self.mutex.unlock()?;
        result
    }

    /// Clear the quit flag. Used by a creator re-initializing a channel.
    pub fn reset_quit(&self) {
        self.quit_flag().store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn make_waiter() -> (Box<WaiterCell>, Waiter) {
        // Process-shared primitives work just as well within one process;
        // tests use a heap cell instead of a mapping.
        let mut cell: Box<WaiterCell> = unsafe { Box::new_zeroed().assume_init() };
        let ptr: *mut WaiterCell = &mut *cell;
        unsafe { Waiter::init_cell(ptr).unwrap() };
        let waiter = unsafe { Waiter::from_cell(ptr) };
        (cell, waiter)
    }

    #[test]
    fn test_wait_returns_when_predicate_holds() {
        let (_cell, waiter) = make_waiter();
        assert!(waiter.wait(|| true).unwrap());
    }

    #[test]
    fn test_wait_for_times_out() {
        let (_cell, waiter) = make_waiter();
        let err = waiter
            .wait_for(|| false, Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err, LockError::TimedOut);
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let (_cell, waiter) = make_waiter();
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let flag = flag.clone();
            std::thread::spawn(move || waiter.wait(move || flag.load(Ordering::Acquire)))
        };
        std::thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        waiter.broadcast().unwrap();
        assert!(handle.join().unwrap().unwrap());
    }

    #[test]
    fn test_quit_waiting_wakes_all() {
        let (_cell, waiter) = make_waiter();
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(std::thread::spawn(move || waiter.wait(|| false)));
        }
        std::thread::sleep(Duration::from_millis(20));
        waiter.quit_waiting().unwrap();
        for handle in handles {
            assert!(!handle.join().unwrap().unwrap(), "waiters observe quit");
        }
    }

    #[test]
    fn test_notification_without_waiter_is_dropped() {
        let (_cell, waiter) = make_waiter();
        waiter.notify().unwrap();
        let err = waiter
            .wait_for(|| false, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, LockError::TimedOut);
    }

    #[test]
    fn test_repeated_wake_sleep_cycles() {
        let (_cell, waiter) = make_waiter();
        let counter = Arc::new(AtomicU32::new(0));

        let handle = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for target in 1..=50u32 {
                    let counter = counter.clone();
                    let ok = waiter
                        .wait(move || counter.load(Ordering::Acquire) >= target)
                        .unwrap();
                    assert!(ok);
                }
            })
        };

        for _ in 0..50 {
            counter.fetch_add(1, Ordering::AcqRel);
            waiter.broadcast().unwrap();
            std::thread::yield_now();
        }
        handle.join().unwrap();
    }
}
