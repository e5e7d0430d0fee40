//! Robust cross-process mutex.
//!
//! A `pthread_mutex_t` living in shared memory, initialized with
//! `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST`. When a process
//! dies while holding the lock, the next locker observes `EOWNERDEAD`,
//! restores consistency (`pthread_mutex_consistent`), unlocks, and retries,
//! up to a fixed recovery budget.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::{LockError, ShmError};
use crate::shm::{ShmObject, ShmOpenMode};

/// Owner-death recoveries attempted before a lock call gives up.
const MAX_RECOVERIES: u32 = 16;

/// The shared-memory cell holding the mutex state.
///
/// Placed inside a mapped region by embedding it in a `repr(C)` layout
/// struct. Must be initialized exactly once, by the region's creator, via
/// [`RobustMutex::init_cell`].
#[repr(C)]
pub struct RobustMutexCell {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

/// A view of a [`RobustMutexCell`] in mapped memory.
#[derive(Clone, Copy)]
pub struct RobustMutex {
    cell: NonNull<RobustMutexCell>,
}

// SAFETY: pthread mutexes are made for concurrent cross-process use; the
// view holds only a stable pointer into the mapping.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    /// Initialize the cell as a robust, process-shared mutex.
    ///
    /// # Safety
    ///
    /// `cell` must point into writable mapped memory, be called exactly
    /// once per cell, and complete before any other process touches it.
    pub unsafe fn init_cell(cell: *mut RobustMutexCell) -> Result<(), LockError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is a valid uninitialized attribute object.
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let attr_ptr = attr.as_mut_ptr();
            check(libc::pthread_mutexattr_setpshared(
                attr_ptr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutexattr_setrobust(
                attr_ptr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let rc = libc::pthread_mutex_init((*cell).inner.get(), attr_ptr);
            libc::pthread_mutexattr_destroy(attr_ptr);
            check(rc)
        }
    }

    /// Wrap an initialized cell.
    ///
    /// # Safety
    ///
    /// `cell` must point to a cell initialized by [`RobustMutex::init_cell`]
    /// and remain mapped for the lifetime of the view.
    pub unsafe fn from_cell(cell: *mut RobustMutexCell) -> Self {
        Self {
            cell: NonNull::new(cell).expect("mutex cell must be non-null"),
        }
    }

    #[inline]
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        // SAFETY: cell points to an initialized, mapped cell.
        unsafe { (*self.cell.as_ptr()).inner.get() }
    }

    #[inline]
    pub(crate) fn raw_for_cond(&self) -> *mut libc::pthread_mutex_t {
        self.raw()
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> Result<(), LockError> {
        for _ in 0..=MAX_RECOVERIES {
            // SAFETY: raw() points at an initialized pthread mutex.
            match unsafe { libc::pthread_mutex_lock(self.raw()) } {
                0 => return Ok(()),
                libc::EOWNERDEAD => self.recover()?,
                rc => return Err(LockError::Os(rc)),
            }
        }
        Err(LockError::LockFailed)
    }

    /// Try to acquire without blocking. Returns `Ok(false)` when the lock
    /// is held elsewhere.
    pub fn try_lock(&self) -> Result<bool, LockError> {
        for _ in 0..=MAX_RECOVERIES {
            // SAFETY: raw() points at an initialized pthread mutex.
            match unsafe { libc::pthread_mutex_trylock(self.raw()) } {
                0 => return Ok(true),
                libc::EBUSY => return Ok(false),
                libc::EOWNERDEAD => self.recover()?,
                rc => return Err(LockError::Os(rc)),
            }
        }
        Err(LockError::LockFailed)
    }

    /// Block until the lock is acquired or `duration` elapses.
    ///
    /// Owner-death recoveries retry against the same absolute deadline, so
    /// they never extend the budget beyond the elapsed wait.
    pub fn try_lock_for(&self, duration: Duration) -> Result<(), LockError> {
        let deadline = timespec_after(libc::CLOCK_REALTIME, duration)?;
        for _ in 0..=MAX_RECOVERIES {
            // SAFETY: raw() points at an initialized pthread mutex.
            match unsafe { libc::pthread_mutex_timedlock(self.raw(), &deadline) } {
                0 => return Ok(()),
                libc::ETIMEDOUT => return Err(LockError::TimedOut),
                libc::EOWNERDEAD => self.recover()?,
                rc => return Err(LockError::Os(rc)),
            }
        }
        Err(LockError::LockFailed)
    }

    /// Release the lock. Fails with [`LockError::NotOwner`] when the caller
    /// does not hold it.
    pub fn unlock(&self) -> Result<(), LockError> {
        // SAFETY: raw() points at an initialized pthread mutex.
        match unsafe { libc::pthread_mutex_unlock(self.raw()) } {
            0 => Ok(()),
            libc::EPERM => Err(LockError::NotOwner),
            rc => Err(LockError::Os(rc)),
        }
    }

    /// We were handed the lock after its owner died: restore consistency
    /// and release it so the retry path can acquire a clean mutex.
    fn recover(&self) -> Result<(), LockError> {
        tracing::warn!("recovering robust mutex after owner death");
        // SAFETY: on EOWNERDEAD the calling thread holds the mutex.
        unsafe {
            check(libc::pthread_mutex_consistent(self.raw()))?;
            check(libc::pthread_mutex_unlock(self.raw()))
        }
    }

    /// Mark the mutex consistent without releasing it.
    ///
    /// Used by condvar waits that resume with `EOWNERDEAD`: the caller
    /// holds the lock and will retest its predicate anyway.
    pub(crate) fn make_consistent(&self) -> Result<(), LockError> {
        // SAFETY: the caller holds the mutex in inconsistent state.
        unsafe { check(libc::pthread_mutex_consistent(self.raw())) }
    }
}

/// A robust mutex living alone in its own named shared-memory object.
pub struct NamedRobustMutex {
    _shm: ShmObject,
    mutex: RobustMutex,
}

impl NamedRobustMutex {
    /// Open (creating if absent) the named mutex.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let shm = ShmObject::acquire(
            name,
            std::mem::size_of::<RobustMutexCell>(),
            ShmOpenMode::CreateOrOpen,
        )?;
        let cell = shm.user_ptr() as *mut RobustMutexCell;
        if shm.created() {
            // SAFETY: freshly created region, not yet visible to attachers.
            unsafe { RobustMutex::init_cell(cell) }.map_err(|e| ShmError::Unavailable {
                name: name.to_string(),
                source: std::io::Error::other(e),
            })?;
            shm.mark_ready();
        }
        // SAFETY: cell initialized by the creator before mark_ready.
        let mutex = unsafe { RobustMutex::from_cell(cell) };
        Ok(Self { _shm: shm, mutex })
    }

    #[inline]
    pub fn mutex(&self) -> &RobustMutex {
        &self.mutex
    }

    pub fn lock(&self) -> Result<(), LockError> {
        self.mutex.lock()
    }

    pub fn try_lock(&self) -> Result<bool, LockError> {
        self.mutex.try_lock()
    }

    pub fn try_lock_for(&self, duration: Duration) -> Result<(), LockError> {
        self.mutex.try_lock_for(duration)
    }

    pub fn unlock(&self) -> Result<(), LockError> {
        self.mutex.unlock()
    }

    /// Remove the backing object name. Idempotent.
    pub fn clear_storage(name: &str) -> Result<(), ShmError> {
        ShmObject::clear_storage(name)
    }
}

#[inline]
pub(crate) fn check(rc: libc::c_int) -> Result<(), LockError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(LockError::Os(rc))
    }
}

/// Absolute timespec `duration` from now on the given clock.
pub(crate) fn timespec_after(
    clock: libc::clockid_t,
    duration: Duration,
) -> Result<libc::timespec, LockError> {
    // SAFETY: ts is an out parameter.
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return Err(LockError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
    }
    let nanos = ts.tv_nsec as i64 + duration.subsec_nanos() as i64;
    ts.tv_sec = ts
        .tv_sec
        .saturating_add(duration.as_secs() as libc::time_t)
        .saturating_add((nanos / 1_000_000_000) as libc::time_t);
    ts.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "mutextest.{}.{}.{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_lock_unlock() {
        let m = NamedRobustMutex::open(&unique_name("basic")).unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn test_try_lock_contended() {
        let name = unique_name("contended");
        let a = NamedRobustMutex::open(&name).unwrap();
        let b = NamedRobustMutex::open(&name).unwrap();

        a.lock().unwrap();
        assert!(!b.try_lock().unwrap());
        a.unlock().unwrap();
        assert!(b.try_lock().unwrap());
        b.unlock().unwrap();
    }

    #[test]
    fn test_timed_lock_times_out() {
        let name = unique_name("timed");
        let a = NamedRobustMutex::open(&name).unwrap();
        let b = NamedRobustMutex::open(&name).unwrap();

        a.lock().unwrap();
        let started = std::time::Instant::now();
        let err = b.try_lock_for(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, LockError::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(40));
        a.unlock().unwrap();
    }

    #[test]
    fn test_unlock_by_non_owner() {
        let name = unique_name("nonowner");
        let m = NamedRobustMutex::open(&name).unwrap();
        m.lock().unwrap();
        let handle = {
            let name = name.clone();
            std::thread::spawn(move || {
                let other = NamedRobustMutex::open(&name).unwrap();
                other.unlock()
            })
        };
        assert_eq!(handle.join().unwrap().unwrap_err(), LockError::NotOwner);
        m.unlock().unwrap();
    }
}
