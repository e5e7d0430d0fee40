//! Named, reference-counted shared-memory objects.
//!
//! Every cross-process structure in this crate lives inside a `ShmObject`:
//! a POSIX shared-memory object (`shm_open`) mapped with `MAP_SHARED`. The
//! first cache line of the region is an object header owned by this module:
//!
//! ```text
//! word 0  refcount        (live handles across all processes)
//! word 1  region size     (total mapped bytes, written by the creator)
//! word 2  layout word     (magic << 32 | version)
//! word 3  init state      (0 = raw, 1 = initializing, 2 = ready)
//! ```
//!
//! The user layout begins at byte 64. The OS name is removed from the
//! namespace by whichever process's release drops the refcount to zero;
//! `clear_storage` removes it unconditionally for crash cleanup.
//!
//! Within one process a registry keyed by name collapses repeated acquires
//! onto a single mapping, so at most one view per name exists per process.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use shmchan_primitives::Region;

use crate::error::ShmError;

/// Magic identifying a shmchan object, packed into the layout word.
pub const LAYOUT_MAGIC: u32 = 0x53484D43; // "SHMC"
/// Current layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Bytes reserved for the object header at the start of every region.
pub const OBJECT_HEADER_LEN: usize = 64;

const INIT_READY: u64 = 2;

/// How long attachers wait for the creator to size and initialize the
/// region before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open mode for [`ShmObject::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create the object if absent, attach otherwise.
    CreateOrOpen,
    /// Attach only; the object's size must match exactly.
    OpenOnly,
}

#[repr(C, align(64))]
struct ObjectHeader {
    refcount: AtomicU64,
    region_size: AtomicU64,
    layout: AtomicU64,
    init_state: AtomicU64,
    _pad: [u8; 32],
}

const _: () = assert!(core::mem::size_of::<ObjectHeader>() == OBJECT_HEADER_LEN);

#[inline]
fn layout_word() -> u64 {
    ((LAYOUT_MAGIC as u64) << 32) | LAYOUT_VERSION as u64
}

// =============================================================================
// Attachment (one mapping per process per name)
// =============================================================================

struct Attachment {
    base: *mut u8,
    map_len: usize,
    name: String,
    os_name: CString,
}

// SAFETY: the mapping is shared memory synchronized via atomics; the raw
// pointer itself is stable for the attachment's lifetime.
unsafe impl Send for Attachment {}
unsafe impl Sync for Attachment {}

impl Attachment {
    #[inline]
    fn header(&self) -> &ObjectHeader {
        // SAFETY: base points at a mapping of at least OBJECT_HEADER_LEN
        // bytes, page-aligned, and the header is only mutated via atomics.
        unsafe { &*(self.base as *const ObjectHeader) }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        // SAFETY: base/map_len describe the live mapping created in acquire.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

fn registry() -> &'static Mutex<HashMap<String, Weak<Attachment>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<Attachment>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

// =============================================================================
// ShmObject
// =============================================================================

/// A handle to a named, reference-counted shared-memory region.
///
/// Dropping the handle releases it; the process whose release drops the
/// shared refcount to zero unlinks the OS name.
pub struct ShmObject {
    att: Arc<Attachment>,
    created: bool,
    released: bool,
}

impl ShmObject {
    /// Acquire the named object with room for `user_size` bytes of user
    /// layout (the object header is added on top).
    ///
    /// The creator gets a zero-filled region and `created() == true`; it
    /// must initialize its layout and then call [`ShmObject::mark_ready`].
    /// Attachers block (bounded) until the creator marks the region ready.
    pub fn acquire(name: &str, user_size: usize, mode: ShmOpenMode) -> Result<Self, ShmError> {
        let total = OBJECT_HEADER_LEN
            .checked_add(user_size)
            .ok_or_else(|| ShmError::SizeMismatch {
                name: name.to_string(),
                expected: user_size,
                actual: 0,
            })?;

        // Fast path: this process already maps the name.
        let existing = {
            let mut map = registry().lock().expect("shm registry poisoned");
            map.retain(|_, weak| weak.strong_count() > 0);
            map.get(name).and_then(Weak::upgrade)
        };
        if let Some(att) = existing {
            wait_ready(&att, name)?;
            validate_attachment(&att, name, total, mode)?;
            att.header().refcount.fetch_add(1, Ordering::AcqRel);
            return Ok(Self {
                att,
                created: false,
                released: false,
            });
        }

        let os_name = os_name_for(name)?;
        let (fd, created) = open_or_create(&os_name, name, mode)?;

        let map_len = if created {
            // SAFETY: fd is a fresh shm object we own.
            let rc = unsafe { libc::ftruncate(fd, total as libc::off_t) };
            if rc != 0 {
                let source = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                let _ = unsafe { libc::shm_unlink(os_name.as_ptr()) };
                return Err(ShmError::Unavailable {
                    name: name.to_string(),
                    source,
                });
            }
            total
        } else {
            wait_for_size(fd, name)?
        };

        // SAFETY: fd is open and map_len > 0.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The mapping keeps the object alive; the descriptor is no longer
        // needed either way.
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(ShmError::Unavailable {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let att = Arc::new(Attachment {
            base: base as *mut u8,
            map_len,
            name: name.to_string(),
            os_name,
        });

        if created {
            let header = att.header();
            header.region_size.store(total as u64, Ordering::Relaxed);
            header.layout.store(layout_word(), Ordering::Release);
            tracing::debug!(name, size = total, "created shared memory object");
        } else {
            wait_ready(&att, name)?;
            validate_attachment(&att, name, total, mode)?;
            tracing::trace!(name, size = map_len, "attached shared memory object");
        }

        att.header().refcount.fetch_add(1, Ordering::AcqRel);
        registry()
            .lock()
            .expect("shm registry poisoned")
            .insert(name.to_string(), Arc::downgrade(&att));

        Ok(Self {
            att,
            created,
            released: false,
        })
    }

    /// True if this handle created the object (and owes a `mark_ready`).
    #[inline]
    pub fn created(&self) -> bool {
        self.created
    }

    /// Publish the region as fully initialized. Creator only.
    pub fn mark_ready(&self) {
        self.att
            .header()
            .init_state
            .store(INIT_READY, Ordering::Release);
    }

    /// The object's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.att.name
    }

    /// Pointer to the start of the user layout.
    #[inline]
    pub fn user_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping is at least OBJECT_HEADER_LEN + 1 bytes.
        unsafe { self.att.base.add(OBJECT_HEADER_LEN) }
    }

    /// Size of the user layout in bytes.
    #[inline]
    pub fn user_len(&self) -> usize {
        self.att.map_len - OBJECT_HEADER_LEN
    }

    /// A [`Region`] view of the user layout.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping outlives this handle and its derived views by
        // contract (views are only used while a handle is alive).
        unsafe { Region::from_raw(self.user_ptr(), self.user_len()) }
    }

    /// Current shared refcount.
    #[inline]
    pub fn refcount(&self) -> u64 {
        self.att.header().refcount.load(Ordering::Acquire)
    }

    /// Release this handle, returning the remaining refcount.
    ///
    /// The handle whose release returns 0 has unlinked the OS name.
    pub fn release(mut self) -> u64 {
        self.released = true;
        release_attachment(&self.att)
    }

    /// Remove a name from the OS namespace unconditionally.
    ///
    /// Existing mappings stay valid until detached. Idempotent: a missing
    /// name is not an error. For administrative cleanup after crashes.
    pub fn clear_storage(name: &str) -> Result<(), ShmError> {
        let os_name = os_name_for(name)?;
        // SAFETY: os_name is a valid C string.
        let rc = unsafe { libc::shm_unlink(os_name.as_ptr()) };
        if rc != 0 {
            let source = io::Error::last_os_error();
            if source.raw_os_error() != Some(libc::ENOENT) {
                return Err(ShmError::Unavailable {
                    name: name.to_string(),
                    source,
                });
            }
        } else {
            tracing::debug!(name, "cleared shared memory storage");
        }
        Ok(())
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        if !self.released {
            release_attachment(&self.att);
        }
    }
}

impl std::fmt::Debug for ShmObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmObject")
            .field("name", &self.att.name)
            .field("user_len", &self.user_len())
            .field("refcount", &self.refcount())
            .finish()
    }
}

fn release_attachment(att: &Arc<Attachment>) -> u64 {
    let prev = att.header().refcount.fetch_sub(1, Ordering::AcqRel);
    if prev == 1 {
        // Our decrement produced zero: we unlink. Concurrent releases in
        // other processes saw prev > 1 and leave the name alone.
        // SAFETY: os_name is a valid C string.
        let rc = unsafe { libc::shm_unlink(att.os_name.as_ptr()) };
        if rc == 0 {
            tracing::debug!(name = %att.name, "unlinked shared memory object");
        }
    }
    prev - 1
}

// =============================================================================
// Helpers
// =============================================================================

fn os_name_for(name: &str) -> Result<CString, ShmError> {
    if name.is_empty() || name.len() > 200 || !name.is_ascii() {
        return Err(ShmError::Unavailable {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid object name"),
        });
    }
    let sanitized: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    CString::new(format!("/shmchan.{sanitized}")).map_err(|_| ShmError::Unavailable {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "invalid object name"),
    })
}

/// Open the OS object, creating it when allowed. Returns the fd and whether
/// this call created the object.
fn open_or_create(
    os_name: &CString,
    name: &str,
    mode: ShmOpenMode,
) -> Result<(libc::c_int, bool), ShmError> {
    loop {
        if mode == ShmOpenMode::CreateOrOpen {
            // SAFETY: os_name is a valid C string.
            let fd = unsafe {
                libc::shm_open(
                    os_name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::mode_t,
                )
            };
            if fd >= 0 {
                return Ok((fd, true));
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(ShmError::Unavailable {
                    name: name.to_string(),
                    source: err,
                });
            }
        }

        // SAFETY: os_name is a valid C string.
        let fd = unsafe { libc::shm_open(os_name.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t) };
        if fd >= 0 {
            return Ok((fd, false));
        }
        let err = io::Error::last_os_error();
        if mode == ShmOpenMode::CreateOrOpen && err.raw_os_error() == Some(libc::ENOENT) {
            // Lost a race with a concurrent unlink; try creating again.
            continue;
        }
        return Err(ShmError::Unavailable {
            name: name.to_string(),
            source: err,
        });
    }
}

/// Wait until the creator has sized the object, then return the size.
fn wait_for_size(fd: libc::c_int, name: &str) -> Result<usize, ShmError> {
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        // SAFETY: fd is an open descriptor; stat is zero-initialized.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        if rc != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::Unavailable {
                name: name.to_string(),
                source,
            });
        }
        if stat.st_size as usize >= OBJECT_HEADER_LEN {
            return Ok(stat.st_size as usize);
        }
        if Instant::now() >= deadline {
            unsafe { libc::close(fd) };
            return Err(ShmError::InitTimeout {
                name: name.to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Wait until the creator marks the region ready.
fn wait_ready(att: &Arc<Attachment>, name: &str) -> Result<(), ShmError> {
    let header = att.header();
    if header.init_state.load(Ordering::Acquire) == INIT_READY {
        return Ok(());
    }
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        if header.init_state.load(Ordering::Acquire) == INIT_READY {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ShmError::InitTimeout {
                name: name.to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn validate_attachment(
    att: &Arc<Attachment>,
    name: &str,
    expected_total: usize,
    mode: ShmOpenMode,
) -> Result<(), ShmError> {
    let header = att.header();
    let layout = header.layout.load(Ordering::Acquire);
    if layout != layout_word() {
        return Err(ShmError::IncompatibleLayout {
            name: name.to_string(),
            found: layout,
        });
    }
    let actual = header.region_size.load(Ordering::Acquire) as usize;
    let mismatch = match mode {
        ShmOpenMode::OpenOnly => actual != expected_total,
        ShmOpenMode::CreateOrOpen => actual < expected_total,
    };
    if mismatch {
        return Err(ShmError::SizeMismatch {
            name: name.to_string(),
            expected: expected_total,
            actual,
        });
    }
    Ok(())
}
