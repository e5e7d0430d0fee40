//! Large-message pool.
//!
//! Payloads above the channel's `large_limit` travel out of band: the
//! sender copies them into a chunk from this pool and the ring slot carries
//! only the chunk id. The pool is a separate shared-memory object carved
//! into power-of-two size classes, each with its own lock-free freelist:
//!
//! ```text
//! +------------------------------------------------------------------+
//! | PoolShared: waiter cell + 8 x ClassHead (64 bytes each)          |
//! +------------------------------------------------------------------+
//! | class 0: ChunkMeta x count | chunk data x count (large_align)    |
//! | class 1: ...                                                      |
//! +------------------------------------------------------------------+
//! ```
//!
//! Freelists are Treiber stacks with a tag in the upper half of the head
//! word for ABA safety. Chunk refcounts are seeded with the number of
//! addressed readers and live in shared memory, so they survive the death
//! of any single process.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ChannelConfig;
use crate::error::{PoolError, ShmError};
use crate::shm::{ShmObject, ShmOpenMode};
use crate::waiter::{Waiter, WaiterCell};

/// Number of size classes. Class `i` holds chunks of `large_align << i`
/// bytes; with the default 1 KiB alignment the top class is 128 KiB.
pub const NUM_SIZE_CLASSES: usize = 8;

/// Sentinel marking the end of a freelist.
const FREE_END: u32 = u32::MAX;

// =============================================================================
// Shared layout
// =============================================================================

/// Per-class freelist head (64 bytes).
#[repr(C, align(64))]
struct ClassHead {
    /// Chunk size in bytes (immutable after init).
    chunk_size: u32,
    /// Number of chunks in this class (immutable after init).
    chunk_count: u32,
    /// Freelist head: `(tag << 32) | index`, tag bumped on every push/pop.
    free_head: AtomicU64,
    _pad: [u8; 48],
}

const _: () = assert!(core::mem::size_of::<ClassHead>() == 64);

impl ClassHead {
    fn init(&mut self, chunk_size: u32, chunk_count: u32) {
        self.chunk_size = chunk_size;
        self.chunk_count = chunk_count;
        self.free_head = AtomicU64::new(pack_head(FREE_END, 0));
        self._pad = [0; 48];
    }
}

/// Per-chunk metadata (16 bytes).
#[repr(C)]
struct ChunkMeta {
    /// Outstanding reader references; the chunk returns to its freelist
    /// when this reaches zero.
    refcount: AtomicU32,
    /// Next free chunk in this class while on the freelist.
    next_free: AtomicU32,
    /// Reader bits that have not yet released (broadcast bookkeeping).
    readers: AtomicU32,
    _pad: u32,
}

const _: () = assert!(core::mem::size_of::<ChunkMeta>() == 16);

#[repr(C)]
struct PoolShared {
    waiter: WaiterCell,
    // Aligned to 64 by ClassHead's own alignment.
    classes: [ClassHead; NUM_SIZE_CLASSES],
}

#[inline]
fn pack_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack_head(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

// =============================================================================
// Chunk id
// =============================================================================

/// Identifier of one pool chunk, carried inside ring slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u64);

impl ChunkId {
    fn new(class: usize, index: u32) -> Self {
        Self(((class as u64) << 32) | index as u64)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    fn class(self) -> usize {
        (self.0 >> 32) as usize
    }

    #[inline]
    fn index(self) -> u32 {
        self.0 as u32
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Byte offsets of the pool parts within its object region.
#[derive(Debug, Clone, Copy)]
struct PoolLayout {
    class_meta: [usize; NUM_SIZE_CLASSES],
    class_data: [usize; NUM_SIZE_CLASSES],
    chunk_count: u32,
    large_align: u32,
    total: usize,
}

impl PoolLayout {
    fn calculate(config: &ChannelConfig) -> Self {
        let mut class_meta = [0usize; NUM_SIZE_CLASSES];
        let mut class_data = [0usize; NUM_SIZE_CLASSES];
        let count = config.large_cache as usize;

        let mut offset = align_up(core::mem::size_of::<PoolShared>(), 64);
        for class in 0..NUM_SIZE_CLASSES {
            offset = align_up(offset, 64);
            class_meta[class] = offset;
            offset += count * core::mem::size_of::<ChunkMeta>();

            offset = align_up(offset, config.large_align as usize);
            class_data[class] = offset;
            offset += count * ((config.large_align as usize) << class);
        }

        Self {
            class_meta,
            class_data,
            chunk_count: config.large_cache,
            large_align: config.large_align,
            total: offset,
        }
    }

    #[inline]
    fn chunk_size(&self, class: usize) -> usize {
        (self.large_align as usize) << class
    }
}

/// Side pool of shared-memory chunks for oversized payloads.
pub struct LargeMsgPool {
    shm: ShmObject,
    layout: PoolLayout,
    waiter: Waiter,
}

// SAFETY: all shared state is reached through atomics or owned chunks.
unsafe impl Send for LargeMsgPool {}
unsafe impl Sync for LargeMsgPool {}

impl LargeMsgPool {
    /// Open (creating if absent) the pool object under `name`.
    pub fn open(name: &str, config: &ChannelConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let layout = PoolLayout::calculate(config);
        let shm = ShmObject::acquire(name, layout.total, ShmOpenMode::CreateOrOpen)
            .map_err(PoolError::Shm)?;

        let shared = shm.user_ptr() as *mut PoolShared;
        if shm.created() {
            // SAFETY: freshly created region, not yet visible to attachers.
            unsafe {
                Waiter::init_cell(&raw mut (*shared).waiter)?;
                for class in 0..NUM_SIZE_CLASSES {
                    (*shared).classes[class]
                        .init(layout.chunk_size(class) as u32, layout.chunk_count);
                }
            }
            let pool = Self {
                waiter: unsafe { Waiter::from_cell(&raw mut (*shared).waiter) },
                shm,
                layout,
            };
            for class in 0..NUM_SIZE_CLASSES {
                pool.link_freelist(class);
            }
            pool.shm.mark_ready();
            tracing::debug!(name, total = layout.total, "created large-message pool");
            Ok(pool)
        } else {
            validate_pool(&shm, &layout, name)?;
            Ok(Self {
                // SAFETY: cells initialized by the creator before mark_ready.
                waiter: unsafe { Waiter::from_cell(&raw mut (*shared).waiter) },
                shm,
                layout,
            })
        }
    }

    #[inline]
    fn shared(&self) -> &PoolShared {
        // SAFETY: region holds an initialized PoolShared at offset 0.
        unsafe { &*(self.shm.user_ptr() as *const PoolShared) }
    }

    #[inline]
    fn class_head(&self, class: usize) -> &ClassHead {
        &self.shared().classes[class]
    }

    #[inline]
    fn meta(&self, class: usize, index: u32) -> &ChunkMeta {
        debug_assert!(class < NUM_SIZE_CLASSES);
        debug_assert!(index < self.layout.chunk_count);
        let off = self.layout.class_meta[class] + index as usize * core::mem::size_of::<ChunkMeta>();
        // SAFETY: offsets computed from the validated layout.
        unsafe { &*(self.shm.user_ptr().add(off) as *const ChunkMeta) }
    }

    #[inline]
    fn chunk_ptr(&self, id: ChunkId) -> *mut u8 {
        let off =
            self.layout.class_data[id.class()] + id.index() as usize * self.layout.chunk_size(id.class());
        // SAFETY: offsets computed from the validated layout.
        unsafe { self.shm.user_ptr().add(off) }
    }

    /// Chain every chunk of `class` into its freelist. Creator only.
    fn link_freelist(&self, class: usize) {
        let count = self.layout.chunk_count;
        for index in 0..count {
            let meta = self.meta(class, index);
            meta.refcount.store(0, Ordering::Relaxed);
            meta.readers.store(0, Ordering::Relaxed);
            let next = if index + 1 < count { index + 1 } else { FREE_END };
            meta.next_free.store(next, Ordering::Relaxed);
        }
        self.class_head(class)
            .free_head
            .store(pack_head(0, 0), Ordering::Release);
    }

    /// Smallest class whose chunks fit `len` bytes.
    fn class_for(&self, len: usize) -> Result<usize, PoolError> {
        for class in 0..NUM_SIZE_CLASSES {
            if self.layout.chunk_size(class) >= len {
                return Ok(class);
            }
        }
        Err(PoolError::PayloadTooLarge {
            len,
            max: self.max_payload(),
        })
    }

    /// Largest payload this pool can hold.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.layout.chunk_size(NUM_SIZE_CLASSES - 1)
    }

    fn pop_free(&self, class: usize) -> Option<u32> {
        let head = &self.class_head(class).free_head;
        loop {
            let old = head.load(Ordering::Acquire);
            let (index, tag) = unpack_head(old);
            if index == FREE_END {
                return None;
            }
            let next = self.meta(class, index).next_free.load(Ordering::Acquire);
            let new = pack_head(next, tag.wrapping_add(1));
            if head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    fn push_free(&self, class: usize, index: u32) {
        let head = &self.class_head(class).free_head;
        loop {
            let old = head.load(Ordering::Acquire);
            let (old_index, tag) = unpack_head(old);
            self.meta(class, index)
                .next_free
                .store(old_index, Ordering::Release);
            let new = pack_head(index, tag.wrapping_add(1));
            if head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn try_acquire_inner(&self, len: usize, readers_mask: u32) -> Result<Option<ChunkId>, PoolError> {
        let start = self.class_for(len)?;
        for class in start..NUM_SIZE_CLASSES {
            if let Some(index) = self.pop_free(class) {
                let meta = self.meta(class, index);
                let refs = readers_mask.count_ones().max(1);
                meta.readers.store(readers_mask, Ordering::Relaxed);
                meta.refcount.store(refs, Ordering::Release);
                return Ok(Some(ChunkId::new(class, index)));
            }
        }
        Ok(None)
    }

    /// Take a chunk fitting `len` bytes without blocking.
    ///
    /// The chunk's refcount starts at `popcount(readers_mask)` (at least
    /// one); each addressed reader releases one reference.
    pub fn try_acquire(&self, len: usize, readers_mask: u32) -> Result<ChunkId, PoolError> {
        self.try_acquire_inner(len, readers_mask)?
            .ok_or(PoolError::Exhausted)
    }

    /// Take a chunk fitting `len` bytes, blocking on the pool waiter while
    /// every eligible class is empty. `timeout: None` waits indefinitely.
    pub fn acquire(
        &self,
        len: usize,
        readers_mask: u32,
        timeout: Option<Duration>,
    ) -> Result<ChunkId, PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(id) = self.try_acquire_inner(len, readers_mask)? {
                return Ok(id);
            }
            let start = self.class_for(len)?;
            let free_somewhere = || {
                (start..NUM_SIZE_CLASSES).any(|class| {
                    let (index, _) =
                        unpack_head(self.class_head(class).free_head.load(Ordering::Acquire));
                    index != FREE_END
                })
            };
            let outcome = match deadline {
                None => self.waiter.wait(free_somewhere)?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PoolError::TimedOut);
                    }
                    self.waiter.wait_for(free_somewhere, remaining)?
                }
            };
            if !outcome {
                return Err(PoolError::Shutdown);
            }
        }
    }

    /// Copy `bytes` into the chunk. Caller must have acquired `id` and not
    /// yet published it.
    pub fn write(&self, id: ChunkId, bytes: &[u8]) -> Result<(), PoolError> {
        self.validate_id(id)?;
        if bytes.len() > self.layout.chunk_size(id.class()) {
            return Err(PoolError::PayloadTooLarge {
                len: bytes.len(),
                max: self.layout.chunk_size(id.class()),
            });
        }
        // SAFETY: the chunk is exclusively owned between acquire and the
        // ring-slot commit that publishes it.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.chunk_ptr(id), bytes.len());
        }
        Ok(())
    }

    /// Resolve `id` to its payload bytes.
    ///
    /// The returned slice stays valid while the pool handle is alive; the
    /// chunk contents stay stable until the last addressed reader releases.
    pub fn fetch(&self, id: ChunkId, len: usize) -> Result<&[u8], PoolError> {
        self.validate_id(id)?;
        if len > self.layout.chunk_size(id.class()) {
            return Err(PoolError::InvalidChunk);
        }
        // SAFETY: bounds validated; published chunks are immutable until
        // released.
        Ok(unsafe { std::slice::from_raw_parts(self.chunk_ptr(id), len) })
    }

    /// Release the reference held by reader `bit`. The final release pushes
    /// the chunk back to its class freelist and wakes pool waiters.
    pub fn release_reader(&self, id: ChunkId, bit: u32) -> Result<(), PoolError> {
        self.validate_id(id)?;
        let meta = self.meta(id.class(), id.index());
        let old = meta.readers.fetch_and(!bit, Ordering::AcqRel);
        if old & bit != 0 {
            self.drop_ref(id);
        }
        Ok(())
    }

    /// Release one untracked reference (unicast path).
    pub fn release_untracked(&self, id: ChunkId) -> Result<(), PoolError> {
        self.validate_id(id)?;
        self.drop_ref(id);
        Ok(())
    }

    /// Release every reference still held by reader `bit` across the pool.
    ///
    /// Called from a receiver's disconnect path (and from dead-receiver
    /// reclaim on its behalf) so chunks addressed to it do not leak.
    /// Returns the number of references dropped.
    pub fn release_reader_all(&self, bit: u32) -> u32 {
        self.release_reader_all_except(bit, |_| false)
    }

    /// Like [`LargeMsgPool::release_reader_all`], skipping chunks for which
    /// `keep` returns true (chunks pinned by still-live receive buffers).
    pub fn release_reader_all_except(&self, bit: u32, keep: impl Fn(ChunkId) -> bool) -> u32 {
        let mut dropped = 0;
        for class in 0..NUM_SIZE_CLASSES {
            for index in 0..self.layout.chunk_count {
                let id = ChunkId::new(class, index);
                let meta = self.meta(class, index);
                if meta.readers.load(Ordering::Acquire) & bit == 0 || keep(id) {
                    continue;
                }
                let old = meta.readers.fetch_and(!bit, Ordering::AcqRel);
                if old & bit != 0 {
                    self.drop_ref(id);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(bit, dropped, "released pool references for departed reader");
        }
        dropped
    }

    /// Return a never-published chunk to its freelist (send error path).
    pub fn force_free(&self, id: ChunkId) -> Result<(), PoolError> {
        self.validate_id(id)?;
        let meta = self.meta(id.class(), id.index());
        meta.readers.store(0, Ordering::Relaxed);
        meta.refcount.store(0, Ordering::Release);
        self.push_free(id.class(), id.index());
        let _ = self.waiter.broadcast();
        Ok(())
    }

    fn drop_ref(&self, id: ChunkId) {
        let meta = self.meta(id.class(), id.index());
        if meta.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.push_free(id.class(), id.index());
            let _ = self.waiter.broadcast();
        }
    }

    fn validate_id(&self, id: ChunkId) -> Result<(), PoolError> {
        if id.class() >= NUM_SIZE_CLASSES || id.index() >= self.layout.chunk_count {
            return Err(PoolError::InvalidChunk);
        }
        Ok(())
    }

    /// Wake all pool waiters and make further blocking acquires return
    /// `Shutdown`.
    pub fn shutdown(&self) {
        let _ = self.waiter.quit_waiting();
    }

    /// Snapshot of per-class freelist occupancy.
    pub fn status(&self) -> PoolStatus {
        let mut classes = [SizeClassStatus::default(); NUM_SIZE_CLASSES];
        for (class, status) in classes.iter_mut().enumerate() {
            let head = self.class_head(class);
            status.chunk_size = head.chunk_size;
            status.total = head.chunk_count;
            // Walk the freelist, bounded in case of concurrent mutation.
            let (mut current, _) = unpack_head(head.free_head.load(Ordering::Acquire));
            let mut free = 0;
            while current != FREE_END && free <= status.total {
                free += 1;
                current = self.meta(class, current).next_free.load(Ordering::Acquire);
            }
            status.free = free.min(status.total);
        }
        PoolStatus { classes }
    }
}

fn validate_pool(shm: &ShmObject, layout: &PoolLayout, name: &str) -> Result<(), PoolError> {
    if shm.user_len() < layout.total {
        return Err(PoolError::Shm(ShmError::SizeMismatch {
            name: name.to_string(),
            expected: layout.total,
            actual: shm.user_len(),
        }));
    }
    // SAFETY: region holds an initialized PoolShared at offset 0.
    let shared = unsafe { &*(shm.user_ptr() as *const PoolShared) };
    for (class, head) in shared.classes.iter().enumerate() {
        if head.chunk_size as usize != layout.chunk_size(class)
            || head.chunk_count != layout.chunk_count
        {
            return Err(PoolError::Shm(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: layout.chunk_size(class),
                actual: head.chunk_size as usize,
            }));
        }
    }
    Ok(())
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

/// Occupancy of one size class.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeClassStatus {
    pub chunk_size: u32,
    pub total: u32,
    pub free: u32,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub classes: [SizeClassStatus; NUM_SIZE_CLASSES],
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool:")?;
        for class in &self.classes {
            write!(
                f,
                " {}B {}/{}",
                class.chunk_size, class.free, class.total
            )?;
        }
        Ok(())
    }
}
