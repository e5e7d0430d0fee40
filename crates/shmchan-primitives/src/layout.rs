//! Shared ring layout.
//!
//! This module defines the `repr(C)` structures that every process attached
//! to a channel maps. The layout inside a channel region is:
//!
//! ```text
//! +--------------------------------------------------------------------+
//! | RingHeader (2304 bytes)                                            |
//! |   head cursor          (own cache line)                            |
//! |   tail cursor          (own cache line, unicast consumers)         |
//! |   connected mask + sender count (own cache line)                   |
//! |   geometry: capacity, data_size, data_align, topology tag          |
//! |   receiver table: 32 x ReceiverEntry (64 bytes each)               |
//! +--------------------------------------------------------------------+
//! | SlotMeta array (capacity x 32 bytes)                               |
//! |   sequence word, reader mask, remaining tag, assembly id, segment  |
//! +--------------------------------------------------------------------+
//! | Slot data (capacity x data_size bytes, aligned to data_align)      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Cursors are 64-bit and never wrap in practice; slot indices are
//! `cursor & (capacity - 1)`. The per-slot sequence word doubles as commit
//! flag and lap epoch: slot `i` is free for the producer claiming position
//! `p` exactly when `seq == p`, committed for the consumer at position `c`
//! exactly when `seq == c + 1`, and retired (consumed or skipped) when
//! `seq == c + capacity`.

use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Maximum number of receivers per channel, fixed by the 32-bit mask.
pub const MAX_RECEIVERS: usize = 32;

/// Default ring capacity (power of two).
pub const DEFAULT_CAPACITY: u32 = 256;

// =============================================================================
// Ring Header
// =============================================================================

/// Per-receiver bookkeeping in the shared header (64 bytes).
///
/// The cursor is a mirror of the receiver's private broadcast cursor so a
/// cleaner can sweep on behalf of a dead receiver; the heartbeat fields feed
/// staleness detection.
#[repr(C, align(64))]
pub struct ReceiverEntry {
    /// Mirror of the receiver's private cursor (broadcast only).
    pub cursor: AtomicU64,
    /// Incremented on every pop attempt.
    pub heartbeat: AtomicU64,
    /// Monotonic-clock nanos of the last heartbeat.
    pub last_seen: AtomicU64,
    /// Process id of the receiver holding this entry.
    pub pid: AtomicU32,
    _pad: [u8; 36],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<ReceiverEntry>() == 64);

impl ReceiverEntry {
    fn init(&mut self) {
        self.cursor = AtomicU64::new(0);
        self.heartbeat = AtomicU64::new(0);
        self.last_seen = AtomicU64::new(0);
        self.pid = AtomicU32::new(0);
        self._pad = [0; 36];
    }

    /// Reset the entry for a new connection starting at `cursor`.
    pub fn reset(&self, cursor: u64, pid: u32, now_nanos: u64) {
        self.cursor.store(cursor, Ordering::Relaxed);
        self.heartbeat.store(0, Ordering::Relaxed);
        self.last_seen.store(now_nanos, Ordering::Relaxed);
        self.pid.store(pid, Ordering::Release);
    }
}

/// Ring header at the start of a channel region.
///
/// Hot cursors each occupy their own cache line; the geometry fields are
/// immutable after init and double as an attach-time compatibility check.
#[repr(C, align(64))]
pub struct RingHeader {
    /// Producer position. The next slot to claim.
    pub head: AtomicU64,
    _pad0: [u8; 56],

    /// Consumer position (competitive unicast only; broadcast receivers
    /// keep private cursors).
    pub tail: AtomicU64,
    _pad1: [u8; 56],

    /// Connected-receiver bitmask, one bit per receiver.
    pub connected: AtomicU32,
    /// Number of connected senders.
    pub sender_count: AtomicU32,
    _pad2: [u8; 56],

    /// Ring capacity (nonzero power of two, immutable after init).
    pub capacity: u32,
    /// Slot data size in bytes (immutable after init).
    pub data_size: u32,
    /// Slot data alignment in bytes (immutable after init).
    pub data_align: u32,
    /// Topology tag chosen by the front-end (immutable after init).
    pub topology: u32,
    _pad3: [u8; 48],

    /// Per-receiver bookkeeping, indexed by bit position.
    pub receivers: [ReceiverEntry; MAX_RECEIVERS],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<RingHeader>() == 256 + MAX_RECEIVERS * 64);

impl RingHeader {
    /// Initialize a new ring header.
    ///
    /// Must only run once, by the creating process, before any peer
    /// attaches.
    pub fn init(&mut self, capacity: u32, data_size: u32, data_align: u32, topology: u32) {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "capacity must be a nonzero power of two"
        );
        self.head = AtomicU64::new(0);
        self._pad0 = [0; 56];
        self.tail = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.connected = AtomicU32::new(0);
        self.sender_count = AtomicU32::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self.data_size = data_size;
        self.data_align = data_align;
        self.topology = topology;
        self._pad3 = [0; 48];
        for entry in &mut self.receivers {
            entry.init();
        }
    }

    /// Check the immutable geometry against what an attaching peer expects.
    pub fn validate(
        &self,
        capacity: u32,
        data_size: u32,
        data_align: u32,
        topology: u32,
    ) -> Result<(), LayoutError> {
        if !self.capacity.is_power_of_two() || self.capacity == 0 {
            return Err(LayoutError::InvalidConfig(
                "capacity must be a nonzero power of two",
            ));
        }
        if self.capacity != capacity
            || self.data_size != data_size
            || self.data_align != data_align
        {
            return Err(LayoutError::GeometryMismatch {
                expected: (capacity, data_size, data_align),
                found: (self.capacity, self.data_size, self.data_align),
            });
        }
        if self.topology != topology {
            return Err(LayoutError::TopologyMismatch {
                expected: topology,
                found: self.topology,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn index_mask(&self) -> u64 {
        self.capacity as u64 - 1
    }
}

// =============================================================================
// Slot Metadata
// =============================================================================

/// Per-slot metadata (32 bytes).
///
/// `seq` is the commit/epoch word described in the module docs. The
/// remaining fields are message framing written by the producer before the
/// committing `seq` store and read by consumers after the acquiring `seq`
/// load.
#[repr(C)]
pub struct SlotMeta {
    /// Commit/epoch sequence word.
    pub seq: AtomicU64,
    /// Broadcast reader mask; each addressed receiver clears its bit.
    pub mask: AtomicU32,
    /// Bytes remaining in the logical message from this slot on.
    pub remaining: AtomicU32,
    /// Assembly id shared by the segments of one logical message.
    pub msg_id: AtomicU64,
    /// Segment index within the assembly (0 = first).
    pub seg_index: AtomicU32,
    /// Bytes of payload stored in this slot's data area.
    pub len: AtomicU32,
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<SlotMeta>() == 32);

impl SlotMeta {
    /// Initialize slot `index` as free for the first lap.
    pub fn init(&mut self, index: u64) {
        self.seq = AtomicU64::new(index);
        self.mask = AtomicU32::new(0);
        self.remaining = AtomicU32::new(0);
        self.msg_id = AtomicU64::new(0);
        self.seg_index = AtomicU32::new(0);
        self.len = AtomicU32::new(0);
    }
}

// =============================================================================
// Offsets
// =============================================================================

/// Byte offsets of the ring parts within a channel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub header: usize,
    pub meta: usize,
    pub data: usize,
    pub total: usize,
    pub capacity: u32,
    pub data_size: u32,
}

impl RingLayout {
    /// Compute offsets for the given geometry (checked).
    pub fn calculate(
        capacity: u32,
        data_size: u32,
        data_align: u32,
    ) -> Result<Self, LayoutError> {
        if !capacity.is_power_of_two() || capacity == 0 {
            return Err(LayoutError::InvalidConfig(
                "capacity must be a nonzero power of two",
            ));
        }
        if data_size == 0 {
            return Err(LayoutError::InvalidConfig("data_size must be > 0"));
        }
        if !data_align.is_power_of_two() || data_align == 0 {
            return Err(LayoutError::InvalidConfig(
                "data_align must be a nonzero power of two",
            ));
        }

        let header = 0usize;
        let meta = header + core::mem::size_of::<RingHeader>();
        let meta_total = (capacity as usize)
            .checked_mul(core::mem::size_of::<SlotMeta>())
            .ok_or(LayoutError::SizeOverflow)?;
        // Data starts on a cache line regardless of the payload alignment.
        let data = align_up(
            meta.checked_add(meta_total).ok_or(LayoutError::SizeOverflow)?,
            (data_align as usize).max(64),
        );
        let data_total = (capacity as usize)
            .checked_mul(data_size as usize)
            .ok_or(LayoutError::SizeOverflow)?;
        let total = data.checked_add(data_total).ok_or(LayoutError::SizeOverflow)?;

        Ok(Self {
            header,
            meta,
            data,
            total,
            capacity,
            data_size,
        })
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

// =============================================================================
// Frames
// =============================================================================

/// Payload and framing pushed into one slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotFrame<'a> {
    /// Bytes remaining in the logical message from this slot on.
    pub remaining: u32,
    /// Assembly id (0 for single-slot messages).
    pub msg_id: u64,
    /// Segment index within the assembly (0 = first).
    pub seg_index: u32,
    /// Payload bytes; length must not exceed the ring's data size.
    pub bytes: &'a [u8],
}

/// Read-only view of one consumed slot, valid for the duration of the pop
/// closure.
#[derive(Debug, Clone, Copy)]
pub struct SlotView<'a> {
    pub remaining: u32,
    pub msg_id: u64,
    pub seg_index: u32,
    pub bytes: &'a [u8],
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    Full,
}

impl PushResult {
    #[inline]
    pub fn is_full(self) -> bool {
        matches!(self, PushResult::Full)
    }
}

/// Result of a successful pop.
#[derive(Debug, Clone, Copy)]
pub struct Popped<T> {
    /// Value returned by the pop closure.
    pub value: T,
    /// True if this pop released the slot for reuse (last broadcast reader,
    /// or any unicast pop). The caller should wake space waiters.
    pub freed: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Geometry in the mapped header disagrees with the attach request.
    GeometryMismatch {
        expected: (u32, u32, u32),
        found: (u32, u32, u32),
    },
    /// Topology tag in the mapped header disagrees with the attach request.
    TopologyMismatch { expected: u32, found: u32 },
    /// Invalid configuration value.
    InvalidConfig(&'static str),
    /// Offset arithmetic overflowed.
    SizeOverflow,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::GeometryMismatch { expected, found } => write!(
                f,
                "ring geometry mismatch: expected {}x{}@{}, found {}x{}@{}",
                expected.0, expected.1, expected.2, found.0, found.1, found.2
            ),
            Self::TopologyMismatch { expected, found } => write!(
                f,
                "ring topology mismatch: expected tag {expected}, found {found}"
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid ring config: {msg}"),
            Self::SizeOverflow => write!(f, "ring size overflow"),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for LayoutError {}

// =============================================================================
// Ring view
// =============================================================================

use crate::region::Region;

/// A view of one ring (header + slot meta + slot data) inside a region.
///
/// Shared by the engine types; holds only the region and precomputed
/// offsets.
#[derive(Clone, Copy)]
pub struct Ring {
    region: Region,
    layout: RingLayout,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Initialize a fresh ring in `region` at the given layout and return a
    /// view of it.
    ///
    /// # Safety
    ///
    /// The region must be writable, large enough for `layout.total`, and
    /// exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        layout: RingLayout,
        data_align: u32,
        topology: u32,
    ) -> Self {
        assert!(layout.total <= region.len(), "region too small for ring");
        let header = unsafe { region.get_mut::<RingHeader>(layout.header) };
        header.init(layout.capacity, layout.data_size, data_align, topology);
        for i in 0..layout.capacity {
            let meta = unsafe {
                region.get_mut::<SlotMeta>(
                    layout.meta + i as usize * core::mem::size_of::<SlotMeta>(),
                )
            };
            meta.init(i as u64);
        }
        Self { region, layout }
    }

    /// Attach to an already-initialized ring.
    ///
    /// # Safety
    ///
    /// The region must contain a valid ring at `layout`, initialized by a
    /// prior call to [`Ring::init`] with the same geometry.
    pub unsafe fn attach(
        region: Region,
        layout: RingLayout,
        data_align: u32,
        topology: u32,
    ) -> Result<Self, LayoutError> {
        if layout.total > region.len() {
            return Err(LayoutError::InvalidConfig("region too small for ring"));
        }
        let ring = Self { region, layout };
        ring.header()
            .validate(layout.capacity, layout.data_size, data_align, topology)?;
        Ok(ring)
    }

    #[inline]
    pub fn header(&self) -> &RingHeader {
        // SAFETY: layout validated at construction.
        unsafe { self.region.get::<RingHeader>(self.layout.header) }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.layout.capacity as u64
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.layout.data_size as usize
    }

    #[inline]
    pub(crate) fn meta(&self, position: u64) -> &SlotMeta {
        let index = (position & self.header().index_mask()) as usize;
        // SAFETY: index < capacity by masking; layout validated.
        unsafe {
            self.region
                .get::<SlotMeta>(self.layout.meta + index * core::mem::size_of::<SlotMeta>())
        }
    }

    #[inline]
    pub(crate) fn data_ptr(&self, position: u64) -> *mut u8 {
        let index = (position & self.header().index_mask()) as usize;
        self.region.offset(self.layout.data + index * self.data_size())
    }

    /// Write a frame into the slot at `position`.
    ///
    /// Caller must own the slot per the claim protocol.
    pub(crate) fn write_frame(&self, position: u64, frame: &SlotFrame<'_>) {
        assert!(
            frame.bytes.len() <= self.data_size(),
            "slot payload exceeds data size"
        );
        let meta = self.meta(position);
        meta.remaining.store(frame.remaining, Ordering::Relaxed);
        meta.msg_id.store(frame.msg_id, Ordering::Relaxed);
        meta.seg_index.store(frame.seg_index, Ordering::Relaxed);
        meta.len.store(frame.bytes.len() as u32, Ordering::Relaxed);
        // SAFETY: the claim protocol gives us exclusive write access to the
        // slot data until the committing seq store.
        unsafe {
            core::ptr::copy_nonoverlapping(
                frame.bytes.as_ptr(),
                self.data_ptr(position),
                frame.bytes.len(),
            );
        }
    }

    /// Read the slot at `position` through `f`.
    ///
    /// Caller must hold read access per the claim protocol (committed slot,
    /// before the releasing seq bump).
    pub(crate) fn read_frame<T>(&self, position: u64, f: impl FnOnce(SlotView<'_>) -> T) -> T {
        let meta = self.meta(position);
        let len = meta.len.load(Ordering::Relaxed) as usize;
        let len = len.min(self.data_size());
        // SAFETY: committed slots are immutable until every claimed reader
        // releases them.
        let bytes = unsafe { core::slice::from_raw_parts(self.data_ptr(position), len) };
        f(SlotView {
            remaining: meta.remaining.load(Ordering::Relaxed),
            msg_id: meta.msg_id.load(Ordering::Relaxed),
            seg_index: meta.seg_index.load(Ordering::Relaxed),
            bytes,
        })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(core::mem::size_of::<RingHeader>(), 2304);
    }

    #[test]
    fn test_slot_meta_size() {
        assert_eq!(core::mem::size_of::<SlotMeta>(), 32);
    }

    #[test]
    fn test_layout_offsets() {
        let layout = RingLayout::calculate(256, 64, 16).unwrap();
        assert_eq!(layout.header, 0);
        assert_eq!(layout.meta, 2304);
        // 256 slots * 32 bytes of meta = 8192, already 64-aligned.
        assert_eq!(layout.data, 2304 + 8192);
        assert_eq!(layout.total, 2304 + 8192 + 256 * 64);
    }

    #[test]
    fn test_layout_rejects_bad_capacity() {
        assert!(matches!(
            RingLayout::calculate(100, 64, 16),
            Err(LayoutError::InvalidConfig(_))
        ));
        assert!(matches!(
            RingLayout::calculate(0, 64, 16),
            Err(LayoutError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_geometry_validation() {
        let mut header: RingHeader = unsafe { core::mem::zeroed() };
        header.init(256, 64, 16, 3);
        assert!(header.validate(256, 64, 16, 3).is_ok());
        assert!(matches!(
            header.validate(256, 128, 16, 3),
            Err(LayoutError::GeometryMismatch { .. })
        ));
        assert!(matches!(
            header.validate(256, 64, 16, 4),
            Err(LayoutError::TopologyMismatch { .. })
        ));
    }
}
