//! Variable-size message transport.
//!
//! `Sender` and `Receiver` move arbitrary byte payloads over a fixed-slot
//! [`Queue`] plus a [`LargeMsgPool`]. Three encodings, chosen by size:
//!
//! - **inline** (`len <= inline_size`): one slot, remaining tag = len;
//! - **segmented** (`inline_size < len <= large_limit`, only when the
//!   band is non-empty): consecutive inline-sized segments sharing an
//!   assembly id, remaining tag counting down, final segment recognized
//!   by `remaining <= inline_size`;
//! - **large** (`len > large_limit`): the payload goes into a pool chunk
//!   and the slot carries the chunk id; the chunk's refcount starts at
//!   the number of addressed readers.
//!
//! Receivers keep a per-handle reassembly cache keyed by assembly id. A
//! segment with an unknown id that is not an assembly start is discarded:
//! that receiver joined mid-message and skips to the next assembly.
//!
//! The segmented band exists for single-consumer and broadcast channels,
//! where one receiver observes a whole train. On competitive unicast the
//! slots of one train would race between consumers, so connecting a
//! competitive-unicast channel with `large_limit > inline_size` is
//! rejected at configuration time; oversized payloads take the pool path
//! there.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shmchan_primitives::SlotFrame;

use crate::config::ChannelConfig;
use crate::error::{RecvError, SendError};
use crate::pool::{ChunkId, LargeMsgPool, PoolStatus};
use crate::queue::{Queue, QueueStatus, Topology, object_name};

/// Upper bound on simultaneously open reassembly buffers per receiver.
const MAX_ASSEMBLIES: usize = 64;

fn pool_name(prefix: &str, topology: Topology, config: &ChannelConfig) -> String {
    object_name(prefix, topology, "pool", config.large_align, config.large_cache)
}

/// Remove every object name backing this channel (ring and pool).
///
/// Existing mappings stay valid until detached; for administrative
/// cleanup after crashes. Idempotent.
pub fn clear_storage(
    prefix: &str,
    topology: Topology,
    config: &ChannelConfig,
) -> Result<(), crate::error::ShmError> {
    Queue::clear_storage(prefix, topology, config).map_err(|e| match e {
        crate::error::QueueError::Shm(e) => e,
        other => crate::error::ShmError::Unavailable {
            name: prefix.to_string(),
            source: std::io::Error::other(other.to_string()),
        },
    })?;
    crate::shm::ShmObject::clear_storage(&pool_name(prefix, topology, config))
}

// =============================================================================
// Sender
// =============================================================================

/// Assembly ids carry the pid in the upper half and a process-wide
/// counter in the lower half, so no two senders ever reuse an id; zero is
/// reserved for "no assembly".
fn next_assembly_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    ((std::process::id() as u64) << 32) | (COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF)
}

/// Sending endpoint of a channel.
pub struct Sender {
    queue: Queue,
    pool: Arc<LargeMsgPool>,
}

impl Sender {
    /// Connect to (creating if absent) the named channel as a sender.
    pub fn connect(
        prefix: &str,
        topology: Topology,
        config: ChannelConfig,
    ) -> Result<Self, SendError> {
        let queue = Queue::connect_sender(prefix, topology, config.clone())?;
        let pool = Arc::new(LargeMsgPool::open(&pool_name(prefix, topology, &config), &config)?);
        Ok(Self { queue, pool })
    }

    /// Send one payload. `timeout: None` blocks until space is available.
    pub fn send(&mut self, payload: &[u8], timeout: Option<Duration>) -> Result<(), SendError> {
        if payload.is_empty() {
            return Err(SendError::EmptyPayload);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let config = self.queue.config();
        let len = payload.len();

        if len <= config.inline_size as usize {
            let frame = SlotFrame {
                remaining: len as u32,
                msg_id: 0,
                seg_index: 0,
                bytes: payload,
            };
            return self.push_frame(&frame, None, deadline);
        }

        if config.segmented_enabled() && len <= config.large_limit as usize {
            return self.send_segmented(payload, deadline);
        }

        self.send_large(payload, deadline)
    }

    /// Send without blocking.
    pub fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        self.send(payload, Some(Duration::ZERO))
    }

    fn send_segmented(
        &mut self,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), SendError> {
        let inline = self.queue.config().inline_size as usize;
        let msg_id = next_assembly_id();

        let mut offset = 0usize;
        let mut seg_index = 0u32;
        while offset < payload.len() {
            let chunk = inline.min(payload.len() - offset);
            let frame = SlotFrame {
                remaining: (payload.len() - offset) as u32,
                msg_id,
                seg_index,
                bytes: &payload[offset..offset + chunk],
            };
            self.push_frame(&frame, None, deadline)?;
            offset += chunk;
            seg_index += 1;
        }
        Ok(())
    }

    fn send_large(&mut self, payload: &[u8], deadline: Option<Instant>) -> Result<(), SendError> {
        let broadcast = self.queue.topology().is_broadcast();
        let readers = if broadcast {
            let mask = self.queue.connected_mask();
            if mask == 0 {
                // Nobody to address; the ring would retire the slot anyway.
                return Ok(());
            }
            mask
        } else {
            0
        };

        let id = match self.pool.try_acquire(payload.len(), readers) {
            Ok(id) => id,
            Err(crate::error::PoolError::Exhausted) => {
                // Chunks may be pinned by dead receivers; reclaim, then
                // wait out the remaining budget.
                self.reclaim_dead();
                let timeout = match deadline {
                    None => None,
                    Some(d) => Some(remaining_send(d)?),
                };
                self.pool.acquire(payload.len(), readers, timeout)?
            }
            Err(e) => return Err(e.into()),
        };

        self.pool.write(id, payload)?;

        let id_bytes = id.raw().to_le_bytes();
        let frame = SlotFrame {
            remaining: payload.len() as u32,
            msg_id: 0,
            seg_index: 0,
            bytes: &id_bytes,
        };
        let mask_override = broadcast.then_some(readers);
        match self.push_frame(&frame, mask_override, deadline) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The slot never published; take the chunk back.
                let _ = self.pool.force_free(id);
                Err(e)
            }
        }
    }

    fn push_frame(
        &self,
        frame: &SlotFrame<'_>,
        mask_override: Option<u32>,
        deadline: Option<Instant>,
    ) -> Result<(), SendError> {
        // A zero remaining budget still makes one non-blocking attempt
        // inside the queue before reporting the timeout.
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.queue.push(frame, mask_override, timeout)?;
        Ok(())
    }

    /// Force-disconnect dead receivers and release their pool references.
    pub fn reclaim_dead(&self) -> u32 {
        let reclaimed = self.queue.reclaim_dead_receivers();
        let mut bits = reclaimed;
        while bits != 0 {
            let bit = bits & bits.wrapping_neg();
            self.pool.release_reader_all(bit);
            bits &= !bit;
        }
        reclaimed
    }

    /// Wait until at least `count` receivers are connected.
    pub fn wait_for_receivers(
        &self,
        count: u32,
        timeout: Option<Duration>,
    ) -> Result<(), SendError> {
        self.queue.wait_for_receivers(count, timeout)?;
        Ok(())
    }

    /// Number of connected receivers.
    pub fn receiver_count(&self) -> u32 {
        self.queue.receiver_count()
    }

    /// Wake every blocked peer; they return `Shutdown`.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.pool.shutdown();
    }

    /// Ring snapshot.
    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Pool snapshot.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }
}

fn remaining_send(deadline: Instant) -> Result<Duration, SendError> {
    let rem = deadline.saturating_duration_since(Instant::now());
    if rem.is_zero() {
        Err(SendError::TimedOut)
    } else {
        Ok(rem)
    }
}

// =============================================================================
// Receiver
// =============================================================================

struct RawFrame {
    remaining: u32,
    msg_id: u64,
    seg_index: u32,
    bytes: Vec<u8>,
}

/// Receiving endpoint of a channel.
///
/// Not meant to be shared across threads: the reassembly cache is
/// per-handle. Give each receiving thread its own `Receiver`.
pub struct Receiver {
    queue: Queue,
    pool: Arc<LargeMsgPool>,
    assemblies: HashMap<u64, Vec<u8>>,
    /// Assembly ids in insertion order; the cache bound evicts the oldest
    /// open assembly first. Ids of completed assemblies are skipped
    /// lazily when they reach the front.
    assembly_order: VecDeque<u64>,
    /// Chunk ids referenced by still-live [`RecvBuffer`]s (broadcast only);
    /// the disconnect sweep must not release these.
    outstanding: Arc<Mutex<HashSet<u64>>>,
    disconnected: bool,
}

impl Receiver {
    /// Connect to (creating if absent) the named channel as a receiver.
    pub fn connect(
        prefix: &str,
        topology: Topology,
        config: ChannelConfig,
    ) -> Result<Self, RecvError> {
        let queue = Queue::connect_receiver(prefix, topology, config.clone())?;
        let pool = Arc::new(
            LargeMsgPool::open(&pool_name(prefix, topology, &config), &config)
                .map_err(RecvError::Pool)?,
        );
        Ok(Self {
            queue,
            pool,
            assemblies: HashMap::new(),
            assembly_order: VecDeque::new(),
            outstanding: Arc::new(Mutex::new(HashSet::new())),
            disconnected: false,
        })
    }

    /// Receive the next payload. `timeout: None` blocks until a message
    /// arrives.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<RecvBuffer, RecvError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // A zero remaining budget still makes one non-blocking attempt
            // inside the queue before reporting the timeout.
            let queue_timeout =
                deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let raw = self.queue.pop(queue_timeout, |view| RawFrame {
                remaining: view.remaining,
                msg_id: view.msg_id,
                seg_index: view.seg_index,
                bytes: view.bytes.to_vec(),
            })?;

            if raw.msg_id != 0 {
                if let Some(done) = self.accept_segment(raw) {
                    return Ok(RecvBuffer::inline(done));
                }
                continue;
            }

            let config = self.queue.config();
            if raw.remaining as usize <= config.large_limit as usize {
                return Ok(RecvBuffer::inline(raw.bytes));
            }
            return self.fetch_large(raw);
        }
    }

    /// Receive without blocking.
    pub fn try_recv(&mut self) -> Result<RecvBuffer, RecvError> {
        self.recv(Some(Duration::ZERO))
    }

    /// Fold one segment into the reassembly cache; returns the complete
    /// payload when this was the final segment.
    fn accept_segment(&mut self, raw: RawFrame) -> Option<Vec<u8>> {
        let inline = self.queue.config().inline_size;
        let is_final = raw.remaining <= inline;

        if raw.seg_index == 0 {
            if self.assemblies.len() >= MAX_ASSEMBLIES {
                self.evict_oldest_assembly();
            }
            let mut buf = Vec::with_capacity(raw.remaining as usize);
            buf.extend_from_slice(&raw.bytes);
            if is_final {
                // Single-segment assembly.
                return Some(buf);
            }
            if self.assemblies.insert(raw.msg_id, buf).is_none() {
                self.assembly_order.push_back(raw.msg_id);
            }
            return None;
        }

        match self.assemblies.get_mut(&raw.msg_id) {
            Some(buf) => {
                buf.extend_from_slice(&raw.bytes);
                if is_final {
                    return self.take_assembly(raw.msg_id);
                }
                None
            }
            None => {
                // Missed the start of this assembly (late join); discard
                // until a new one begins.
                None
            }
        }
    }

    /// Remove a completed assembly from the cache and its order queue.
    fn take_assembly(&mut self, msg_id: u64) -> Option<Vec<u8>> {
        if let Some(pos) = self.assembly_order.iter().position(|&id| id == msg_id) {
            self.assembly_order.remove(pos);
        }
        self.assemblies.remove(&msg_id)
    }

    /// Drop the oldest still-open assembly.
    fn evict_oldest_assembly(&mut self) {
        while let Some(stale) = self.assembly_order.pop_front() {
            if self.assemblies.remove(&stale).is_some() {
                tracing::warn!(stale, "evicted oldest reassembly buffer");
                return;
            }
        }
    }

    fn fetch_large(&mut self, raw: RawFrame) -> Result<RecvBuffer, RecvError> {
        let mut id_bytes = [0u8; 8];
        if raw.bytes.len() < 8 {
            return Err(RecvError::Pool(crate::error::PoolError::InvalidChunk));
        }
        id_bytes.copy_from_slice(&raw.bytes[..8]);
        let id = ChunkId::from_raw(u64::from_le_bytes(id_bytes));
        let len = raw.remaining as usize;

        // Validate before building the guard.
        self.pool.fetch(id, len).map_err(RecvError::Pool)?;

        let reader_bit = if self.queue.topology().is_broadcast() {
            let bit = self.queue.receiver_bit();
            self.outstanding
                .lock()
                .expect("outstanding set poisoned")
                .insert(id.raw());
            Some(bit)
        } else {
            None
        };

        Ok(RecvBuffer::pooled(
            self.pool.clone(),
            id,
            len,
            reader_bit,
            self.outstanding.clone(),
        ))
    }

    /// Number of connected receivers on the channel.
    pub fn receiver_count(&self) -> u32 {
        self.queue.receiver_count()
    }

    /// Wake every blocked peer; they return `Shutdown`.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.pool.shutdown();
    }

    /// Disconnect from the channel: sweep our bit out of outstanding ring
    /// slots and release pool references for messages we never consumed.
    /// Called automatically on drop.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.assemblies.clear();
        self.assembly_order.clear();

        let broadcast = self.queue.topology().is_broadcast();
        let bit = if broadcast {
            Some(self.queue.receiver_bit())
        } else {
            None
        };
        self.queue.disconnect();

        if let Some(bit) = bit {
            // Release refs for unconsumed chunks, but leave chunks pinned
            // by still-live RecvBuffers to their guards.
            let held = self
                .outstanding
                .lock()
                .expect("outstanding set poisoned")
                .clone();
            self.pool
                .release_reader_all_except(bit, |id| held.contains(&id.raw()));
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// =============================================================================
// Received buffers
// =============================================================================

/// An owned view of one received payload.
///
/// Inline and segmented messages own a process-local buffer; large
/// messages borrow their pool chunk and release its refcount on drop.
pub struct RecvBuffer {
    inner: BufferInner,
}

enum BufferInner {
    Inline(Vec<u8>),
    Pooled(PoolGuard),
}

struct PoolGuard {
    pool: Arc<LargeMsgPool>,
    id: ChunkId,
    len: usize,
    reader_bit: Option<u32>,
    outstanding: Arc<Mutex<HashSet<u64>>>,
}

impl RecvBuffer {
    fn inline(bytes: Vec<u8>) -> Self {
        Self {
            inner: BufferInner::Inline(bytes),
        }
    }

    fn pooled(
        pool: Arc<LargeMsgPool>,
        id: ChunkId,
        len: usize,
        reader_bit: Option<u32>,
        outstanding: Arc<Mutex<HashSet<u64>>>,
    ) -> Self {
        Self {
            inner: BufferInner::Pooled(PoolGuard {
                pool,
                id,
                len,
                reader_bit,
                outstanding,
            }),
        }
    }

    /// Payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.inner {
            BufferInner::Inline(bytes) => bytes,
            BufferInner::Pooled(guard) => guard
                .pool
                .fetch(guard.id, guard.len)
                .unwrap_or(&[]),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match &self.inner {
            BufferInner::Inline(bytes) => bytes.len(),
            BufferInner::Pooled(guard) => guard.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the payload into a standalone vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl std::ops::Deref for RecvBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for RecvBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for RecvBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            BufferInner::Inline(_) => "inline",
            BufferInner::Pooled(_) => "pooled",
        };
        f.debug_struct("RecvBuffer")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        match self.reader_bit {
            Some(bit) => {
                self.outstanding
                    .lock()
                    .expect("outstanding set poisoned")
                    .remove(&self.id.raw());
                let _ = self.pool.release_reader(self.id, bit);
            }
            None => {
                let _ = self.pool.release_untracked(self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_prefix(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "transporttest.{}.{}.{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn config() -> ChannelConfig {
        ChannelConfig {
            slot_count: 16,
            spin_budget: 16,
            large_cache: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_inline_roundtrip() {
        let prefix = unique_prefix("inline");
        let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, config()).unwrap();
        let mut rx = Receiver::connect(&prefix, Topology::SpscUnicast, config()).unwrap();

        for len in [1usize, 7, 63, 64] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            tx.send(&payload, Some(Duration::from_secs(1))).unwrap();
            let got = rx.recv(Some(Duration::from_secs(1))).unwrap();
            assert_eq!(&*got, &payload[..], "len {len}");
        }
    }

    #[test]
    fn test_empty_payload_rejected() {
        let prefix = unique_prefix("empty");
        let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, config()).unwrap();
        assert!(matches!(tx.try_send(b""), Err(SendError::EmptyPayload)));
    }

    #[test]
    fn test_boundary_inline_vs_large() {
        let prefix = unique_prefix("boundary");
        let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, config()).unwrap();
        let mut rx = Receiver::connect(&prefix, Topology::SpscUnicast, config()).unwrap();
        let idle = tx.pool_status().classes[0].free;

        // Exactly inline_size: inline path, pool untouched while held.
        tx.send(&[7u8; 64], Some(Duration::from_secs(1))).unwrap();
        let held = rx.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(tx.pool_status().classes[0].free, idle);
        assert_eq!(held.len(), 64);
        drop(held);

        // One byte over: large path (the default segmented band is empty),
        // pool chunk held until the buffer drops.
        tx.send(&[8u8; 65], Some(Duration::from_secs(1))).unwrap();
        let held = rx.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(held.len(), 65);
        assert_eq!(tx.pool_status().classes[0].free, idle - 1);
        drop(held);
        assert_eq!(tx.pool_status().classes[0].free, idle);
    }

    #[test]
    fn test_large_roundtrip_100k() {
        let prefix = unique_prefix("large");
        let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, config()).unwrap();
        let mut rx = Receiver::connect(&prefix, Topology::SpscUnicast, config()).unwrap();

        let payload: Vec<u8> = (0..100 * 1024).map(|i| (i * 31 % 251) as u8).collect();
        tx.send(&payload, Some(Duration::from_secs(1))).unwrap();
        let got = rx.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&*got, &payload[..]);
    }

    #[test]
    fn test_segmented_reassembly() {
        let prefix = unique_prefix("segmented");
        let config = ChannelConfig {
            large_limit: 256,
            ..config()
        };
        let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, config.clone()).unwrap();
        let mut rx = Receiver::connect(&prefix, Topology::SpscUnicast, config).unwrap();
        let idle = tx.pool_status().classes[0].free;

        // 200 bytes split into segments of 64, 64, 64, 8.
        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        tx.send(&payload, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(tx.queue_status().head, 4);

        let got = rx.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&*got, &payload[..]);
        // The segmented path never touches the pool.
        assert_eq!(tx.pool_status().classes[0].free, idle);
    }

    #[test]
    fn test_reassembly_cache_evicts_oldest_first() {
        let prefix = unique_prefix("evict");
        let config = ChannelConfig {
            large_limit: 256,
            ..config()
        };
        let mut rx = Receiver::connect(&prefix, Topology::SpscUnicast, config).unwrap();

        // Open one more assembly than the cache holds.
        for id in 1..=(MAX_ASSEMBLIES as u64 + 1) {
            let done = rx.accept_segment(RawFrame {
                remaining: 100,
                msg_id: id,
                seg_index: 0,
                bytes: vec![id as u8; 64],
            });
            assert!(done.is_none());
        }
        assert_eq!(rx.assemblies.len(), MAX_ASSEMBLIES);
        assert!(!rx.assemblies.contains_key(&1), "oldest assembly evicted");
        assert!(rx.assemblies.contains_key(&2), "younger assemblies survive");

        // A surviving assembly still completes normally.
        let done = rx.accept_segment(RawFrame {
            remaining: 36,
            msg_id: 2,
            seg_index: 1,
            bytes: vec![0xEE; 36],
        });
        let buf = done.unwrap();
        assert_eq!(&buf[..64], &[2u8; 64][..]);
        assert_eq!(&buf[64..], &[0xEE; 36][..]);
        assert!(!rx.assemblies.contains_key(&2));
    }

    #[test]
    fn test_broadcast_fanout_and_late_join() {
        let prefix = unique_prefix("fanout");
        let mut tx = Sender::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();

        // A and B published before anyone connects are dropped.
        tx.send(b"A", Some(Duration::from_secs(1))).unwrap();
        tx.send(b"B", Some(Duration::from_secs(1))).unwrap();

        let mut r1 = Receiver::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        tx.send(b"C", Some(Duration::from_secs(1))).unwrap();
        tx.send(b"D", Some(Duration::from_secs(1))).unwrap();

        let mut r2 = Receiver::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        tx.send(b"E", Some(Duration::from_secs(1))).unwrap();

        for expected in [b"C", b"D", b"E"] {
            let got = r1.recv(Some(Duration::from_secs(1))).unwrap();
            assert_eq!(&*got, &expected[..]);
        }
        let got = r2.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&*got, b"E");
        assert!(matches!(r2.try_recv(), Err(RecvError::TimedOut)));
    }

    #[test]
    fn test_broadcast_large_refcount() {
        let prefix = unique_prefix("bclarge");
        let mut tx = Sender::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        let mut r1 = Receiver::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        let mut r2 = Receiver::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        let idle = tx.pool_status().classes[0].free;

        let payload = vec![42u8; 300];
        tx.send(&payload, Some(Duration::from_secs(1))).unwrap();

        let b1 = r1.recv(Some(Duration::from_secs(1))).unwrap();
        let b2 = r2.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&*b1, &payload[..]);
        assert_eq!(&*b2, &payload[..]);

        // Chunk returns only after both readers drop their buffers.
        drop(b1);
        assert_eq!(tx.pool_status().classes[0].free, idle - 1);
        drop(b2);
        assert_eq!(tx.pool_status().classes[0].free, idle);
    }

    #[test]
    fn test_receiver_disconnect_releases_unconsumed_chunks() {
        let prefix = unique_prefix("discrel");
        let mut tx = Sender::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        let r1 = Receiver::connect(&prefix, Topology::SpmcBroadcast, config()).unwrap();
        let idle = tx.pool_status().classes[0].free;

        tx.send(&vec![1u8; 200], Some(Duration::from_secs(1))).unwrap();
        tx.send(&vec![2u8; 200], Some(Duration::from_secs(1))).unwrap();
        assert_eq!(tx.pool_status().classes[0].free, idle - 2);

        // r1 never consumed either message; disconnect returns the chunks.
        drop(r1);
        assert_eq!(tx.pool_status().classes[0].free, idle);
    }
}
