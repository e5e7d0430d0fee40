//! Typed queue front-end.
//!
//! A `Queue` binds one ring engine to a ring layout inside a named
//! shared-memory object and adds connection management on top: sender
//! counting, receiver bit allocation in the 32-bit connection mask,
//! heartbeats, dead-receiver reclaim, and the spin-then-block discipline
//! around the lock-free fast path.
//!
//! The channel region holds three waiters ahead of the ring: "data" (for
//! consumers parked on an empty ring), "space" (for producers parked on a
//! full ring), and "conn" (for senders awaiting receivers).

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use shmchan_primitives::{
    MpmcBroadcastRing, MpmcUnicastRing, Popped, PushResult, Region, Ring, RingLayout, SlotFrame,
    SlotView, SpmcBroadcastRing, SpmcUnicastRing, SpscRing,
};

use crate::config::ChannelConfig;
use crate::error::QueueError;
use crate::shm::{ShmObject, ShmOpenMode};
use crate::waiter::{Waiter, WaiterCell};

// =============================================================================
// Topology
// =============================================================================

/// Producer/consumer topology of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// One sender, one receiver, strict FIFO.
    SpscUnicast,
    /// One sender; receivers compete, each message consumed once.
    SpmcUnicast,
    /// Competing senders and competing receivers.
    MpmcUnicast,
    /// One sender; every connected receiver observes every message.
    SpmcBroadcast,
    /// Competing senders; every connected receiver observes every message.
    MpmcBroadcast,
}

impl Topology {
    /// Tag used in object names.
    pub fn tag(self) -> &'static str {
        match self {
            Self::SpscUnicast => "spsc",
            Self::SpmcUnicast => "spmc_uni",
            Self::MpmcUnicast => "mpmc_uni",
            Self::SpmcBroadcast => "spmc_bc",
            Self::MpmcBroadcast => "mpmc_bc",
        }
    }

    /// Tag stored in the ring header for attach validation.
    pub fn tag_u32(self) -> u32 {
        match self {
            Self::SpscUnicast => 1,
            Self::SpmcUnicast => 2,
            Self::MpmcUnicast => 3,
            Self::SpmcBroadcast => 4,
            Self::MpmcBroadcast => 5,
        }
    }

    /// True when every receiver observes every message.
    pub fn is_broadcast(self) -> bool {
        matches!(self, Self::SpmcBroadcast | Self::MpmcBroadcast)
    }

    /// True when more than one sender may connect.
    pub fn multi_producer(self) -> bool {
        matches!(self, Self::MpmcUnicast | Self::MpmcBroadcast)
    }

    /// True when independent receivers compete for messages.
    pub fn competitive_unicast(self) -> bool {
        matches!(self, Self::SpmcUnicast | Self::MpmcUnicast)
    }
}

/// Role of one queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

// =============================================================================
// Region layout
// =============================================================================

#[repr(C)]
struct QueueShared {
    data: WaiterCell,
    space: WaiterCell,
    conn: WaiterCell,
}

#[inline]
fn ring_offset() -> usize {
    align_up(core::mem::size_of::<QueueShared>(), 64)
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

/// Compose the object name for one part of a channel.
///
/// Channels differing in slot geometry land in disjoint objects, so a
/// stale peer with different constants cannot attach by accident.
pub fn object_name(prefix: &str, topology: Topology, kind: &str, a: u32, b: u32) -> String {
    format!("{prefix}__{}__{kind}__{a}__{b}", topology.tag())
}

// =============================================================================
// Engine dispatch
// =============================================================================

enum Engine {
    Spsc(SpscRing),
    SpmcUni(SpmcUnicastRing),
    MpmcUni(MpmcUnicastRing),
    SpmcBcast(SpmcBroadcastRing),
    MpmcBcast(MpmcBroadcastRing),
}

impl Engine {
    fn new(topology: Topology, ring: Ring) -> Self {
        match topology {
            Topology::SpscUnicast => Self::Spsc(SpscRing::new(ring)),
            Topology::SpmcUnicast => Self::SpmcUni(SpmcUnicastRing::new(ring)),
            Topology::MpmcUnicast => Self::MpmcUni(MpmcUnicastRing::new(ring)),
            Topology::SpmcBroadcast => Self::SpmcBcast(SpmcBroadcastRing::new(ring)),
            Topology::MpmcBroadcast => Self::MpmcBcast(MpmcBroadcastRing::new(ring)),
        }
    }

    fn ring(&self) -> &Ring {
        match self {
            Self::Spsc(r) => r.ring(),
            Self::SpmcUni(r) => r.ring(),
            Self::MpmcUni(r) => r.ring(),
            Self::SpmcBcast(r) => r.ring(),
            Self::MpmcBcast(r) => r.ring(),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// One endpoint of a shared-memory channel.
///
/// A handle is either a sender or a receiver, never both. Handles are not
/// meant to be shared across threads for receiving; give each receiving
/// thread its own handle.
pub struct Queue {
    shm: ShmObject,
    engine: Engine,
    topology: Topology,
    config: ChannelConfig,
    role: Role,
    /// Receiver bit position in the connection mask.
    bit_index: u32,
    /// Private broadcast cursor.
    cursor: u64,
    data_waiter: Waiter,
    space_waiter: Waiter,
    conn_waiter: Waiter,
    disconnected: bool,
}

impl Queue {
    /// Connect as a sender.
    pub fn connect_sender(
        prefix: &str,
        topology: Topology,
        config: ChannelConfig,
    ) -> Result<Self, QueueError> {
        let mut queue = Self::open(prefix, topology, config)?;
        queue.role = Role::Sender;

        let header = queue.engine.ring().header();
        let prev = header.sender_count.fetch_add(1, Ordering::AcqRel);
        if prev > 0 && !topology.multi_producer() {
            header.sender_count.fetch_sub(1, Ordering::AcqRel);
            queue.disconnected = true;
            return Err(QueueError::TooManySenders);
        }
        Ok(queue)
    }

    /// Connect as a receiver, allocating a free bit in the connection mask.
    ///
    /// A broadcast receiver starts at the current head: it observes only
    /// messages published at or after its connect, and never rewinds.
    pub fn connect_receiver(
        prefix: &str,
        topology: Topology,
        config: ChannelConfig,
    ) -> Result<Self, QueueError> {
        let mut queue = Self::open(prefix, topology, config)?;
        queue.role = Role::Receiver;

        let header = queue.engine.ring().header();
        let pid = std::process::id();
        loop {
            let curr = header.connected.load(Ordering::Acquire);
            if topology == Topology::SpscUnicast && curr != 0 {
                queue.disconnected = true;
                return Err(QueueError::TooManyReceivers);
            }
            let idx = (!curr).trailing_zeros();
            if idx >= 32 {
                queue.disconnected = true;
                return Err(QueueError::TooManyReceivers);
            }
            let bit = 1u32 << idx;
            let cursor = header.head.load(Ordering::Acquire);
            // Publish fresh bookkeeping before the bit becomes visible, so
            // the reclaim path never sees a live bit with stale liveness.
            header.receivers[idx as usize].reset(cursor, pid, now_nanos());
            if header
                .connected
                .compare_exchange(curr, curr | bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                queue.bit_index = idx;
                queue.cursor = cursor;
                break;
            }
        }
        let _ = queue.conn_waiter.broadcast();
        Ok(queue)
    }

    fn open(prefix: &str, topology: Topology, config: ChannelConfig) -> Result<Self, QueueError> {
        config.validate()?;
        // Segments of one assembly would race across independent
        // competitive consumers and reassemble as garbage; only
        // single-consumer and broadcast channels may enable the band.
        if config.segmented_enabled() && topology.competitive_unicast() {
            return Err(QueueError::Config(crate::error::ConfigError(
                "segmented band requires a single consumer; keep large_limit == inline_size on competitive unicast",
            )));
        }
        let layout = RingLayout::calculate(config.slot_count, config.inline_size, config.align_size)?;
        let name = object_name(prefix, topology, "elems", config.inline_size, config.align_size);
        let user_size = ring_offset() + layout.total;

        let shm = ShmObject::acquire(&name, user_size, ShmOpenMode::CreateOrOpen)?;
        let shared = shm.user_ptr() as *mut QueueShared;
        // SAFETY: the ring region begins past the waiter cells and spans
        // layout.total bytes inside the mapping.
        let ring_region = unsafe {
            Region::from_raw(shm.user_ptr().add(ring_offset()), shm.user_len() - ring_offset())
        };

        let ring = if shm.created() {
            // SAFETY: freshly created region, not yet visible to attachers.
            unsafe {
                Waiter::init_cell(&raw mut (*shared).data)?;
                Waiter::init_cell(&raw mut (*shared).space)?;
                Waiter::init_cell(&raw mut (*shared).conn)?;
                let ring = Ring::init(ring_region, layout, config.align_size, topology.tag_u32());
                shm.mark_ready();
                tracing::debug!(name = %name, topology = topology.tag(), "created channel object");
                ring
            }
        } else {
            // SAFETY: initialized by the creator before mark_ready.
            unsafe { Ring::attach(ring_region, layout, config.align_size, topology.tag_u32())? }
        };

        // SAFETY: cells initialized by the creator before mark_ready.
        let (data_waiter, space_waiter, conn_waiter) = unsafe {
            (
                Waiter::from_cell(&raw mut (*shared).data),
                Waiter::from_cell(&raw mut (*shared).space),
                Waiter::from_cell(&raw mut (*shared).conn),
            )
        };

        Ok(Self {
            engine: Engine::new(topology, ring),
            shm,
            topology,
            config,
            role: Role::Sender,
            bit_index: 0,
            cursor: 0,
            data_waiter,
            space_waiter,
            conn_waiter,
            disconnected: false,
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The backing object's name.
    #[inline]
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// This receiver's bit in the connection mask.
    #[inline]
    pub fn receiver_bit(&self) -> u32 {
        debug_assert_eq!(self.role, Role::Receiver);
        1u32 << self.bit_index
    }

    /// Current connection mask (one bit per connected receiver).
    #[inline]
    pub fn connected_mask(&self) -> u32 {
        self.engine.ring().header().connected.load(Ordering::Acquire)
    }

    /// Number of connected receivers.
    #[inline]
    pub fn receiver_count(&self) -> u32 {
        self.connected_mask().count_ones()
    }

    /// Number of connected senders.
    #[inline]
    pub fn sender_count(&self) -> u32 {
        self.engine.ring().header().sender_count.load(Ordering::Acquire)
    }

    /// Snapshot of the ring cursors and connections.
    pub fn status(&self) -> QueueStatus {
        let header = self.engine.ring().header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        QueueStatus {
            head,
            tail,
            capacity: self.config.slot_count,
            connected: header.connected.load(Ordering::Acquire),
            senders: header.sender_count.load(Ordering::Acquire),
        }
    }

    // -------------------------------------------------------------------------
    // Push
    // -------------------------------------------------------------------------

    fn try_push_inner(&self, frame: &SlotFrame<'_>, mask_override: Option<u32>) -> PushResult {
        match &self.engine {
            Engine::Spsc(r) => r.try_push(frame),
            Engine::SpmcUni(r) => r.try_push(frame),
            Engine::MpmcUni(r) => r.try_push(frame),
            Engine::SpmcBcast(r) => {
                let mask = mask_override.unwrap_or_else(|| self.connected_mask());
                r.try_push(frame, mask)
            }
            Engine::MpmcBcast(r) => {
                let mask = mask_override.unwrap_or_else(|| self.connected_mask());
                r.try_push(frame, mask)
            }
        }
    }

    fn can_push(&self) -> bool {
        match &self.engine {
            Engine::Spsc(r) => r.can_push(),
            Engine::SpmcUni(r) => r.can_push(),
            Engine::MpmcUni(r) => r.can_push(),
            Engine::SpmcBcast(r) => r.can_push(),
            Engine::MpmcBcast(r) => r.can_push(),
        }
    }

    /// Push one frame without blocking.
    pub fn try_push(&self, frame: &SlotFrame<'_>) -> Result<(), QueueError> {
        self.try_push_with_mask(frame, None)
    }

    /// Push one frame without blocking, stamping `mask` instead of the
    /// current connection mask (broadcast only). Used by the transport to
    /// keep pool refcounts and slot masks in agreement.
    pub fn try_push_with_mask(
        &self,
        frame: &SlotFrame<'_>,
        mask_override: Option<u32>,
    ) -> Result<(), QueueError> {
        if self.role != Role::Sender {
            return Err(QueueError::NotSender);
        }
        if self.data_waiter.quit() {
            return Err(QueueError::Shutdown);
        }
        match self.try_push_inner(frame, mask_override) {
            PushResult::Ok => {
                let _ = self.data_waiter.broadcast();
                Ok(())
            }
            PushResult::Full => Err(QueueError::Full),
        }
    }

    /// Push one frame, spinning up to the configured budget and then
    /// parking on the space waiter. `timeout: None` blocks indefinitely.
    pub fn push(
        &self,
        frame: &SlotFrame<'_>,
        mask_override: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        if self.role != Role::Sender {
            return Err(QueueError::NotSender);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0u32;
        loop {
            if self.data_waiter.quit() {
                return Err(QueueError::Shutdown);
            }
            match self.try_push_inner(frame, mask_override) {
                PushResult::Ok => {
                    let _ = self.data_waiter.broadcast();
                    return Ok(());
                }
                PushResult::Full => {}
            }

            spins += 1;
            if spins < self.config.spin_budget {
                core::hint::spin_loop();
                continue;
            }
            spins = 0;

            // A stalled broadcast producer is the natural place to notice
            // receivers that died holding slot bits. Bound each park to the
            // staleness window so reclaim re-runs while the ring is wedged.
            let mut park = remaining(deadline)?;
            if self.topology.is_broadcast() {
                self.reclaim_dead_receivers();
                let cap = self.config.stale_after;
                park = Some(park.map_or(cap, |rem| rem.min(cap)));
            }

            match park {
                None => {
                    if !self.space_waiter.wait(|| self.can_push())? {
                        return Err(QueueError::Shutdown);
                    }
                }
                Some(rem) => match self.space_waiter.wait_for(|| self.can_push(), rem) {
                    Ok(true) => {}
                    Ok(false) => return Err(QueueError::Shutdown),
                    // The park expired; the loop re-checks the real
                    // deadline and re-runs reclaim.
                    Err(crate::error::LockError::TimedOut) => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pop
    // -------------------------------------------------------------------------

    fn try_pop_inner<T>(&mut self, f: impl FnOnce(SlotView<'_>) -> T) -> Option<Popped<T>> {
        let bit = 1u32 << self.bit_index;
        let Self { engine, cursor, .. } = self;
        match engine {
            Engine::Spsc(r) => r.try_pop(f),
            Engine::SpmcUni(r) => r.try_pop(f),
            Engine::MpmcUni(r) => r.try_pop(f),
            Engine::SpmcBcast(r) => r.try_pop(bit, cursor, f),
            Engine::MpmcBcast(r) => r.try_pop(bit, cursor, f),
        }
    }

    fn can_pop(&self) -> bool {
        match &self.engine {
            Engine::Spsc(r) => r.can_pop(),
            Engine::SpmcUni(r) => r.can_pop(),
            Engine::MpmcUni(r) => r.can_pop(),
            Engine::SpmcBcast(r) => r.can_pop(self.cursor),
            Engine::MpmcBcast(r) => r.can_pop(self.cursor),
        }
    }

    /// Pop one frame without blocking, handing the slot view to `f`.
    pub fn try_pop<T>(&mut self, f: impl FnOnce(SlotView<'_>) -> T) -> Result<T, QueueError> {
        if self.role != Role::Receiver {
            return Err(QueueError::NotReceiver);
        }
        if self.data_waiter.quit() {
            return Err(QueueError::Shutdown);
        }
        self.heartbeat();
        match self.try_pop_inner(f) {
            Some(popped) => Ok(self.finish_pop(popped)),
            None => Err(QueueError::Empty),
        }
    }

    /// Pop one frame, spinning up to the configured budget and then
    /// parking on the data waiter. `timeout: None` blocks indefinitely.
    pub fn pop<T>(
        &mut self,
        timeout: Option<Duration>,
        mut f: impl FnMut(SlotView<'_>) -> T,
    ) -> Result<T, QueueError> {
        if self.role != Role::Receiver {
            return Err(QueueError::NotReceiver);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0u32;
        loop {
            if self.data_waiter.quit() {
                return Err(QueueError::Shutdown);
            }
            self.heartbeat();
            if let Some(popped) = self.try_pop_inner(&mut f) {
                return Ok(self.finish_pop(popped));
            }

            spins += 1;
            if spins < self.config.spin_budget {
                core::hint::spin_loop();
                continue;
            }
            spins = 0;

            let waiter = self.data_waiter;
            let satisfied = match remaining(deadline)? {
                None => waiter.wait(|| self.can_pop())?,
                Some(rem) => waiter.wait_for(|| self.can_pop(), rem)?,
            };
            if !satisfied {
                return Err(QueueError::Shutdown);
            }
        }
    }

    fn finish_pop<T>(&mut self, popped: Popped<T>) -> T {
        if self.topology.is_broadcast() {
            let header = self.engine.ring().header();
            header.receivers[self.bit_index as usize]
                .cursor
                .store(self.cursor, Ordering::Relaxed);
        }
        if popped.freed {
            let _ = self.space_waiter.broadcast();
        }
        popped.value
    }

    fn heartbeat(&self) {
        let header = self.engine.ring().header();
        let entry = &header.receivers[self.bit_index as usize];
        entry.heartbeat.fetch_add(1, Ordering::Relaxed);
        entry.last_seen.store(now_nanos(), Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------------

    /// Wait until at least `count` receivers are connected.
    pub fn wait_for_receivers(
        &self,
        count: u32,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.receiver_count() >= count {
                return Ok(());
            }
            let satisfied = match remaining(deadline)? {
                None => self.conn_waiter.wait(|| self.receiver_count() >= count)?,
                Some(rem) => self
                    .conn_waiter
                    .wait_for(|| self.receiver_count() >= count, rem)?,
            };
            if !satisfied {
                return Err(QueueError::Shutdown);
            }
        }
    }

    /// Force-disconnect receivers whose heartbeats went silent and whose
    /// process is gone, sweeping their bits out of outstanding slots.
    /// Also clears orphaned slot bits left by receivers that are no longer
    /// connected. Returns the mask of receiver bits reclaimed.
    pub fn reclaim_dead_receivers(&self) -> u32 {
        let header = self.engine.ring().header();
        let stale_nanos = self.config.stale_after.as_nanos() as u64;
        let now = now_nanos();
        let mut reclaimed = 0u32;

        let connected = header.connected.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        let lap_start = head.saturating_sub(self.config.slot_count as u64);
        for idx in 0..32u32 {
            let bit = 1u32 << idx;
            if connected & bit == 0 {
                // Not connected: sweep the current lap for orphaned slot
                // bits (a receiver that disconnected while a producer was
                // stamping a stale mask snapshot).
                self.sweep_bit(bit, lap_start);
                continue;
            }
            if self.role == Role::Receiver && idx == self.bit_index {
                continue;
            }
            let entry = &header.receivers[idx as usize];
            let last = entry.last_seen.load(Ordering::Acquire);
            if now.saturating_sub(last) < stale_nanos {
                continue;
            }
            let pid = entry.pid.load(Ordering::Acquire);
            if pid != 0 && process_alive(pid) {
                continue;
            }

            header.connected.fetch_and(!bit, Ordering::AcqRel);
            let from = entry.cursor.load(Ordering::Acquire);
            self.sweep_bit(bit, from);
            entry.pid.store(0, Ordering::Release);
            reclaimed |= bit;
            tracing::warn!(bit = idx, pid, "reclaimed dead receiver");
        }

        if reclaimed != 0 {
            let _ = self.conn_waiter.broadcast();
        }
        reclaimed
    }

    fn sweep_bit(&self, bit: u32, from: u64) {
        let freed = match &self.engine {
            Engine::SpmcBcast(r) => r.sweep_clear(bit, from, self.config.spin_budget),
            Engine::MpmcBcast(r) => r.sweep_clear(bit, from, self.config.spin_budget),
            _ => 0,
        };
        if freed > 0 {
            let _ = self.space_waiter.broadcast();
        }
    }

    /// Disconnect this handle. Receivers sweep their bit out of every
    /// outstanding slot so producers never stall on a departed peer.
    /// Called automatically on drop.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        let header = self.engine.ring().header();
        match self.role {
            Role::Sender => {
                header.sender_count.fetch_sub(1, Ordering::AcqRel);
            }
            Role::Receiver => {
                let bit = 1u32 << self.bit_index;
                header.connected.fetch_and(!bit, Ordering::AcqRel);
                if self.topology.is_broadcast() {
                    self.sweep_bit(bit, self.cursor);
                }
                header.receivers[self.bit_index as usize]
                    .pid
                    .store(0, Ordering::Release);
                let _ = self.conn_waiter.broadcast();
            }
        }
    }

    /// Wake every blocked peer of this channel; they return `Shutdown`.
    pub fn shutdown(&self) {
        let _ = self.data_waiter.quit_waiting();
        let _ = self.space_waiter.quit_waiting();
        let _ = self.conn_waiter.quit_waiting();
    }

    /// Remove the channel's backing object name. Idempotent.
    pub fn clear_storage(
        prefix: &str,
        topology: Topology,
        config: &ChannelConfig,
    ) -> Result<(), QueueError> {
        let name = object_name(prefix, topology, "elems", config.inline_size, config.align_size);
        ShmObject::clear_storage(&name)?;
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, QueueError> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let rem = deadline.saturating_duration_since(Instant::now());
            if rem.is_zero() {
                Err(QueueError::TimedOut)
            } else {
                Ok(Some(rem))
            }
        }
    }
}

/// Monotonic clock in nanoseconds, comparable across processes on the same
/// host.
pub(crate) fn now_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out parameter.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 probes existence without delivering anything.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Snapshot of one queue's cursors and connections.
#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub head: u64,
    pub tail: u64,
    pub capacity: u32,
    pub connected: u32,
    pub senders: u32,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "head={} tail={} cap={} receivers={:#034b} senders={}",
            self.head, self.tail, self.capacity, self.connected, self.senders
        )
    }
}
