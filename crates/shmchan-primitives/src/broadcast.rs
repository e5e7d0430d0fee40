//! Broadcast ring engines.
//!
//! Every receiver connected at publish time observes every message. Each
//! slot carries a reader mask stamped with the connected mask when the
//! producer commits; each receiver keeps a private cursor and clears its
//! bit after reading. The receiver that clears the last bit retires the
//! slot (`seq = c + capacity`), which is what lets the producer reuse it:
//! a producer needing a slot whose mask is still nonzero finds `seq != p`
//! and reports `Full`.
//!
//! Receivers that connect mid-stream start at the head observed at connect
//! time and skip slots whose mask did not include their bit.

use crate::layout::{Popped, PushResult, Ring, SlotFrame, SlotView};
use crate::sync::{Ordering, spin_loop};

/// Broadcast ring; `MULTI_PRODUCER` selects whether producers serialize
/// head claims through CAS.
#[derive(Clone, Copy)]
pub struct BroadcastRing<const MULTI_PRODUCER: bool> {
    ring: Ring,
}

/// Single producer broadcast.
pub type SpmcBroadcastRing = BroadcastRing<false>;
/// Competing producers broadcast.
pub type MpmcBroadcastRing = BroadcastRing<true>;

impl<const MULTI_PRODUCER: bool> BroadcastRing<MULTI_PRODUCER> {
    /// Wrap a ring view.
    pub fn new(ring: Ring) -> Self {
        Self { ring }
    }

    #[inline]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Try to push one frame, addressed to the receivers in `connected`.
    ///
    /// A push with an empty `connected` mask succeeds and retires the slot
    /// immediately: the message is undeliverable and dropped, matching the
    /// rule that late joiners only observe messages published at or after
    /// their connect.
    pub fn try_push(&self, frame: &SlotFrame<'_>, connected: u32) -> PushResult {
        let header = self.ring.header();

        let claimed = loop {
            let head = header.head.load(Ordering::Acquire);
            let seq = self.ring.meta(head).seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(head) as i64;

            if dif == 0 {
                if MULTI_PRODUCER {
                    if header
                        .head
                        .compare_exchange_weak(
                            head,
                            head.wrapping_add(1),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        spin_loop();
                        continue;
                    }
                } else {
                    header.head.store(head.wrapping_add(1), Ordering::Release);
                }
                break head;
            } else if dif < 0 {
                // Some receiver still holds a bit on this slot.
                return PushResult::Full;
            } else {
                spin_loop();
            }
        };

        let meta = self.ring.meta(claimed);
        if connected == 0 {
            // No receivers to address; retire the slot right away.
            meta.seq
                .store(claimed.wrapping_add(self.ring.capacity()), Ordering::Release);
            return PushResult::Ok;
        }

        self.ring.write_frame(claimed, frame);
        meta.mask.store(connected, Ordering::Relaxed);
        meta.seq.store(claimed.wrapping_add(1), Ordering::Release);
        PushResult::Ok
    }

    /// Try to pop the next frame addressed to `bit`, advancing `cursor`.
    ///
    /// Slots published before this receiver connected (bit absent from the
    /// mask) and slots retired without receivers are skipped.
    pub fn try_pop<T>(
        &self,
        bit: u32,
        cursor: &mut u64,
        f: impl FnOnce(SlotView<'_>) -> T,
    ) -> Option<Popped<T>> {
        let capacity = self.ring.capacity();

        let claimed = loop {
            let c = *cursor;
            let meta = self.ring.meta(c);
            let seq = meta.seq.load(Ordering::Acquire);

            if seq == c.wrapping_add(1) {
                if meta.mask.load(Ordering::Acquire) & bit == 0 {
                    // Published before we connected; not addressed to us.
                    *cursor = c.wrapping_add(1);
                    continue;
                }
                break c;
            } else if seq == c.wrapping_add(capacity) {
                // Retired without us (published while no receiver was
                // connected, or our bit was reclaimed).
                *cursor = c.wrapping_add(1);
                continue;
            } else {
                // Nothing committed at our cursor yet.
                return None;
            }
        };

        let value = self.ring.read_frame(claimed, f);
        let meta = self.ring.meta(claimed);
        let old = meta.mask.fetch_and(!bit, Ordering::AcqRel);
        let mut freed = false;
        if old & bit != 0 && old & !bit == 0 {
            // We cleared the last outstanding bit; release the slot.
            meta.seq
                .store(claimed.wrapping_add(capacity), Ordering::Release);
            freed = true;
        }
        *cursor = claimed.wrapping_add(1);
        Some(Popped { value, freed })
    }

    /// True when a push could currently succeed.
    #[inline]
    pub fn can_push(&self) -> bool {
        let head = self.ring.header().head.load(Ordering::Acquire);
        self.ring.meta(head).seq.load(Ordering::Acquire) == head
    }

    /// True when `try_pop` at `cursor` could make progress.
    #[inline]
    pub fn can_pop(&self, cursor: u64) -> bool {
        let seq = self.ring.meta(cursor).seq.load(Ordering::Acquire);
        seq == cursor.wrapping_add(1) || seq == cursor.wrapping_add(self.ring.capacity())
    }

    /// Clear `bit` from every outstanding slot in `[from, head)`.
    ///
    /// Used when a receiver disconnects (on its own behalf) or is declared
    /// dead (on its behalf by a cleaner). Slots claimed but not yet
    /// committed are waited on for a bounded number of spins; a producer
    /// never blocks between claim and commit, so the wait is short in
    /// practice. Returns the number of slots this sweep released.
    pub fn sweep_clear(&self, bit: u32, from: u64, spin_budget: u32) -> u32 {
        let header = self.ring.header();
        let capacity = self.ring.capacity();
        let head = header.head.load(Ordering::Acquire);
        let mut freed = 0;

        let mut c = from;
        while (c.wrapping_sub(head) as i64) < 0 {
            let meta = self.ring.meta(c);
            let mut spins = 0u32;
            loop {
                let seq = meta.seq.load(Ordering::Acquire);
                if seq == c.wrapping_add(1) {
                    let old = meta.mask.fetch_and(!bit, Ordering::AcqRel);
                    if old & bit != 0 && old & !bit == 0 {
                        meta.seq.store(c.wrapping_add(capacity), Ordering::Release);
                        freed += 1;
                    }
                    break;
                } else if seq == c {
                    // Claimed but not committed; the producer is mid-write.
                    spins += 1;
                    if spins > spin_budget {
                        break;
                    }
                    spin_loop();
                } else {
                    // Retired, or already into the next lap.
                    break;
                }
            }
            c = c.wrapping_add(1);
        }
        freed
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::layout::RingLayout;
    use crate::region::HeapRegion;

    fn make_ring(capacity: u32) -> (HeapRegion, SpmcBroadcastRing) {
        let layout = RingLayout::calculate(capacity, 64, 16).unwrap();
        let heap = HeapRegion::new_zeroed(layout.total);
        let ring = unsafe { Ring::init(heap.region(), layout, 16, 0) };
        (heap, BroadcastRing::new(ring))
    }

    fn frame(bytes: &[u8]) -> SlotFrame<'_> {
        SlotFrame {
            remaining: bytes.len() as u32,
            msg_id: 0,
            seg_index: 0,
            bytes,
        }
    }

    #[test]
    fn test_every_receiver_sees_every_message() {
        let (_heap, ring) = make_ring(8);
        let r1 = 0b01;
        let r2 = 0b10;
        let mut c1 = 0u64;
        let mut c2 = 0u64;

        for i in 0..5u8 {
            assert_eq!(ring.try_push(&frame(&[i]), r1 | r2), PushResult::Ok);
        }
        for i in 0..5u8 {
            let p1 = ring.try_pop(r1, &mut c1, |v| v.bytes[0]).unwrap();
            assert_eq!(p1.value, i);
            assert!(!p1.freed, "first reader must not free the slot");
            let p2 = ring.try_pop(r2, &mut c2, |v| v.bytes[0]).unwrap();
            assert_eq!(p2.value, i);
            assert!(p2.freed, "last reader frees the slot");
        }
        assert!(ring.try_pop(r1, &mut c1, |_| ()).is_none());
    }

    #[test]
    fn test_producer_stalls_until_all_readers_consume() {
        let (_heap, ring) = make_ring(2);
        let r1 = 0b01;
        let r2 = 0b10;
        let mut c1 = 0u64;
        let mut c2 = 0u64;

        assert_eq!(ring.try_push(&frame(&[0]), r1 | r2), PushResult::Ok);
        assert_eq!(ring.try_push(&frame(&[1]), r1 | r2), PushResult::Ok);
        assert_eq!(ring.try_push(&frame(&[2]), r1 | r2), PushResult::Full);

        // One reader alone does not unblock the producer.
        assert!(ring.try_pop(r1, &mut c1, |_| ()).is_some());
        assert_eq!(ring.try_push(&frame(&[2]), r1 | r2), PushResult::Full);

        assert!(ring.try_pop(r2, &mut c2, |_| ()).is_some());
        assert_eq!(ring.try_push(&frame(&[2]), r1 | r2), PushResult::Ok);
    }

    #[test]
    fn test_empty_mask_publish_is_dropped() {
        let (_heap, ring) = make_ring(4);
        // No receivers connected: publishes succeed and slots recycle.
        for i in 0..10u8 {
            assert_eq!(ring.try_push(&frame(&[i]), 0), PushResult::Ok);
        }
        // A receiver connecting now starts at head and sees nothing.
        let head = ring.ring().header().head.load(Ordering::Acquire);
        let mut cursor = head;
        assert!(ring.try_pop(0b1, &mut cursor, |_| ()).is_none());
    }

    #[test]
    fn test_late_joiner_skips_earlier_slots() {
        let (_heap, ring) = make_ring(8);
        let r1 = 0b01;
        let r2 = 0b10;

        // r1 is connected from the start.
        let mut c1 = 0u64;
        assert_eq!(ring.try_push(&frame(b"a"), r1), PushResult::Ok);
        assert_eq!(ring.try_push(&frame(b"b"), r1), PushResult::Ok);

        // r2 joins; its cursor starts at the current head.
        let mut c2 = ring.ring().header().head.load(Ordering::Acquire);
        assert_eq!(ring.try_push(&frame(b"c"), r1 | r2), PushResult::Ok);

        assert_eq!(ring.try_pop(r1, &mut c1, |v| v.bytes[0]).unwrap().value, b'a');
        assert_eq!(ring.try_pop(r1, &mut c1, |v| v.bytes[0]).unwrap().value, b'b');
        assert_eq!(ring.try_pop(r1, &mut c1, |v| v.bytes[0]).unwrap().value, b'c');
        assert_eq!(ring.try_pop(r2, &mut c2, |v| v.bytes[0]).unwrap().value, b'c');
        assert!(ring.try_pop(r2, &mut c2, |_| ()).is_none());
    }

    #[test]
    fn test_sweep_clear_releases_departed_receiver() {
        let (_heap, ring) = make_ring(4);
        let r1 = 0b01;
        let r2 = 0b10;
        let mut c1 = 0u64;

        assert_eq!(ring.try_push(&frame(&[0]), r1 | r2), PushResult::Ok);
        assert_eq!(ring.try_push(&frame(&[1]), r1 | r2), PushResult::Ok);
        assert!(ring.try_pop(r1, &mut c1, |_| ()).is_some());
        assert!(ring.try_pop(r1, &mut c1, |_| ()).is_some());

        // r2 departs without consuming; sweep releases both slots.
        let freed = ring.sweep_clear(r2, 0, 64);
        assert_eq!(freed, 2);

        // Ring is fully writable again.
        for i in 0..4u8 {
            assert_eq!(ring.try_push(&frame(&[i]), r1), PushResult::Ok);
        }
    }
}
