//! Competitive unicast ring engines.
//!
//! Each message is consumed by exactly one of the competing consumers.
//! Claim/commit runs through the per-slot sequence word:
//!
//! - a producer claiming position `p` requires `seq == p`, advances `head`
//!   (CAS when multiple producers compete, plain store otherwise), writes
//!   the frame, then commits with `seq = p + 1` (release);
//! - a consumer claiming position `c` requires `seq == c + 1`, CASes `tail`
//!   forward, reads the frame, then retires the slot with
//!   `seq = c + capacity` (release).
//!
//! The sequence word is simultaneously the commit flag and the lap epoch,
//! so a slot can never be claimed twice in the same lap and wrap-around
//! reuse is ABA-safe.

use crate::layout::{Popped, PushResult, Ring, SlotFrame, SlotView};
use crate::sync::{Ordering, spin_loop};

/// Competitive unicast ring; `MULTI_PRODUCER` selects whether producers
/// serialize head claims through CAS.
#[derive(Clone, Copy)]
pub struct UnicastRing<const MULTI_PRODUCER: bool> {
    ring: Ring,
}

/// Single producer, competing consumers.
pub type SpmcUnicastRing = UnicastRing<false>;
/// Competing producers, competing consumers.
pub type MpmcUnicastRing = UnicastRing<true>;

impl<const MULTI_PRODUCER: bool> UnicastRing<MULTI_PRODUCER> {
    /// Wrap a ring view.
    pub fn new(ring: Ring) -> Self {
        Self { ring }
    }

    #[inline]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Try to push one frame.
    pub fn try_push(&self, frame: &SlotFrame<'_>) -> PushResult {
        let header = self.ring.header();

        let claimed = loop {
            let head = header.head.load(Ordering::Acquire);
            let seq = self.ring.meta(head).seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(head) as i64;

            if dif == 0 {
                // Slot is free for this lap; claim the position.
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
                    header.head.store(head.wrapping_add(1), Ordering::Relaxed);
                }
                break head;
            } else if dif < 0 {
                // Previous-lap occupant not yet retired.
                return PushResult::Full;
            } else {
                // Another producer advanced head under us; reload.
                spin_loop();
            }
        };

        self.ring.write_frame(claimed, frame);
        self.ring
            .meta(claimed)
            .seq
            .store(claimed.wrapping_add(1), Ordering::Release);
        PushResult::Ok
    }

    /// Try to pop one frame, handing a read-only view to `f`.
    pub fn try_pop<T>(&self, f: impl FnOnce(SlotView<'_>) -> T) -> Option<Popped<T>> {
        let header = self.ring.header();

        let claimed = loop {
            let tail = header.tail.load(Ordering::Acquire);
            let seq = self.ring.meta(tail).seq.load(Ordering::Acquire);
            let dif = seq.wrapping_sub(tail.wrapping_add(1)) as i64;

            if dif == 0 {
                // Committed and unclaimed; take it.
                if header
                    .tail
                    .compare_exchange_weak(
                        tail,
                        tail.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break tail;
                }
                spin_loop();
            } else if dif < 0 {
                // Empty, or a producer claimed but has not committed yet.
                return None;
            } else {
                // Another consumer advanced tail under us; reload.
                spin_loop();
            }
        };

        let value = self.ring.read_frame(claimed, f);
        self.ring
            .meta(claimed)
            .seq
            .store(claimed.wrapping_add(self.ring.capacity()), Ordering::Release);
        Some(Popped { value, freed: true })
    }

    /// True when a push could currently succeed.
    #[inline]
    pub fn can_push(&self) -> bool {
        let head = self.ring.header().head.load(Ordering::Acquire);
        self.ring.meta(head).seq.load(Ordering::Acquire) == head
    }

    /// True when a pop could currently succeed.
    #[inline]
    pub fn can_pop(&self) -> bool {
        let tail = self.ring.header().tail.load(Ordering::Acquire);
        self.ring.meta(tail).seq.load(Ordering::Acquire) == tail.wrapping_add(1)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::layout::RingLayout;
    use crate::region::HeapRegion;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn make_ring<const MP: bool>(capacity: u32) -> (Arc<HeapRegion>, UnicastRing<MP>) {
        let layout = RingLayout::calculate(capacity, 16, 16).unwrap();
        let heap = Arc::new(HeapRegion::new_zeroed(layout.total));
        let ring = unsafe { Ring::init(heap.region(), layout, 16, 0) };
        (heap, UnicastRing::new(ring))
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
    fn test_full_and_empty_boundaries() {
        let (_heap, ring) = make_ring::<true>(4);
        assert!(ring.try_pop(|_| ()).is_none());
        for i in 0..4u8 {
            assert_eq!(ring.try_push(&frame(&[i])), PushResult::Ok);
        }
        assert_eq!(ring.try_push(&frame(&[9])), PushResult::Full);
        assert_eq!(ring.try_pop(|v| v.bytes[0]).unwrap().value, 0);
        assert_eq!(ring.try_push(&frame(&[9])), PushResult::Ok);
    }

    #[test]
    fn test_slot_reuse_across_laps() {
        let (_heap, ring) = make_ring::<true>(2);
        for lap in 0..100u8 {
            assert_eq!(ring.try_push(&frame(&[lap])), PushResult::Ok);
            assert_eq!(ring.try_pop(|v| v.bytes[0]).unwrap().value, lap);
        }
    }

    #[test]
    fn test_mpmc_union_of_consumed_equals_produced() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2_000;

        let (heap, ring) = make_ring::<true>(64);
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let heap = heap.clone();
            let ring = ring;
            handles.push(std::thread::spawn(move || {
                let _keep_alive = heap;
                for s in 0..PER_PRODUCER {
                    let tag = (p << 32) | s;
                    let bytes = tag.to_le_bytes();
                    loop {
                        if ring.try_push(&frame(&bytes)) == PushResult::Ok {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let heap = heap.clone();
            let ring = ring;
            consumers.push(std::thread::spawn(move || {
                let _keep_alive = heap;
                let mut seen = Vec::new();
                while seen.len() < (PRODUCERS * PER_PRODUCER / 4) as usize {
                    if let Some(popped) = ring.try_pop(|v| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(v.bytes);
                        u64::from_le_bytes(raw)
                    }) {
                        seen.push(popped.value);
                    } else {
                        std::thread::yield_now();
                    }
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let mut all = HashSet::new();
        for c in consumers {
            let seen = c.join().unwrap();
            // Within one consumer, each producer's messages arrive in the
            // order that producer reserved slots.
            let mut last = vec![None::<u64>; PRODUCERS as usize];
            for tag in seen {
                assert!(all.insert(tag), "message consumed twice: {tag:#x}");
                let producer = (tag >> 32) as usize;
                let seqno = tag & 0xFFFF_FFFF;
                if let Some(prev) = last[producer] {
                    assert!(seqno > prev, "producer {producer} reordered");
                }
                last[producer] = Some(seqno);
            }
        }
        assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
    }
}
