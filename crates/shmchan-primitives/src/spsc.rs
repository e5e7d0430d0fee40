//! Single-producer single-consumer ring engine.
//!
//! The classic two-cursor protocol: the producer owns `head`, the consumer
//! owns `tail`, and each publishes its cursor with release semantics after
//! touching slot data. Strict FIFO; the per-slot sequence word is unused.

use crate::layout::{Popped, PushResult, Ring, SlotFrame, SlotView};
use crate::sync::Ordering;

/// A wait-free SPSC ring over a shared [`Ring`] view.
#[derive(Clone, Copy)]
pub struct SpscRing {
    ring: Ring,
}

impl SpscRing {
    /// Wrap a ring view.
    pub fn new(ring: Ring) -> Self {
        Self { ring }
    }

    #[inline]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Try to push one frame. Fails with `Full` when the ring holds
    /// `capacity` unconsumed slots.
    pub fn try_push(&self, frame: &SlotFrame<'_>) -> PushResult {
        let header = self.ring.header();
        // Sole producer: plain load of our own cursor.
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.ring.capacity() {
            return PushResult::Full;
        }

        self.ring.write_frame(head, frame);
        header.head.store(head.wrapping_add(1), Ordering::Release);
        PushResult::Ok
    }

    /// Try to pop one frame, handing a read-only view to `f`.
    pub fn try_pop<T>(&self, f: impl FnOnce(SlotView<'_>) -> T) -> Option<Popped<T>> {
        let header = self.ring.header();
        // Sole consumer: plain load of our own cursor.
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let value = self.ring.read_frame(tail, f);
        header.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(Popped { value, freed: true })
    }

    /// True when a push could currently succeed.
    #[inline]
    pub fn can_push(&self) -> bool {
        let header = self.ring.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) < self.ring.capacity()
    }

    /// True when a pop could currently succeed.
    #[inline]
    pub fn can_pop(&self) -> bool {
        let header = self.ring.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        tail != head
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::layout::RingLayout;
    use crate::region::HeapRegion;

    fn make_ring(capacity: u32, data_size: u32) -> (HeapRegion, SpscRing) {
        let layout = RingLayout::calculate(capacity, data_size, 16).unwrap();
        let heap = HeapRegion::new_zeroed(layout.total);
        let ring = unsafe { Ring::init(heap.region(), layout, 16, 0) };
        (heap, SpscRing::new(ring))
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
    fn test_push_pop_roundtrip() {
        let (_heap, ring) = make_ring(8, 64);
        assert_eq!(ring.try_push(&frame(b"hello")), PushResult::Ok);
        let popped = ring
            .try_pop(|view| {
                assert_eq!(view.remaining, 5);
                view.bytes.to_vec()
            })
            .unwrap();
        assert!(popped.freed);
        assert_eq!(popped.value, b"hello");
    }

    #[test]
    fn test_pop_empty() {
        let (_heap, ring) = make_ring(8, 64);
        assert!(ring.try_pop(|_| ()).is_none());
        assert!(!ring.can_pop());
    }

    #[test]
    fn test_full_then_one_pop_frees_one_slot() {
        let (_heap, ring) = make_ring(4, 16);
        for i in 0..4u8 {
            assert_eq!(ring.try_push(&frame(&[i])), PushResult::Ok);
        }
        assert_eq!(ring.try_push(&frame(&[9])), PushResult::Full);
        assert!(!ring.can_push());

        let first = ring.try_pop(|view| view.bytes[0]).unwrap();
        assert_eq!(first.value, 0);
        assert_eq!(ring.try_push(&frame(&[9])), PushResult::Ok);
        assert_eq!(ring.try_push(&frame(&[10])), PushResult::Full);
    }

    #[test]
    fn test_fifo_order_across_wraparound() {
        let (_heap, ring) = make_ring(4, 16);
        let mut expected = 0u8;
        for round in 0..10u8 {
            for i in 0..3 {
                let value = round.wrapping_mul(3).wrapping_add(i);
                assert_eq!(ring.try_push(&frame(&[value])), PushResult::Ok);
            }
            for _ in 0..3 {
                let popped = ring.try_pop(|view| view.bytes[0]).unwrap();
                assert_eq!(popped.value, expected);
                expected = expected.wrapping_add(1);
            }
        }
    }
}
