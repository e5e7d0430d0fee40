//! Loom models for the claim/commit protocols.
//!
//! These run only under `RUSTFLAGS="--cfg loom"`. Keep each model tiny:
//! loom explores every interleaving and state blows up quickly.

use loom::sync::Arc;
use loom::thread;

use crate::broadcast::SpmcBroadcastRing;
use crate::layout::{PushResult, Ring, RingLayout, SlotFrame};
use crate::region::HeapRegion;
use crate::spsc::SpscRing;
use crate::unicast::MpmcUnicastRing;

fn frame(bytes: &[u8]) -> SlotFrame<'_> {
    SlotFrame {
        remaining: bytes.len() as u32,
        msg_id: 0,
        seg_index: 0,
        bytes,
    }
}

fn make_region(capacity: u32) -> (Arc<HeapRegion>, Ring) {
    let layout = RingLayout::calculate(capacity, 8, 8).unwrap();
    let heap = Arc::new(HeapRegion::new_zeroed(layout.total));
    let ring = unsafe { Ring::init(heap.region(), layout, 8, 0) };
    (heap, ring)
}

#[test]
fn loom_spsc_publish_visibility() {
    loom::model(|| {
        let (heap, ring) = make_region(2);
        let spsc = SpscRing::new(ring);

        let producer = {
            let heap = heap.clone();
            thread::spawn(move || {
                let _keep = heap;
                assert_eq!(spsc.try_push(&frame(&[1])), PushResult::Ok);
                assert_eq!(spsc.try_push(&frame(&[2])), PushResult::Ok);
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(popped) = spsc.try_pop(|v| v.bytes[0]) {
                seen.push(popped.value);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, vec![1, 2]);
    });
}

#[test]
fn loom_mpmc_claims_are_exclusive() {
    loom::model(|| {
        let (heap, ring) = make_region(2);
        let mpmc = MpmcUnicastRing::new(ring);

        let mut producers = Vec::new();
        for value in [10u8, 20u8] {
            let heap = heap.clone();
            producers.push(thread::spawn(move || {
                let _keep = heap;
                loop {
                    if MpmcUnicastRing::new(ring).try_push(&frame(&[value])) == PushResult::Ok {
                        break;
                    }
                    thread::yield_now();
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(popped) = mpmc.try_pop(|v| v.bytes[0]) {
                seen.push(popped.value);
            } else {
                thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![10, 20]);
    });
}

#[test]
fn loom_broadcast_last_reader_frees() {
    loom::model(|| {
        let (heap, ring) = make_region(2);
        let bcast = SpmcBroadcastRing::new(ring);

        assert_eq!(bcast.try_push(&frame(&[7]), 0b11), PushResult::Ok);

        let reader = {
            let heap = heap.clone();
            thread::spawn(move || {
                let _keep = heap;
                let bcast = SpmcBroadcastRing::new(ring);
                let mut cursor = 0u64;
                bcast
                    .try_pop(0b01, &mut cursor, |v| v.bytes[0])
                    .expect("committed slot visible to reader")
            })
        };

        let mut cursor = 0u64;
        let mine = bcast
            .try_pop(0b10, &mut cursor, |v| v.bytes[0])
            .expect("committed slot visible to reader");
        let theirs = reader.join().unwrap();
        assert_eq!(mine, 7);
        assert_eq!(theirs, 7);

        // Exactly one of the two readers freed the slot, so the producer
        // can run a full lap again.
        assert_eq!(bcast.try_push(&frame(&[8]), 0), PushResult::Ok);
        assert_eq!(bcast.try_push(&frame(&[9]), 0), PushResult::Ok);
    });
}
