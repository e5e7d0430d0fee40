//! End-to-end payload round-trips over every encoding path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use shmchan::{ChannelConfig, Receiver, Sender, Topology};

fn unique_prefix(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "rt.{}.{}.{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

#[test]
fn spsc_ten_thousand_messages_in_order() {
    let prefix = unique_prefix("spsc10k");
    let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();
    let mut rx =
        Receiver::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();

    let producer = std::thread::spawn(move || {
        for value in 0u64..10_000 {
            let mut payload = [0u8; 16];
            payload[..8].copy_from_slice(&value.to_le_bytes());
            payload[8..].copy_from_slice(&value.wrapping_mul(7).to_le_bytes());
            tx.send(&payload, TIMEOUT).unwrap();
        }
    });

    let mut last = None;
    for _ in 0..10_000 {
        let buf = rx.recv(TIMEOUT).unwrap();
        assert_eq!(buf.len(), 16);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        let value = u64::from_le_bytes(raw);
        if let Some(prev) = last {
            assert_eq!(value, prev + 1, "consumer saw a gap or reorder");
        }
        last = Some(value);
    }
    assert_eq!(last, Some(9_999));
    producer.join().unwrap();
}

#[test]
fn inline_sizes_round_trip_byte_for_byte() {
    let prefix = unique_prefix("inline");
    let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();
    let mut rx =
        Receiver::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();

    for len in 1..=64usize {
        let payload: Vec<u8> = (0..len).map(|i| (i * 13 + len) as u8).collect();
        tx.send(&payload, TIMEOUT).unwrap();
        let got = rx.recv(TIMEOUT).unwrap();
        assert_eq!(&*got, &payload[..], "len {len}");
    }
}

#[test]
fn large_message_uses_matching_size_class_and_restores_freelist() {
    let prefix = unique_prefix("large64k");
    let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();
    let mut rx =
        Receiver::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();

    let idle = tx.pool_status();
    let payload: Vec<u8> = (0..65_536usize).map(|i| (i % 251) as u8).collect();
    tx.send(&payload, TIMEOUT).unwrap();

    let buf = rx.recv(TIMEOUT).unwrap();
    assert_eq!(buf.len(), 65_536);
    assert_eq!(&*buf, &payload[..]);

    // The chunk came from the smallest class that fits 64 KiB.
    let held = tx.pool_status();
    let dipped: Vec<usize> = (0..held.classes.len())
        .filter(|&i| held.classes[i].free != idle.classes[i].free)
        .collect();
    assert_eq!(dipped.len(), 1);
    assert!(held.classes[dipped[0]].chunk_size >= 65_536);

    // Dropping the buffer returns the chunk to its freelist.
    drop(buf);
    let after = tx.pool_status();
    for i in 0..after.classes.len() {
        assert_eq!(after.classes[i].free, idle.classes[i].free);
    }
}

#[test]
fn hundred_kib_round_trip() {
    let prefix = unique_prefix("large100k");
    let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();
    let mut rx =
        Receiver::connect(&prefix, Topology::SpscUnicast, ChannelConfig::default()).unwrap();

    let payload: Vec<u8> = (0..100 * 1024usize).map(|i| (i * 31 % 253) as u8).collect();
    tx.send(&payload, TIMEOUT).unwrap();
    let got = rx.recv(TIMEOUT).unwrap();
    assert_eq!(&*got, &payload[..]);
}

#[test]
fn segmented_messages_reassemble_in_order() {
    let prefix = unique_prefix("segmented");
    let config = ChannelConfig {
        large_limit: 512,
        ..Default::default()
    };
    let mut tx = Sender::connect(&prefix, Topology::SpscUnicast, config.clone()).unwrap();
    let mut rx = Receiver::connect(&prefix, Topology::SpscUnicast, config).unwrap();

    let payloads: Vec<Vec<u8>> = (0..3)
        .map(|m| (0..200usize).map(|i| (m * 100 + i) as u8).collect())
        .collect();
    for payload in &payloads {
        tx.send(payload, TIMEOUT).unwrap();
    }
    for payload in &payloads {
        let got = rx.recv(TIMEOUT).unwrap();
        assert_eq!(&*got, &payload[..]);
    }
}

#[test]
fn broadcast_late_joiners_see_only_later_messages() {
    let prefix = unique_prefix("latejoin");
    let mut tx =
        Sender::connect(&prefix, Topology::SpmcBroadcast, ChannelConfig::default()).unwrap();

    tx.send(b"A", TIMEOUT).unwrap();
    tx.send(b"B", TIMEOUT).unwrap();

    let mut r1 =
        Receiver::connect(&prefix, Topology::SpmcBroadcast, ChannelConfig::default()).unwrap();
    tx.send(b"C", TIMEOUT).unwrap();
    tx.send(b"D", TIMEOUT).unwrap();

    let mut r2 =
        Receiver::connect(&prefix, Topology::SpmcBroadcast, ChannelConfig::default()).unwrap();
    tx.send(b"E", TIMEOUT).unwrap();

    let r1_seen: Vec<Vec<u8>> = (0..3).map(|_| r1.recv(TIMEOUT).unwrap().to_vec()).collect();
    assert_eq!(r1_seen, vec![b"C".to_vec(), b"D".to_vec(), b"E".to_vec()]);

    let r2_seen = r2.recv(TIMEOUT).unwrap();
    assert_eq!(&*r2_seen, b"E");
    assert!(r2.try_recv().is_err());
}
