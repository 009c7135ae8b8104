// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ring accessor tests over the in-process region: boundary behaviour,
// stuffing at the wrap, out-of-order commits, cancellation.

use shmchan::{ChannelError, InProcRegion, RingRx, RingTx};

/// 256 bytes total, 240 usable after the ring header.
fn small_ring() -> (RingTx, RingRx) {
    let region = InProcRegion::new(256).expect("region");
    let tx = RingTx::new(region.clone()).expect("tx");
    let rx = RingRx::new(region).expect("rx");
    (tx, rx)
}

#[test]
fn fill_to_capacity_then_overflow() {
    let (tx, rx) = small_ring();

    // Fourteen 6-byte packets occupy 14 * 16 = 224 of 240 usable bytes.
    for i in 0..14u8 {
        tx.try_write(&[i; 6]).expect("write");
    }

    // The fifteenth does not fit: 15 bytes remain in front of the read
    // cursor at offset 0.
    match tx.try_write(&[0xEE; 6]) {
        Err(ChannelError::ChannelFull(_)) => {}
        other => panic!("expected ChannelFull, got {other:?}"),
    }

    for i in 0..14u8 {
        let packet = rx.try_read().expect("scan").expect("packet");
        assert_eq!(packet.payload(), &[i; 6]);
        packet.accept();
    }
    assert!(rx.try_read().expect("scan").is_none());
}

#[test]
fn wrap_with_stuffing() {
    let (tx, rx) = small_ring();

    // Walk the cursors to offset 224, leaving a 16-byte tail.
    for i in 0..14u8 {
        tx.try_write(&[i; 6]).expect("write");
        let packet = rx.try_read().expect("scan").expect("packet");
        assert_eq!(packet.payload(), &[i; 6]);
        packet.accept();
    }

    // A 100-byte packet cannot fit the tail; the producer stuffs it and
    // restarts at offset 0.
    let big: Vec<u8> = (0..100u8).collect();
    tx.try_write(&big).expect("write across wrap");
    let packet = rx.try_read().expect("scan").expect("packet");
    assert_eq!(packet.payload(), &big[..]);
    packet.accept();
}

#[test]
fn long_interleaved_sequence() {
    let (tx, rx) = small_ring();

    for i in 0..1000u32 {
        let body = [(i % 251) as u8; 10];
        tx.try_write(&body).expect("write");
        let packet = rx.try_read().expect("scan").expect("packet");
        assert_eq!(packet.payload(), &body);
        packet.accept();
    }
}

#[test]
fn out_of_order_commit_preserves_order() {
    let (tx, rx) = small_ring();

    // Fourteen 5-byte reservations fill the ring (16 bytes per slot).
    let mut reservations = Vec::new();
    for i in 0..14u8 {
        let mut r = tx.reserve(5, 50).expect("reserve");
        r.payload().copy_from_slice(&[b'0' + i; 5]);
        reservations.push(r);
    }

    // Nothing is visible before the oldest reservation commits.
    assert!(rx.try_read().expect("scan").is_none());

    // A fifteenth reservation fails while everything is outstanding.
    match tx.reserve(5, 50) {
        Err(ChannelError::ChannelFull(_)) => {}
        other => panic!("expected ChannelFull, got {:?}", other.map(|_| ())),
    }

    // Commit newest first; the ring stays invisible until the head commits.
    while reservations.len() > 1 {
        reservations.pop().expect("reservation").commit();
        assert!(rx.try_read().expect("scan").is_none());
    }
    reservations.pop().expect("reservation").commit();

    // Now all fourteen drain in reservation order.
    for i in 0..14u8 {
        let packet = rx.try_read().expect("scan").expect("packet");
        assert_eq!(packet.payload(), &[b'0' + i; 5]);
        packet.accept();
    }

    // Space freed; a new reservation fits again.
    tx.reserve(5, 50).expect("reserve after drain").commit();
}

#[test]
fn dropping_a_reservation_commits_it() {
    let (tx, rx) = small_ring();

    {
        let mut r = tx.reserve(4, 50).expect("reserve");
        r.payload().copy_from_slice(b"drop");
        // No explicit commit.
    }

    let packet = rx.try_read().expect("scan").expect("packet");
    assert_eq!(packet.payload(), b"drop");
    packet.accept();

    // The channel is not wedged afterwards.
    tx.try_write(b"next").expect("write");
    let packet = rx.try_read().expect("scan").expect("packet");
    assert_eq!(packet.payload(), b"next");
}

#[test]
fn cancel_refuses_reserves_until_reset() {
    let (tx, rx) = small_ring();

    tx.try_write(b"stale").expect("write");

    tx.cancel_send();
    match tx.reserve(4, 50) {
        Err(ChannelError::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other.map(|_| ())),
    }

    // Reset skips the unread packet and clears the flag.
    tx.reset_rx();
    tx.try_write(b"new").expect("write after reset");

    let packet = rx.try_read().expect("scan").expect("packet");
    assert_eq!(packet.payload(), b"new");
}

#[test]
fn oversized_payload_is_rejected() {
    let (tx, _rx) = small_ring();

    let result = tx.reserve(240, 50);
    match result {
        Err(ChannelError::InvalidSize { requested, capacity }) => {
            assert_eq!(requested, 240);
            assert_eq!(capacity, 232);
        }
        other => panic!("expected InvalidSize, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn randomized_sizes_sweep_the_wrap() {
    let (tx, rx) = small_ring();

    // Deterministic xorshift so failures reproduce.
    let mut state = 0x2545_f491u32;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };

    for round in 0..2000u32 {
        let len = (next() % 90) as usize;
        let fill = (round % 251) as u8;
        let body = vec![fill; len];
        tx.try_write(&body).expect("write");
        let packet = rx.try_read().expect("scan").expect("packet");
        assert_eq!(packet.payload(), &body[..], "round {round}");
        packet.accept();
    }
}

#[test]
fn concurrent_producer_consumer() {
    let region = InProcRegion::new(4096 + 16).expect("region");
    let tx = RingTx::new(region.clone()).expect("tx");
    let rx = RingRx::new(region).expect("rx");

    let producer = std::thread::spawn(move || {
        for i in 0..500u32 {
            let body = i.to_le_bytes();
            tx.try_write(&body).expect("write");
        }
    });

    let mut next = 0u32;
    while next < 500 {
        match rx.try_read().expect("scan") {
            Some(packet) => {
                assert_eq!(packet.payload(), &next.to_le_bytes());
                next += 1;
            }
            None => {
                rx.wait_for_data(10);
            }
        }
    }

    producer.join().expect("producer");
}
