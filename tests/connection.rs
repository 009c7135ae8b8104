// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection tests over real shared-memory channels within one process:
// handshake, echo, ordering, fragmentation, observers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use shmchan::{
    ChannelError, ChannelManager, ConnectStatus, Connection, DataReceiver, StatusObserver,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{n}", std::process::id())
}

// ---------------------------------------------------------------------------
// Test receivers and observers
// ---------------------------------------------------------------------------

/// Collects every delivered chunk sequence.
struct Collector {
    deliveries: Mutex<Vec<Vec<Vec<u8>>>>,
    cv: Condvar,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        })
    }

    fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut deliveries = self.deliveries.lock().unwrap();
        while deliveries.len() < count {
            let (d, res) = self.cv.wait_timeout(deliveries, timeout).unwrap();
            deliveries = d;
            if res.timed_out() && deliveries.len() < count {
                return false;
            }
        }
        true
    }

    fn take(&self) -> Vec<Vec<Vec<u8>>> {
        std::mem::take(&mut *self.deliveries.lock().unwrap())
    }
}

impl DataReceiver for Collector {
    fn receive_data(&self, chunks: Vec<Vec<u8>>) {
        self.deliveries.lock().unwrap().push(chunks);
        self.cv.notify_all();
    }
}

/// Verifies the S2/S6 pattern (u32 index i holds value i) on delivery and
/// keeps only the verdict, not the data.
struct PatternCheck {
    expected_len: usize,
    verdicts: Mutex<Vec<bool>>,
    cv: Condvar,
}

impl PatternCheck {
    fn new(expected_len: usize) -> Arc<Self> {
        Arc::new(Self {
            expected_len,
            verdicts: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        })
    }

    fn wait_for(&self, count: usize, timeout: Duration) -> Vec<bool> {
        let mut verdicts = self.verdicts.lock().unwrap();
        while verdicts.len() < count {
            let (v, res) = self.cv.wait_timeout(verdicts, timeout).unwrap();
            verdicts = v;
            if res.timed_out() && verdicts.len() < count {
                break;
            }
        }
        verdicts.clone()
    }
}

impl DataReceiver for PatternCheck {
    fn receive_data(&self, chunks: Vec<Vec<u8>>) {
        let ok = chunks.len() == 1 && chunks[0].len() == self.expected_len && {
            let data = &chunks[0];
            data.chunks_exact(4)
                .enumerate()
                .all(|(i, word)| u32::from_le_bytes(word.try_into().unwrap()) == i as u32)
        };
        self.verdicts.lock().unwrap().push(ok);
        self.cv.notify_all();
    }
}

/// Records every observed status transition.
struct StatusLog {
    events: Mutex<Vec<ConnectStatus>>,
    cv: Condvar,
}

impl StatusLog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        })
    }

    fn wait_for_status(&self, wanted: ConnectStatus, timeout: Duration) -> bool {
        let mut events = self.events.lock().unwrap();
        loop {
            if events.iter().any(|&s| s == wanted) {
                return true;
            }
            let (e, res) = self.cv.wait_timeout(events, timeout).unwrap();
            events = e;
            if res.timed_out() && !events.iter().any(|&s| s == wanted) {
                return false;
            }
        }
    }

    fn count(&self, wanted: ConnectStatus) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|&&s| s == wanted)
            .count()
    }
}

impl StatusObserver for StatusLog {
    fn set_status(&self, status: ConnectStatus) {
        self.events.lock().unwrap().push(status);
        self.cv.notify_all();
    }
}

fn connect_pair(
    manager: &ChannelManager,
    config: Option<&str>,
    server_rx: Arc<dyn DataReceiver>,
    client_rx: Arc<dyn DataReceiver>,
) -> (Arc<Connection>, Arc<Connection>) {
    let endpoint = manager.create_endpoint(config).expect("endpoint");
    let client = manager.access(&endpoint.descriptor).expect("access");

    endpoint
        .connection
        .async_connect(server_rx)
        .expect("server connect");
    client.async_connect(client_rx).expect("client connect");

    assert!(client.wait_for_connection(Some(Duration::from_secs(5))));
    assert!(endpoint
        .connection
        .wait_for_connection(Some(Duration::from_secs(5))));

    (endpoint.connection, client)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn two_chunk_echo_both_directions() {
    let manager = ChannelManager::with_default_monitor();
    let server_rx = Collector::new();
    let client_rx = Collector::new();
    let (server, client) = connect_pair(&manager, None, server_rx.clone(), client_rx.clone());

    let chunks = vec![vec![0x01, 0x02, 0x03, 0x04], vec![0x05, 0x06, 0x07, 0x08]];
    client.send_data(&chunks).expect("client send");

    assert!(server_rx.wait_for(1, Duration::from_secs(5)));
    let received = server_rx.take();
    assert_eq!(received, vec![chunks.clone()]);

    server.send_data(&chunks).expect("server send");
    assert!(client_rx.wait_for(1, Duration::from_secs(5)));
    assert_eq!(client_rx.take(), vec![chunks]);

    manager.shutdown();
}

#[test]
fn chunk_boundaries_and_order_are_preserved() {
    let manager = ChannelManager::with_default_monitor();
    let server_rx = Collector::new();
    let (_server, client) = connect_pair(&manager, None, server_rx.clone(), Collector::new());

    let mut sent = Vec::new();
    for i in 0..50u8 {
        let message = vec![vec![i], vec![i, i.wrapping_add(1)], vec![i; 5]];
        client.send_data(&message).expect("send");
        sent.push(message);
    }

    assert!(server_rx.wait_for(50, Duration::from_secs(10)));
    assert_eq!(server_rx.take(), sent);

    manager.shutdown();
}

#[test]
fn empty_chunks_survive_the_channel() {
    let manager = ChannelManager::with_default_monitor();
    let server_rx = Collector::new();
    let (_server, client) = connect_pair(&manager, None, server_rx.clone(), Collector::new());

    let message = vec![vec![], vec![1, 2, 3], vec![]];
    client.send_data(&message).expect("send");

    assert!(server_rx.wait_for(1, Duration::from_secs(5)));
    assert_eq!(server_rx.take(), vec![message]);

    manager.shutdown();
}

fn indexed_pattern(words: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(words * 4);
    for i in 0..words as u32 {
        data.extend_from_slice(&i.to_le_bytes());
    }
    data
}

#[test]
fn fragmented_forty_mebibyte_chunk() {
    let manager = ChannelManager::with_default_monitor();
    let name = unique_name("FRAG");
    let config = format!("[IpcChannel]\nName = \"{name}\"\nSize = 1024000\n");

    let payload = indexed_pattern(10 * 1024 * 1024);
    let server_rx = PatternCheck::new(payload.len());
    let (_server, client) = connect_pair(
        &manager,
        Some(&config),
        server_rx.clone(),
        Collector::new(),
    );

    client.send_data(&[payload]).expect("send");

    let verdicts = server_rx.wait_for(1, Duration::from_secs(60));
    assert_eq!(verdicts, vec![true]);

    manager.shutdown();
}

#[test]
fn thirty_large_messages_back_to_back() {
    let manager = ChannelManager::with_default_monitor();
    let name = unique_name("BULK");
    let config = format!("[IpcChannel]\nName = \"{name}\"\nSize = 1024000\n");

    let payload = indexed_pattern(10 * 1024 * 1024);
    let server_rx = PatternCheck::new(payload.len());
    let (_server, client) = connect_pair(
        &manager,
        Some(&config),
        server_rx.clone(),
        Collector::new(),
    );

    let message = [payload];
    for _ in 0..30 {
        client.send_data(&message).expect("send");
    }

    let verdicts = server_rx.wait_for(30, Duration::from_secs(300));
    assert_eq!(verdicts.len(), 30);
    assert!(verdicts.into_iter().all(|ok| ok));

    manager.shutdown();
}

#[test]
fn access_by_name_without_descriptor() {
    let manager = ChannelManager::with_default_monitor();
    let name = unique_name("LOCAL");
    let config = format!("[IpcChannel]\nName = \"{name}\"\nSize = 10240\n");

    let endpoint = manager.create_endpoint(Some(&config)).expect("endpoint");
    let client = manager
        .access(&format!("[IpcChannel]\nName = \"{name}\"\n"))
        .expect("access by name");

    let server_rx = Collector::new();
    endpoint
        .connection
        .async_connect(server_rx.clone())
        .expect("server connect");
    client.async_connect(Collector::new()).expect("client connect");
    assert!(client.wait_for_connection(Some(Duration::from_secs(5))));

    client.send_data(&[vec![9, 9, 9]]).expect("send");
    assert!(server_rx.wait_for(1, Duration::from_secs(5)));
    assert_eq!(server_rx.take(), vec![vec![vec![9, 9, 9]]]);

    manager.shutdown();
}

#[test]
fn send_without_connection_fails() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");

    let log = StatusLog::new();
    endpoint.connection.register_status_observer(log.clone());
    endpoint
        .connection
        .async_connect(Collector::new())
        .expect("connect");

    match endpoint.connection.send_data(&[vec![1]]) {
        Err(ChannelError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }
    assert!(log.wait_for_status(ConnectStatus::CommunicationError, Duration::from_secs(1)));

    manager.shutdown();
}

#[test]
fn observers_see_transitions_exactly_once() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");
    let client = manager.access(&endpoint.descriptor).expect("access");

    let first = StatusLog::new();
    let second = StatusLog::new();
    let first_cookie = client.register_status_observer(first.clone());
    client.register_status_observer(second.clone());

    endpoint
        .connection
        .async_connect(Collector::new())
        .expect("server connect");
    client.async_connect(Collector::new()).expect("client connect");
    assert!(client.wait_for_connection(Some(Duration::from_secs(5))));

    assert!(first.wait_for_status(ConnectStatus::Connected, Duration::from_secs(1)));
    assert!(second.wait_for_status(ConnectStatus::Connected, Duration::from_secs(1)));
    assert_eq!(first.count(ConnectStatus::Connected), 1);
    assert_eq!(second.count(ConnectStatus::Connected), 1);

    // A tombstoned observer stays silent from here on.
    client.unregister_status_observer(first_cookie);
    client.disconnect();
    assert!(second.wait_for_status(ConnectStatus::Disconnected, Duration::from_secs(1)));
    assert_eq!(first.count(ConnectStatus::Disconnected), 0);

    manager.shutdown();
}

#[test]
fn channel_reconnects_after_disconnect() {
    let manager = ChannelManager::with_default_monitor();
    let server_rx = Collector::new();
    let (_server, client) = connect_pair(&manager, None, server_rx.clone(), Collector::new());

    client.send_data(&[vec![1]]).expect("send before");
    assert!(server_rx.wait_for(1, Duration::from_secs(5)));
    server_rx.take();

    // The client walks away; the server answers the termination with an
    // immediate sync request and the handshake runs again.
    client.disconnect();
    assert!(client.wait_for_connection(Some(Duration::from_secs(5))));

    client.send_data(&[vec![2, 2]]).expect("send after reconnect");
    assert!(server_rx.wait_for(1, Duration::from_secs(5)));
    assert_eq!(server_rx.take(), vec![vec![vec![2, 2]]]);

    manager.shutdown();
}

#[test]
fn wait_for_connection_times_out_and_cancels() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");
    endpoint
        .connection
        .async_connect(Collector::new())
        .expect("connect");

    // No client side exists; a bounded wait runs out.
    assert!(!endpoint
        .connection
        .wait_for_connection(Some(Duration::from_millis(200))));

    // An unbounded wait is released by cancel_wait.
    let conn = endpoint.connection.clone();
    let waiter = std::thread::spawn(move || conn.wait_for_connection(None));
    std::thread::sleep(Duration::from_millis(100));
    endpoint.connection.cancel_wait();
    assert!(!waiter.join().expect("join"));

    manager.shutdown();
}

#[test]
fn descriptor_round_trips_through_parser() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");

    let parsed = shmchan::ChannelDescriptor::parse(&endpoint.descriptor).expect("parse");
    assert_eq!(parsed.serialize(), endpoint.descriptor);
    assert!(parsed.param(shmchan::Direction::Request).is_some());
    assert!(parsed.param(shmchan::Direction::Response).is_some());

    manager.shutdown();
}
