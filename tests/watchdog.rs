// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process tests: a spawned repeater child echoes our data, and a
// killed child triggers the watchdog's forced disconnect.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use shmchan::{
    ChannelError, ChannelManager, ConnectStatus, Connection, DataReceiver, StatusObserver,
};

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

    fn events(&self) -> Vec<ConnectStatus> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusObserver for StatusLog {
    fn set_status(&self, status: ConnectStatus) {
        self.events.lock().unwrap().push(status);
        self.cv.notify_all();
    }
}

fn write_descriptor(tag: &str, descriptor: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("shmchan_{tag}_{}.toml", std::process::id()));
    let mut file = std::fs::File::create(&path).expect("descriptor file");
    file.write_all(descriptor.as_bytes()).expect("write");
    path
}

fn spawn_repeater(descriptor_path: &std::path::Path) -> std::process::Child {
    std::process::Command::new(env!("CARGO_BIN_EXE_shm_repeater"))
        .arg(descriptor_path)
        .spawn()
        .expect("spawn repeater")
}

#[test]
fn cross_process_echo() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");
    let path = write_descriptor("echo", &endpoint.descriptor);
    let mut child = spawn_repeater(&path);

    let server_rx = Collector::new();
    endpoint
        .connection
        .async_connect(server_rx.clone())
        .expect("connect");
    assert!(endpoint
        .connection
        .wait_for_connection(Some(Duration::from_secs(10))));

    let chunks = vec![vec![0xAA; 64], vec![0x55; 7]];
    endpoint.connection.send_data(&chunks).expect("send");

    assert!(server_rx.wait_for(1, Duration::from_secs(10)));
    assert_eq!(server_rx.take(), vec![chunks]);

    endpoint.connection.disconnect();
    let _ = child.wait();
    let _ = std::fs::remove_file(&path);
    manager.shutdown();
}

#[test]
fn killed_peer_forces_disconnect() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");
    let path = write_descriptor("kill", &endpoint.descriptor);
    let mut child = spawn_repeater(&path);

    let log = StatusLog::new();
    endpoint.connection.register_status_observer(log.clone());
    endpoint
        .connection
        .async_connect(Collector::new())
        .expect("connect");
    assert!(endpoint
        .connection
        .wait_for_connection(Some(Duration::from_secs(10))));

    // SIGKILL: the child gets no chance to send a termination message.
    child.kill().expect("kill");
    let _ = child.wait();

    assert!(log.wait_for_status(ConnectStatus::DisconnectedForced, Duration::from_secs(2)));
    assert!(log.wait_for_status(ConnectStatus::Disconnected, Duration::from_secs(2)));

    // Forced first, regular disconnect after.
    let events = log.events();
    let forced = events
        .iter()
        .position(|&s| s == ConnectStatus::DisconnectedForced)
        .expect("forced event");
    assert!(events[forced + 1..].contains(&ConnectStatus::Disconnected));

    match endpoint.connection.send_data(&[vec![1]]) {
        Err(ChannelError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }

    let _ = std::fs::remove_file(&path);
    manager.shutdown();
}

struct ExitFlag {
    fired: Mutex<Option<u32>>,
    cv: Condvar,
}

impl shmchan::ProcessEvents for ExitFlag {
    fn process_terminated(&self, pid: u32, _exit_code: i64) {
        *self.fired.lock().unwrap() = Some(pid);
        self.cv.notify_all();
    }
}

#[test]
fn process_monitor_reports_child_exit() {
    use shmchan::ProcessLifetime;

    let monitor = shmchan::ProcessMonitor::new();
    assert_eq!(monitor.current_pid(), std::process::id());

    // A repeater without a readable descriptor exits right away.
    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_shm_repeater"))
        .arg("/nonexistent/descriptor")
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("spawn");
    let pid = child.id();

    let flag: Arc<ExitFlag> = Arc::new(ExitFlag {
        fired: Mutex::new(None),
        cv: Condvar::new(),
    });
    let events: std::sync::Weak<dyn shmchan::ProcessEvents> =
        Arc::downgrade(&(flag.clone() as Arc<dyn shmchan::ProcessEvents>));
    let cookie = monitor.register_monitor(pid, events);
    assert_ne!(cookie, 0);

    let _ = child.wait();

    {
        let mut fired = flag.fired.lock().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.is_none() {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "no termination callback");
            let (f, _res) = flag.cv.wait_timeout(fired, left).unwrap();
            fired = f;
        }
        assert_eq!(*fired, Some(pid));
    }

    monitor.shutdown();
}

/// Destroys the connection from inside the reception thread's delivery
/// callback; the watchdog must free it on its destructor thread.
struct SelfDestruct {
    conn: Mutex<Weak<Connection>>,
    fired: Mutex<bool>,
    cv: Condvar,
}

impl DataReceiver for SelfDestruct {
    fn receive_data(&self, _chunks: Vec<Vec<u8>>) {
        let conn = self.conn.lock().unwrap().upgrade();
        if let Some(conn) = conn {
            conn.destroy();
        }
        *self.fired.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

#[test]
fn teardown_from_reception_thread_is_deferred() {
    let manager = ChannelManager::with_default_monitor();
    let endpoint = manager.create_endpoint(None).expect("endpoint");
    let client = manager.access(&endpoint.descriptor).expect("access");

    let trigger = Arc::new(SelfDestruct {
        conn: Mutex::new(Arc::downgrade(&endpoint.connection)),
        fired: Mutex::new(false),
        cv: Condvar::new(),
    });
    endpoint
        .connection
        .async_connect(trigger.clone())
        .expect("server connect");
    client.async_connect(Collector::new()).expect("client connect");
    assert!(client.wait_for_connection(Some(Duration::from_secs(5))));

    let server_weak = Arc::downgrade(&endpoint.connection);
    drop(endpoint.connection);

    client.send_data(&[vec![42]]).expect("send");

    {
        let mut fired = trigger.fired.lock().unwrap();
        while !*fired {
            let (f, res) = trigger
                .cv
                .wait_timeout(fired, Duration::from_secs(5))
                .unwrap();
            fired = f;
            if res.timed_out() {
                panic!("delivery callback never ran");
            }
        }
    }

    // The destructor thread releases the last reference off the reception
    // thread; give it a few poll rounds.
    let deadline = Instant::now() + Duration::from_secs(2);
    while server_weak.upgrade().is_some() {
        assert!(Instant::now() < deadline, "connection never released");
        std::thread::sleep(Duration::from_millis(20));
    }

    manager.shutdown();
}
