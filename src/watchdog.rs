// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The watchdog owns every live connection and reacts to peer-process
// death. Monitoring the peer's existence instead of using timeouts means a
// peer stopped in a debugger does not get disconnected; a crashed peer is
// removed by the OS and its connections are force-disconnected promptly.
//
// Connections whose teardown was requested from their own reception thread
// are released on a dedicated destructor thread, never on the thread being
// torn down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::connection::Connection;
use crate::process::{ProcessEvents, ProcessLifetime};

/// Poll bound of the destructor thread's condition wait.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

struct MonitorMaps {
    /// One OS registration per monitored PID.
    registrations: HashMap<u32, u32>,
    /// Connections watching each PID; several connections may share one.
    watchers: HashMap<u32, Vec<(u64, Weak<Connection>)>>,
}

pub struct Watchdog {
    self_weak: Weak<Watchdog>,
    lifetime: Arc<dyn ProcessLifetime>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    monitors: Mutex<MonitorMaps>,
    pending_drops: Mutex<VecDeque<Arc<Connection>>>,
    pending_cv: Condvar,
    stop: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(lifetime: Arc<dyn ProcessLifetime>) -> Arc<Self> {
        let watchdog = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            lifetime,
            connections: Mutex::new(HashMap::new()),
            monitors: Mutex::new(MonitorMaps {
                registrations: HashMap::new(),
                watchers: HashMap::new(),
            }),
            pending_drops: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&watchdog);
        *watchdog.reaper.lock().unwrap() = Some(std::thread::spawn(move || reaper_thread(weak)));
        watchdog
    }

    pub(crate) fn lifetime(&self) -> &Arc<dyn ProcessLifetime> {
        &self.lifetime
    }

    /// Take ownership of a connection; it stays alive until removed, even
    /// after the last external user drops its handle.
    pub fn add_connection(&self, conn: Arc<Connection>) {
        log::trace!(
            "registering {} connection",
            if conn.is_server() { "server" } else { "client" }
        );
        self.connections
            .lock()
            .unwrap()
            .insert(conn.conn_id(), conn);
    }

    /// Release the owned reference of `conn`. With `deferred`, the actual
    /// drop moves to the destructor thread — required when the caller is a
    /// thread the connection owns.
    pub(crate) fn remove_connection(&self, conn: &Connection, deferred: bool) {
        let owned = self.connections.lock().unwrap().remove(&conn.conn_id());
        let Some(owned) = owned else {
            return;
        };
        if deferred {
            log::trace!("scheduling deferred connection destruction");
            let mut queue = self.pending_drops.lock().unwrap();
            queue.push_back(owned);
            self.pending_cv.notify_all();
        } else {
            drop(owned);
        }
    }

    /// Watch `pid` on behalf of `conn`. The OS-level registration happens
    /// once per PID and fans out to every watching connection.
    pub(crate) fn add_monitor(&self, pid: u32, conn_id: u64, conn: Weak<Connection>) {
        if pid == 0 {
            return;
        }
        let mut maps = self.monitors.lock().unwrap();
        if !maps.registrations.contains_key(&pid) {
            let events: Weak<dyn ProcessEvents> = self.self_weak.clone();
            let cookie = self.lifetime.register_monitor(pid, events);
            if cookie == 0 {
                log::warn!("could not register a lifetime monitor for process {pid}");
                return;
            }
            maps.registrations.insert(pid, cookie);
        }
        log::trace!("watching peer process {pid}");
        maps.watchers.entry(pid).or_default().push((conn_id, conn));
    }

    /// Drop every monitor entry of `conn`.
    pub(crate) fn remove_monitor(&self, conn: &Connection) {
        let mut maps = self.monitors.lock().unwrap();
        for watchers in maps.watchers.values_mut() {
            watchers.retain(|(id, _)| *id != conn.conn_id());
        }
        maps.watchers.retain(|_, watchers| !watchers.is_empty());
    }

    /// Shut down: unregister every monitor, release every connection and
    /// join the destructor thread.
    pub fn clear(&self) {
        {
            let mut maps = self.monitors.lock().unwrap();
            for (_, cookie) in maps.registrations.drain() {
                self.lifetime.unregister_monitor(cookie);
            }
            maps.watchers.clear();
        }

        // Dropping outside the lock: a connection drop joins its reception
        // thread, which may still be calling into the watchdog.
        let connections = std::mem::take(&mut *self.connections.lock().unwrap());
        drop(connections);

        self.stop.store(true, Ordering::Release);
        {
            let _queue = self.pending_drops.lock().unwrap();
            self.pending_cv.notify_all();
        }
        let handle = self.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.pending_drops.lock().unwrap().clear();
    }
}

impl ProcessEvents for Watchdog {
    fn process_terminated(&self, pid: u32, _exit_code: i64) {
        let affected: Vec<Arc<Connection>> = {
            let mut maps = self.monitors.lock().unwrap();
            if let Some(cookie) = maps.registrations.remove(&pid) {
                self.lifetime.unregister_monitor(cookie);
            }
            maps.watchers
                .remove(&pid)
                .map(|watchers| {
                    watchers
                        .into_iter()
                        .filter_map(|(_, weak)| weak.upgrade())
                        .collect()
                })
                .unwrap_or_default()
        };

        for conn in affected {
            log::info!("peer process {pid} vanished, forcing disconnect");
            conn.peer_vanished();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Normally cleared by the manager; the reaper only holds a weak
        // reference, so it winds down on its own either way.
        self.stop.store(true, Ordering::Release);
    }
}

/// Destructor thread: drains deferred connection drops, releasing each
/// reference outside any lock.
fn reaper_thread(weak: Weak<Watchdog>) {
    loop {
        let Some(watchdog) = weak.upgrade() else {
            break;
        };

        let mut queue = watchdog.pending_drops.lock().unwrap();
        if queue.is_empty() {
            if watchdog.stop.load(Ordering::Acquire) {
                break;
            }
            let (q, _res) = watchdog
                .pending_cv
                .wait_timeout(queue, REAP_INTERVAL)
                .unwrap();
            queue = q;
        }

        while let Some(conn) = queue.pop_front() {
            drop(queue);
            log::trace!("releasing deferred connection");
            drop(conn);
            queue = watchdog.pending_drops.lock().unwrap();
        }
    }
}
