// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A bidirectional channel over two shared-memory rings: one transmit, one
// receive. A reception thread drives the protocol state machine; user data
// travels as chunk sequences, fragmented when a message exceeds a quarter
// of the ring. Observers registered on the connection are told about every
// status transition.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::descriptor::{ChannelDescriptor, Direction};
use crate::error::{ChannelError, Result};
use crate::names;
use crate::protocol::{self, MsgKind, CONNECT_HDR_SIZE, FRAGMENT_HDR_SIZE, MSG_HDR_SIZE};
use crate::region::SharedRegion;
use crate::ring::{RingRx, RingTx, RESERVE_TIMEOUT_MS};
use crate::watchdog::Watchdog;

/// A client in `initialized` state repeats its sync request this often.
const SYNC_RETRY: Duration = Duration::from_millis(500);

/// Bounded wait of the reception thread when the ring is empty.
const DATA_WAIT_MS: u64 = 10;

/// How long `async_connect` waits for the reception thread to confirm.
const START_TIMEOUT: Duration = Duration::from_millis(1000);

#[cfg(feature = "decoupled-delivery")]
const DELIVERY_QUEUE_LIMIT: usize = 16;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection status published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectStatus {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Connecting = 3,
    Negotiating = 4,
    ConnectionError = 5,
    Connected = 6,
    CommunicationError = 7,
    Disconnected = 8,
    DisconnectedForced = 9,
    Terminating = 10,
}

impl ConnectStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Initialized,
            3 => Self::Connecting,
            4 => Self::Negotiating,
            5 => Self::ConnectionError,
            6 => Self::Connected,
            7 => Self::CommunicationError,
            8 => Self::Disconnected,
            9 => Self::DisconnectedForced,
            _ => Self::Terminating,
        }
    }
}

/// Which end of the channel this connection is. The server waits for the
/// client's sync request; the client initiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Sink for received chunk sequences.
pub trait DataReceiver: Send + Sync {
    fn receive_data(&self, chunks: Vec<Vec<u8>>);
}

/// Observer of connection status transitions.
pub trait StatusObserver: Send + Sync {
    fn set_status(&self, status: ConnectStatus);
}

/// Removed observers leave a tombstone so unregistering during a status
/// fan-out stays safe.
struct ObserverEntry {
    cookie: u64,
    observer: Option<Arc<dyn StatusObserver>>,
}

/// Reassembly state of the message currently being received.
#[derive(Default)]
struct ReassemblyContext {
    active: bool,
    total_size: u32,
    chunks: Vec<Vec<u8>>,
    chunk_index: usize,
    chunk_offset: usize,
}

#[cfg(feature = "decoupled-delivery")]
struct DeliveryQueue {
    queue: Mutex<std::collections::VecDeque<Vec<Vec<u8>>>>,
    available: Condvar,
    processed: Condvar,
}

pub struct Connection {
    id: u64,
    self_weak: Weak<Connection>,
    watchdog: Weak<Watchdog>,
    role: Role,
    own_pid: u32,
    sender: RingTx,
    receiver: RingRx,
    sender_spec: crate::descriptor::RegionSpec,
    receiver_spec: crate::descriptor::RegionSpec,
    status: AtomicU32,
    started: AtomicBool,
    data_receiver: Mutex<Option<Arc<dyn DataReceiver>>>,
    observers: RwLock<Vec<ObserverEntry>>,
    send_access: Mutex<()>,
    connect_lock: Mutex<()>,
    connect_cv: Condvar,
    start_cv: Condvar,
    wait_cancelled: AtomicBool,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
    recv_thread_id: Mutex<Option<std::thread::ThreadId>>,
    #[cfg(feature = "decoupled-delivery")]
    delivery: DeliveryQueue,
    #[cfg(feature = "decoupled-delivery")]
    delivery_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Build a connection over freshly created (server) or existing
    /// (client) named rings derived from `base_name`. `size` is the total
    /// byte count of each ring region, header included; ignored when
    /// opening existing rings.
    pub(crate) fn create(
        watchdog: &Arc<Watchdog>,
        size: u32,
        base_name: &str,
        role: Role,
    ) -> Result<Arc<Self>> {
        let request = names::region_spec(base_name, Direction::Request);
        let response = names::region_spec(base_name, Direction::Response);

        let (tx_region, rx_region) = match role {
            Role::Server => (
                SharedRegion::create(response, size)?,
                SharedRegion::create(request, size)?,
            ),
            Role::Client => (SharedRegion::open(request)?, SharedRegion::open(response)?),
        };

        log::debug!(
            "{} connection over rings '{}' / '{}'",
            if role == Role::Server { "server" } else { "client" },
            tx_region.spec().location,
            rx_region.spec().location,
        );

        Self::assemble(watchdog, tx_region, rx_region, role)
    }

    /// Attach to the rings named by a parsed connection descriptor. The
    /// accessing side transmits on the `request` ring and receives on the
    /// `response` ring.
    pub(crate) fn access(watchdog: &Arc<Watchdog>, desc: &ChannelDescriptor) -> Result<Arc<Self>> {
        let request = desc
            .param(Direction::Request)
            .ok_or_else(|| ChannelError::InvalidConfig("descriptor lacks a request ring".into()))?
            .clone();
        let response = desc
            .param(Direction::Response)
            .ok_or_else(|| ChannelError::InvalidConfig("descriptor lacks a response ring".into()))?
            .clone();

        let tx_region = SharedRegion::open(request)?;
        let rx_region = SharedRegion::open(response)?;
        Self::assemble(watchdog, tx_region, rx_region, Role::Client)
    }

    fn assemble(
        watchdog: &Arc<Watchdog>,
        tx_region: Arc<SharedRegion>,
        rx_region: Arc<SharedRegion>,
        role: Role,
    ) -> Result<Arc<Self>> {
        let sender_spec = tx_region.spec().clone();
        let receiver_spec = rx_region.spec().clone();
        let sender = RingTx::new(tx_region)?;
        let receiver = RingRx::new(rx_region)?;
        let own_pid = watchdog.lifetime().current_pid();
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new_cyclic(|weak| Self {
            id,
            self_weak: weak.clone(),
            watchdog: Arc::downgrade(watchdog),
            role,
            own_pid,
            sender,
            receiver,
            sender_spec,
            receiver_spec,
            status: AtomicU32::new(ConnectStatus::Uninitialized as u32),
            started: AtomicBool::new(false),
            data_receiver: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            send_access: Mutex::new(()),
            connect_lock: Mutex::new(()),
            connect_cv: Condvar::new(),
            start_cv: Condvar::new(),
            wait_cancelled: AtomicBool::new(false),
            recv_thread: Mutex::new(None),
            recv_thread_id: Mutex::new(None),
            #[cfg(feature = "decoupled-delivery")]
            delivery: DeliveryQueue {
                queue: Mutex::new(std::collections::VecDeque::new()),
                available: Condvar::new(),
                processed: Condvar::new(),
            },
            #[cfg(feature = "decoupled-delivery")]
            delivery_thread: Mutex::new(None),
        }))
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.id
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn status(&self) -> ConnectStatus {
        ConnectStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    /// The descriptor text an accessor needs to attach to this channel.
    pub fn connection_string(&self) -> String {
        ChannelDescriptor::new(vec![self.sender_spec.clone(), self.receiver_spec.clone()])
            .serialize()
    }

    // -----------------------------------------------------------------
    // Connect surface
    // -----------------------------------------------------------------

    /// Start the reception thread and begin the handshake. Succeeds once
    /// the thread has confirmed startup; track progress via observers or
    /// [`wait_for_connection`].
    ///
    /// [`wait_for_connection`]: Connection::wait_for_connection
    pub fn async_connect(&self, receiver: Arc<dyn DataReceiver>) -> Result<()> {
        // Claim the uninitialized slot atomically; no lock may be held
        // while observers run.
        if self
            .status
            .compare_exchange(
                ConnectStatus::Uninitialized as u32,
                ConnectStatus::Initializing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Publish without storing; the stored state is still accurate.
            self.publish_only(ConnectStatus::ConnectionError);
            return Err(ChannelError::Protocol(
                "connection was already started".into(),
            ));
        }
        self.publish_only(ConnectStatus::Initializing);

        *self.data_receiver.lock().unwrap() = Some(receiver);
        self.set_status(ConnectStatus::Initialized);

        let weak = self.self_weak.clone();
        let handle = std::thread::spawn(move || reception_thread(weak));
        *self.recv_thread.lock().unwrap() = Some(handle);

        #[cfg(feature = "decoupled-delivery")]
        {
            let weak = self.self_weak.clone();
            let handle = std::thread::spawn(move || delivery_thread(weak));
            *self.delivery_thread.lock().unwrap() = Some(handle);
        }

        let guard = self.connect_lock.lock().unwrap();
        if !self.started.load(Ordering::Acquire) {
            let (guard, _res) = self.start_cv.wait_timeout(guard, START_TIMEOUT).unwrap();
            drop(guard);
        } else {
            drop(guard);
        }

        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ChannelError::Protocol(
                "reception thread did not start".into(),
            ))
        }
    }

    /// Block until the handshake reaches `connected`. `None` waits without
    /// bound; use [`cancel_wait`] to unblock.
    ///
    /// [`cancel_wait`]: Connection::cancel_wait
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> bool {
        self.wait_cancelled.store(false, Ordering::Release);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut guard = self.connect_lock.lock().unwrap();
        loop {
            if self.status() == ConnectStatus::Connected {
                return true;
            }
            if self.wait_cancelled.load(Ordering::Acquire) {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (g, _res) = self
                        .connect_cv
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    guard = g;
                }
                None => {
                    guard = self.connect_cv.wait(guard).unwrap();
                }
            }
        }
    }

    /// Unblock a thread sitting in [`wait_for_connection`].
    ///
    /// [`wait_for_connection`]: Connection::wait_for_connection
    pub fn cancel_wait(&self) {
        self.wait_cancelled.store(true, Ordering::Release);
        let _guard = self.connect_lock.lock().unwrap();
        self.connect_cv.notify_all();
    }

    /// Leave the connected state and tell the peer. An in-flight send
    /// completes or fails on its own.
    pub fn disconnect(&self) {
        self.cancel_wait();
        let previous = self.status();
        self.set_status(ConnectStatus::Disconnected);
        *self.data_receiver.lock().unwrap() = None;

        if matches!(
            previous,
            ConnectStatus::Connecting | ConnectStatus::Negotiating | ConnectStatus::Connected
        ) {
            self.send_control(MsgKind::ConnectTerm);
        }
    }

    /// Stop the worker threads, drop all observers and hand the connection
    /// back to the watchdog. When called from the connection's own
    /// reception thread the final release is deferred to the watchdog's
    /// destructor thread, so the thread never outlives its connection.
    pub fn destroy(&self) {
        self.disconnect();
        self.set_status(ConnectStatus::Terminating);

        {
            let mut list = self.observers.write().unwrap();
            for entry in list.iter_mut() {
                entry.observer = None;
            }
        }

        let Some(watchdog) = self.watchdog.upgrade() else {
            return;
        };
        watchdog.remove_monitor(self);

        let on_recv_thread = self
            .recv_thread_id
            .lock()
            .unwrap()
            .map_or(false, |id| id == std::thread::current().id());
        watchdog.remove_connection(self, on_recv_thread);
    }

    // -----------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------

    /// Register a status observer; returns its non-zero cookie. New
    /// observers are called first.
    pub fn register_status_observer(&self, observer: Arc<dyn StatusObserver>) -> u64 {
        let mut cookie: u64 = rand::rng().random();
        if cookie == 0 {
            cookie = 1;
        }
        let mut list = self.observers.write().unwrap();
        list.insert(
            0,
            ObserverEntry {
                cookie,
                observer: Some(observer),
            },
        );
        cookie
    }

    /// Drop the observer registered under `cookie`. Safe to call from
    /// within a status callback.
    pub fn unregister_status_observer(&self, cookie: u64) {
        let mut list = self.observers.write().unwrap();
        if let Some(entry) = list.iter_mut().find(|e| e.cookie == cookie) {
            entry.observer = None;
        }
    }

    /// Store (unless transient) and publish a status transition.
    pub(crate) fn set_status(&self, status: ConnectStatus) {
        if self.status() == ConnectStatus::Terminating {
            return;
        }
        log::trace!(
            "{} status {:?} -> {:?}",
            if self.is_server() { "server" } else { "client" },
            self.status(),
            status
        );
        // A communication error is published but never stored; the state
        // keeps its previous live value so the channel can recover.
        if status != ConnectStatus::CommunicationError {
            self.status.store(status as u32, Ordering::Release);
        }
        self.publish_only(status);
    }

    fn publish_only(&self, status: ConnectStatus) {
        let snapshot: Vec<Arc<dyn StatusObserver>> = self
            .observers
            .read()
            .unwrap()
            .iter()
            .filter_map(|e| e.observer.clone())
            .collect();
        for observer in snapshot {
            observer.set_status(status);
        }
    }

    /// Watchdog notification: the peer process no longer exists.
    pub(crate) fn peer_vanished(&self) {
        self.set_status(ConnectStatus::DisconnectedForced);
        self.set_status(ConnectStatus::Disconnected);
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Send a sequence of chunks. Chunk boundaries are preserved end to
    /// end; the payload is fragmented transparently when it exceeds a
    /// quarter of the ring.
    pub fn send_data(&self, chunks: &[Vec<u8>]) -> Result<()> {
        if self.status() != ConnectStatus::Connected {
            self.set_status(ConnectStatus::CommunicationError);
            return Err(ChannelError::NotConnected);
        }

        // Chunk-size table: count, then one size per chunk. The table is
        // the only copy; application chunks are walked in place.
        let mut table = Vec::with_capacity((chunks.len() + 1) * 4);
        table.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        let mut required: u64 = 4;
        for chunk in chunks {
            table.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            required += 4 + chunk.len() as u64;
        }
        if required > u32::MAX as u64 {
            return Err(ChannelError::Protocol(
                "chunk sequence exceeds the 4 GiB message limit".into(),
            ));
        }
        let required = required as u32;

        let _send_guard = self.send_access.lock().unwrap();

        let fragment_size = self.sender.size() / 4;
        let fragmented = required > fragment_size;
        if fragmented && table.len() as u32 > fragment_size {
            return Err(ChannelError::Protocol(
                "chunk table does not fit the first fragment".into(),
            ));
        }

        let mut walker = ChunkWalker::new(&table, chunks);
        let mut offset = 0u32;
        while offset < required {
            let (data_size, hdr_size) = if fragmented {
                (fragment_size.min(required - offset), FRAGMENT_HDR_SIZE)
            } else {
                (required, MSG_HDR_SIZE)
            };

            let mut packet = match self.sender.reserve(data_size + hdr_size, RESERVE_TIMEOUT_MS) {
                Ok(packet) => packet,
                Err(e) => {
                    if self.status() == ConnectStatus::Connected {
                        log::error!(
                            "could not reserve {} bytes for a data message: {e}",
                            data_size + hdr_size
                        );
                    }
                    // Observers run outside the send mutex.
                    drop(_send_guard);
                    self.set_status(ConnectStatus::CommunicationError);
                    return Err(e);
                }
            };

            let payload = packet.payload();
            if fragmented {
                protocol::write_fragment_hdr(payload, required, offset);
            } else {
                protocol::write_msg_hdr(payload, MsgKind::Data);
            }
            walker.copy_into(&mut payload[hdr_size as usize..]);
            packet.commit();

            offset += data_size;
        }

        Ok(())
    }

    fn send_control(&self, kind: MsgKind) -> bool {
        self.send_raw(&protocol::control_msg(kind))
    }

    fn send_raw(&self, bytes: &[u8]) -> bool {
        match self.sender.try_write(bytes) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to send a message of {} bytes: {e}", bytes.len());
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Reception
    // -----------------------------------------------------------------

    fn poll_receive(&self, ctx: &mut ReassemblyContext, last_sync: &mut Option<Instant>) {
        let packet = match self.receiver.try_read() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                // The client drives the handshake; the server stays quiet
                // until a request arrives so it cannot fill its own ring
                // while no peer is reading.
                if self.role == Role::Client && self.status() == ConnectStatus::Initialized {
                    let due = last_sync.map_or(true, |t| t.elapsed() >= SYNC_RETRY);
                    if due {
                        *last_sync = Some(Instant::now());
                        self.send_control(MsgKind::SyncRequest);
                    }
                }
                self.receiver.wait_for_data(DATA_WAIT_MS);
                return;
            }
            Err(e) => {
                log::error!("ring read failed: {e}");
                self.set_status(ConnectStatus::CommunicationError);
                self.receiver.wait_for_data(DATA_WAIT_MS);
                return;
            }
        };

        let data = packet.payload();
        let Some(hdr) = protocol::parse_msg(data) else {
            log::error!("received message with invalid size or kind");
            self.set_status(ConnectStatus::CommunicationError);
            return;
        };

        if self.status() == ConnectStatus::Terminating {
            return;
        }

        match hdr.kind {
            MsgKind::SyncRequest => self.on_sync_request(hdr.version, data),
            MsgKind::SyncAnswer => self.on_sync_answer(hdr.version),
            MsgKind::ConnectRequest => self.on_connect_request(data),
            MsgKind::ConnectAnswer => self.on_connect_answer(data),
            MsgKind::ConnectTerm => {
                self.on_connect_term();
                *last_sync = Some(Instant::now());
            }
            MsgKind::Data => self.on_data(data, ctx),
            MsgKind::DataFragment => self.on_data_fragment(data, ctx),
        }
    }

    fn on_sync_request(&self, version: u32, data: &[u8]) {
        if data.len() != MSG_HDR_SIZE as usize {
            self.set_status(ConnectStatus::ConnectionError);
            log::error!(
                "sync request of {} bytes, expected {MSG_HDR_SIZE}",
                data.len()
            );
            self.set_status(ConnectStatus::Disconnected);
            return;
        }
        if version != protocol::CHANNEL_VERSION {
            self.set_status(ConnectStatus::ConnectionError);
            log::error!(
                "sync request for incompatible channel version {version}, local is {}",
                protocol::CHANNEL_VERSION
            );
            self.set_status(ConnectStatus::Disconnected);
            return;
        }
        if matches!(
            self.status(),
            ConnectStatus::Disconnected | ConnectStatus::Initialized
        ) {
            self.set_status(ConnectStatus::Connecting);
            self.send_control(MsgKind::SyncAnswer);
        }
    }

    fn on_sync_answer(&self, version: u32) {
        if !matches!(
            self.status(),
            ConnectStatus::Disconnected | ConnectStatus::Initialized
        ) {
            return;
        }
        if version != protocol::CHANNEL_VERSION {
            self.set_status(ConnectStatus::CommunicationError);
            log::error!(
                "sync answer for incompatible channel version {version}, local is {}",
                protocol::CHANNEL_VERSION
            );
            self.set_status(ConnectStatus::Disconnected);
            return;
        }
        self.set_status(ConnectStatus::Negotiating);
        self.send_raw(&protocol::connect_msg(MsgKind::ConnectRequest, self.own_pid));
    }

    fn on_connect_request(&self, data: &[u8]) {
        if self.status() != ConnectStatus::Connecting {
            return;
        }
        debug_assert!(data.len() >= CONNECT_HDR_SIZE as usize);
        self.add_peer_monitor(protocol::connect_pid(data));
        self.set_status(ConnectStatus::Negotiating);
        self.send_raw(&protocol::connect_msg(MsgKind::ConnectAnswer, self.own_pid));
        self.set_status(ConnectStatus::Connected);
        self.notify_connected();
    }

    fn on_connect_answer(&self, data: &[u8]) {
        if self.status() != ConnectStatus::Negotiating {
            return;
        }
        self.add_peer_monitor(protocol::connect_pid(data));
        self.set_status(ConnectStatus::Connected);
        self.notify_connected();
    }

    fn on_connect_term(&self) {
        self.set_status(ConnectStatus::Disconnected);
        if let Some(watchdog) = self.watchdog.upgrade() {
            watchdog.remove_monitor(self);
        }

        // Abort any blocked send and skip whatever the departed peer left
        // unread; a reconnect must start from a clean ring.
        self.sender.cancel_send();
        self.sender.reset_rx();

        // Answer a very short-lived connection right away instead of
        // waiting for the next client round.
        if self.role == Role::Server {
            self.send_control(MsgKind::SyncRequest);
        }
    }

    fn add_peer_monitor(&self, pid: u32) {
        if let Some(watchdog) = self.watchdog.upgrade() {
            watchdog.add_monitor(pid, self.id, self.self_weak.clone());
        }
    }

    fn notify_connected(&self) {
        let _guard = self.connect_lock.lock().unwrap();
        self.connect_cv.notify_all();
    }

    fn on_data(&self, data: &[u8], ctx: &mut ReassemblyContext) {
        let Some(offset) = self.read_data_table(data, MsgKind::Data, ctx) else {
            self.set_status(ConnectStatus::CommunicationError);
            return;
        };
        if !read_data_chunk(data, offset, ctx) {
            self.set_status(ConnectStatus::CommunicationError);
            return;
        }
        self.dispatch_if_complete(ctx);
    }

    fn on_data_fragment(&self, data: &[u8], ctx: &mut ReassemblyContext) {
        let (_total, fragment_offset) = protocol::fragment_info(data);

        // The first fragment carries the chunk table; later ones are pure
        // payload behind their header.
        let offset = if fragment_offset == 0 {
            match self.read_data_table(data, MsgKind::DataFragment, ctx) {
                Some(offset) => offset,
                None => {
                    self.set_status(ConnectStatus::CommunicationError);
                    return;
                }
            }
        } else {
            FRAGMENT_HDR_SIZE as usize
        };

        if !read_data_chunk(data, offset, ctx) {
            self.set_status(ConnectStatus::CommunicationError);
            return;
        }
        self.dispatch_if_complete(ctx);
    }

    /// Parse the chunk-size table leading a data message and allocate the
    /// chunk buffers. Returns the payload offset following the table.
    fn read_data_table(
        &self,
        data: &[u8],
        kind: MsgKind,
        ctx: &mut ReassemblyContext,
    ) -> Option<usize> {
        let mut offset = match kind {
            MsgKind::Data => {
                ctx.total_size = data.len() as u32 - MSG_HDR_SIZE;
                MSG_HDR_SIZE as usize
            }
            MsgKind::DataFragment => {
                let (total, fragment_offset) = protocol::fragment_info(data);
                if fragment_offset != 0 {
                    return None; // table travels in the first fragment only
                }
                ctx.total_size = total;
                FRAGMENT_HDR_SIZE as usize
            }
            _ => return None,
        };

        if data.len() < offset + 4 {
            return None;
        }
        let count = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;

        if count > (data.len() - offset) / 4 {
            return None;
        }
        let mut sizes = Vec::with_capacity(count);
        let mut payload_total: u64 = 4 + 4 * count as u64;
        for _ in 0..count {
            let size = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            sizes.push(size as usize);
            payload_total += size as u64;
            offset += 4;
        }
        if payload_total != ctx.total_size as u64 {
            return None;
        }

        ctx.chunks = sizes.into_iter().map(|size| vec![0u8; size]).collect();
        ctx.chunk_index = 0;
        ctx.chunk_offset = 0;
        ctx.active = true;
        Some(offset)
    }

    fn dispatch_if_complete(&self, ctx: &mut ReassemblyContext) {
        if !ctx.active || ctx.chunk_index < ctx.chunks.len() {
            return;
        }
        let chunks = std::mem::take(&mut ctx.chunks);
        *ctx = ReassemblyContext::default();
        self.deliver(chunks);
    }

    #[cfg(not(feature = "decoupled-delivery"))]
    fn deliver(&self, chunks: Vec<Vec<u8>>) {
        let receiver = self.data_receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.receive_data(chunks);
        }
    }

    #[cfg(feature = "decoupled-delivery")]
    fn deliver(&self, chunks: Vec<Vec<u8>>) {
        let mut queue = self.delivery.queue.lock().unwrap();
        while queue.len() >= DELIVERY_QUEUE_LIMIT {
            if self.status() == ConnectStatus::Terminating {
                return;
            }
            let (q, _res) = self
                .delivery
                .processed
                .wait_timeout(queue, Duration::from_millis(100))
                .unwrap();
            queue = q;
        }
        queue.push_back(chunks);
        self.delivery.available.notify_all();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.status() == ConnectStatus::Connected {
            self.disconnect();
        }
        self.status
            .store(ConnectStatus::Terminating as u32, Ordering::Release);

        let handle = self.recv_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }

        #[cfg(feature = "decoupled-delivery")]
        {
            let handle = self.delivery_thread.lock().unwrap().take();
            if let Some(handle) = handle {
                if std::thread::current().id() != handle.thread().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

/// Walks the virtual byte sequence `[table, chunk 0, chunk 1, ...]` across
/// packet boundaries without concatenating it.
struct ChunkWalker<'a> {
    table: &'a [u8],
    chunks: &'a [Vec<u8>],
    part: usize, // 0 = table, n = chunks[n - 1]
    pos: usize,
}

impl<'a> ChunkWalker<'a> {
    fn new(table: &'a [u8], chunks: &'a [Vec<u8>]) -> Self {
        Self {
            table,
            chunks,
            part: 0,
            pos: 0,
        }
    }

    fn current(&self) -> Option<&'a [u8]> {
        if self.part == 0 {
            Some(self.table)
        } else {
            self.chunks.get(self.part - 1).map(|c| c.as_slice())
        }
    }

    /// Fill `dst` completely from the remaining sequence.
    fn copy_into(&mut self, mut dst: &mut [u8]) {
        while !dst.is_empty() {
            let Some(part) = self.current() else {
                break;
            };
            let avail = part.len() - self.pos;
            let n = avail.min(dst.len());
            dst[..n].copy_from_slice(&part[self.pos..self.pos + n]);
            dst = &mut dst[n..];
            self.pos += n;
            if self.pos >= part.len() {
                self.part += 1;
                self.pos = 0;
            }
        }
    }
}

/// Copy the payload bytes of one message into the reassembly buffers,
/// advancing across chunk boundaries.
fn read_data_chunk(data: &[u8], mut offset: usize, ctx: &mut ReassemblyContext) -> bool {
    if !ctx.active || offset < MSG_HDR_SIZE as usize {
        return false;
    }

    while offset < data.len() && ctx.chunk_index < ctx.chunks.len() {
        let chunk = &mut ctx.chunks[ctx.chunk_index];
        if ctx.chunk_offset > chunk.len() {
            return false;
        }
        let wanted = chunk.len() - ctx.chunk_offset;
        let avail = data.len() - offset;
        let n = wanted.min(avail);
        chunk[ctx.chunk_offset..ctx.chunk_offset + n].copy_from_slice(&data[offset..offset + n]);
        offset += n;
        ctx.chunk_offset += n;

        if ctx.chunk_offset >= chunk.len() {
            ctx.chunk_offset = 0;
            ctx.chunk_index += 1;
        }
    }

    // Zero-length chunks at the tail carry no bytes to trigger the walk.
    while ctx.chunk_index < ctx.chunks.len()
        && ctx.chunks[ctx.chunk_index].is_empty()
        && ctx.chunk_offset == 0
    {
        ctx.chunk_index += 1;
    }

    true
}

#[cfg(windows)]
fn raise_thread_priority() {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
    };
    unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL) };
}

/// Body of the reception thread. Holds only a weak reference between loop
/// rounds so the connection can be released while the thread is parked.
fn reception_thread(weak: Weak<Connection>) {
    let Some(conn) = weak.upgrade() else {
        return;
    };

    #[cfg(windows)]
    raise_thread_priority();

    *conn.recv_thread_id.lock().unwrap() = Some(std::thread::current().id());
    {
        let _guard = conn.connect_lock.lock().unwrap();
        conn.started.store(true, Ordering::Release);
        conn.start_cv.notify_all();
    }
    log::trace!(
        "{} reception thread running",
        if conn.is_server() { "server" } else { "client" }
    );
    drop(conn);

    let mut ctx = ReassemblyContext::default();
    let mut last_sync: Option<Instant> = None;

    loop {
        let Some(conn) = weak.upgrade() else {
            break;
        };
        if conn.status() == ConnectStatus::Terminating {
            break;
        }
        conn.poll_receive(&mut ctx, &mut last_sync);
    }
}

#[cfg(feature = "decoupled-delivery")]
fn delivery_thread(weak: Weak<Connection>) {
    loop {
        let Some(conn) = weak.upgrade() else {
            break;
        };
        if conn.status() == ConnectStatus::Terminating {
            break;
        }

        let chunks = {
            let mut queue = conn.delivery.queue.lock().unwrap();
            if queue.is_empty() {
                let (q, _res) = conn
                    .delivery
                    .available
                    .wait_timeout(queue, Duration::from_millis(5))
                    .unwrap();
                queue = q;
            }
            queue.pop_front()
        };

        if let Some(chunks) = chunks {
            let receiver = conn.data_receiver.lock().unwrap().clone();
            if let Some(receiver) = receiver {
                receiver.receive_data(chunks);
            }
            conn.delivery.processed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_walker_crosses_part_boundaries() {
        let table = [1u8, 2, 3];
        let chunks = vec![vec![4u8, 5], vec![], vec![6u8, 7, 8]];
        let mut walker = ChunkWalker::new(&table, &chunks);

        let mut first = [0u8; 4];
        walker.copy_into(&mut first);
        assert_eq!(first, [1, 2, 3, 4]);

        let mut rest = [0u8; 4];
        walker.copy_into(&mut rest);
        assert_eq!(rest, [5, 6, 7, 8]);
    }

    #[test]
    fn reassembly_handles_split_chunks() {
        let mut ctx = ReassemblyContext {
            active: true,
            total_size: 0,
            chunks: vec![vec![0u8; 3], vec![0u8; 2]],
            chunk_index: 0,
            chunk_offset: 0,
        };

        // 8-byte header, then payload split mid-chunk across two packets.
        let mut first = vec![0u8; MSG_HDR_SIZE as usize];
        first.extend_from_slice(&[10, 11]);
        assert!(read_data_chunk(&first, MSG_HDR_SIZE as usize, &mut ctx));
        assert_eq!(ctx.chunk_index, 0);
        assert_eq!(ctx.chunk_offset, 2);

        let mut second = vec![0u8; MSG_HDR_SIZE as usize];
        second.extend_from_slice(&[12, 20, 21]);
        assert!(read_data_chunk(&second, MSG_HDR_SIZE as usize, &mut ctx));
        assert_eq!(ctx.chunk_index, 2);
        assert_eq!(ctx.chunks, vec![vec![10, 11, 12], vec![20, 21]]);
    }
}
