// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory IPC channels for processes on one host: lock-free SPSC
// packet rings over named shared memory, a negotiated bidirectional
// connection on top, and a watchdog that tears connections down when the
// peer process dies.

pub mod names;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod signal;
pub use signal::IpcSignal;

mod error;
pub use error::{ChannelError, Result};

pub mod protocol;

pub mod ring;
pub use ring::{ReadHandle, Reservation, RingRegion, RingRx, RingTx};

mod inproc;
pub use inproc::InProcRegion;

mod region;
pub use region::SharedRegion;

pub mod descriptor;
pub use descriptor::{ChannelDescriptor, Direction, EndpointConfig, RegionSpec};

mod connection;
pub use connection::{ConnectStatus, Connection, DataReceiver, Role, StatusObserver};

mod process;
pub use process::{is_alive, ProcessEvents, ProcessLifetime, ProcessMonitor};

mod watchdog;
pub use watchdog::Watchdog;

mod manager;
pub use manager::{ChannelManager, Endpoint, DEFAULT_RING_SIZE, NAMED_RING_SIZE};
