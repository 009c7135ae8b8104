// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public entry point of the subsystem: builds server endpoints with their
// descriptor text, attaches accessors to published descriptors, and keeps
// every connection registered with the watchdog.

use std::sync::Arc;

use crate::connection::{Connection, Role};
use crate::descriptor::{self, ChannelDescriptor, EndpointConfig};
use crate::error::{ChannelError, Result};
use crate::names;
use crate::process::{ProcessLifetime, ProcessMonitor};
use crate::ring::align8;
use crate::watchdog::Watchdog;

/// Ring size (per direction, header included) when the endpoint
/// configuration names no channel.
pub const DEFAULT_RING_SIZE: u32 = 10 * 1024;

/// Ring size when the configuration names a channel but no size.
pub const NAMED_RING_SIZE: u32 = 128 * 1024;

/// A created server endpoint: the connection itself plus the descriptor
/// text an accessor needs to attach.
pub struct Endpoint {
    pub connection: Arc<Connection>,
    pub descriptor: String,
}

pub struct ChannelManager {
    watchdog: Arc<Watchdog>,
    lifetime: Arc<dyn ProcessLifetime>,
}

impl ChannelManager {
    /// Build a manager around an injected process-lifetime source.
    pub fn new(lifetime: Arc<dyn ProcessLifetime>) -> Self {
        let watchdog = Watchdog::new(lifetime.clone());
        Self { watchdog, lifetime }
    }

    /// Build a manager with the built-in polling process monitor.
    pub fn with_default_monitor() -> Self {
        Self::new(ProcessMonitor::new())
    }

    /// Create a server endpoint.
    ///
    /// The optional configuration recognises `IpcChannel.Name` (base name
    /// of the OS objects; random when absent) and `IpcChannel.Size` (bytes
    /// per ring; 10 KiB unnamed, 128 KiB named).
    pub fn create_endpoint(&self, config: Option<&str>) -> Result<Endpoint> {
        let mut name = None;
        let mut size = DEFAULT_RING_SIZE;
        if let Some(text) = config.filter(|t| !t.trim().is_empty()) {
            let parsed = EndpointConfig::parse(text)?;
            if let Some(configured) = parsed.name {
                size = parsed.size.unwrap_or(NAMED_RING_SIZE);
                name = Some(configured);
            }
        }
        let name = name.unwrap_or_else(names::random_channel_name);
        let size = align8(size);

        let connection = Connection::create(&self.watchdog, size, &name, Role::Server)?;
        self.watchdog.add_connection(connection.clone());

        Ok(Endpoint {
            descriptor: connection.connection_string(),
            connection,
        })
    }

    /// Attach to a channel.
    ///
    /// A document with a top-level `Provider` key is a connection string
    /// published by an endpoint; without one the text is read as an
    /// endpoint configuration and the named rings are opened directly
    /// (local bring-up of both ends, as used by the tests).
    pub fn access(&self, text: &str) -> Result<Arc<Connection>> {
        let connection = if descriptor::is_connection_string(text) {
            let desc = ChannelDescriptor::parse(text)?;
            Connection::access(&self.watchdog, &desc)?
        } else {
            let config = EndpointConfig::parse(text)?;
            let name = config.name.ok_or_else(|| {
                ChannelError::InvalidConfig("endpoint configuration lacks IpcChannel.Name".into())
            })?;
            Connection::create(&self.watchdog, 0, &name, Role::Client)?
        };

        self.watchdog.add_connection(connection.clone());
        Ok(connection)
    }

    /// Release every connection, stop the watchdog and shut the lifetime
    /// source down.
    pub fn shutdown(&self) {
        self.watchdog.clear();
        self.lifetime.shutdown();
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
