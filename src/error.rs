// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the shared-memory channel subsystem.

use thiserror::Error;

/// Errors surfaced by channel, ring, and manager operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Descriptor or endpoint configuration is missing required keys or
    /// names colliding objects.
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// Shared-memory attach failed or the region header did not validate.
    /// The region stays unusable; retrying on the same handle is a no-op.
    #[error("shared memory region invalid: {0}")]
    InvalidRegion(String),

    /// `reserve` gave up waiting for free space.
    #[error("ring buffer full (no space within {0} ms)")]
    ChannelFull(u64),

    /// The send side was cancelled via `cancel_send`; reserves stay refused
    /// until `reset_rx`.
    #[error("send operation cancelled")]
    Cancelled,

    /// Requested payload can never fit the ring.
    #[error("payload of {requested} bytes exceeds ring capacity of {capacity} bytes")]
    InvalidSize { requested: u32, capacity: u32 },

    /// Malformed or unexpected wire packet; the message is dropped and the
    /// connection stays alive.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Handshake version check failed.
    #[error("peer speaks channel version {peer}, local version is {local}")]
    VersionMismatch { peer: u32, local: u32 },

    /// `send_data` outside the `connected` state.
    #[error("connection is not established")]
    NotConnected,

    /// Packet header failed validation during a read scan.
    #[error("corrupt packet header at ring offset {0}")]
    Corrupt(u32),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::InvalidRegion(e.to_string())
    }
}
