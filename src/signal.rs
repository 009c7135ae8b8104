// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named cross-process signal used by the ring accessors to sleep until the
// peer commits data or frees space. POSIX: process-shared pthread condvar
// in shared memory. Windows: named auto-reset event.

use std::io;

use crate::platform::PlatformSignal;

/// A named, inter-process signal.
///
/// The waiting side checks its ring-state predicate first and then blocks
/// with a bounded timeout; a wakeup lost in the gap between check and wait
/// costs at most one timeout round, never a stall.
pub struct IpcSignal {
    inner: PlatformSignal,
}

impl IpcSignal {
    /// Open (or create) a named signal.
    pub fn open(name: &str) -> io::Result<Self> {
        Ok(Self {
            inner: PlatformSignal::open(name)?,
        })
    }

    /// Wake every waiter.
    pub fn notify_all(&self) -> io::Result<()> {
        self.inner.notify_all()
    }

    /// Block until notified or until `timeout_ms` elapses.
    /// Returns `Ok(true)` when signalled, `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: u64) -> io::Result<bool> {
        self.inner.wait(timeout_ms)
    }

    /// Remove the backing storage of a named signal.
    pub fn clear_storage(name: &str) {
        PlatformSignal::clear_storage(name);
    }
}
