// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// In-process ring region: a heap allocation plus a pair of condition
// variables standing in for the named OS signals. Carries the same accessor
// contract as the shared-memory region, which makes it the natural harness
// for exercising the ring without touching OS objects.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{ChannelError, Result};
use crate::ring::{self, RingRegion, RING_HDR_SIZE};

struct SyncPoint {
    lock: Mutex<()>,
    cv: Condvar,
}

impl SyncPoint {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }

    fn wait(&self, timeout_ms: u64) -> bool {
        let guard = self.lock.lock().unwrap();
        let (_guard, res) = self
            .cv
            .wait_timeout(guard, Duration::from_millis(timeout_ms))
            .unwrap();
        !res.timed_out()
    }
}

/// A process-local ring region of `total_size` bytes (header included).
pub struct InProcRegion {
    buf: *mut u8,
    layout: Layout,
    data_sync: SyncPoint,
    space_sync: SyncPoint,
}

// Safety: the buffer is only touched through the accessor discipline
// (single-writer cursors, atomic packet states).
unsafe impl Send for InProcRegion {}
unsafe impl Sync for InProcRegion {}

impl InProcRegion {
    /// Allocate and initialise a fresh region. `total_size` covers the ring
    /// header; the usable area must stay 8-byte aligned.
    pub fn new(total_size: u32) -> Result<Arc<Self>> {
        if total_size <= RING_HDR_SIZE || (total_size - RING_HDR_SIZE) % 8 != 0 {
            return Err(ChannelError::InvalidConfig(format!(
                "in-process buffer size {total_size} is not usable"
            )));
        }
        let layout = Layout::from_size_align(total_size as usize, 8)
            .map_err(|e| ChannelError::InvalidConfig(e.to_string()))?;
        let buf = unsafe { alloc_zeroed(layout) };
        if buf.is_null() {
            return Err(ChannelError::InvalidRegion(
                "in-process buffer allocation failed".into(),
            ));
        }
        unsafe { ring::init_region(buf, total_size) };
        Ok(Arc::new(Self {
            buf,
            layout,
            data_sync: SyncPoint::new(),
            space_sync: SyncPoint::new(),
        }))
    }
}

impl RingRegion for InProcRegion {
    fn base(&self) -> *mut u8 {
        self.buf
    }

    fn trigger_data(&self) {
        self.data_sync.notify();
    }

    fn wait_for_data(&self, timeout_ms: u64) -> bool {
        if unsafe { ring::has_unread(self.buf) } {
            return true;
        }
        self.data_sync.wait(timeout_ms)
    }

    fn trigger_space(&self) {
        self.space_sync.notify();
    }

    fn wait_for_space(&self, timeout_ms: u64) -> bool {
        self.space_sync.wait(timeout_ms)
    }
}

impl Drop for InProcRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf, self.layout) };
    }
}
