// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One direction of a channel: a named shared memory region holding a ring,
// plus the two named signals its accessors block on. The server role
// creates and initialises the objects; the accessor role opens them and
// verifies the ring header.

use std::sync::Arc;

use crate::descriptor::RegionSpec;
use crate::error::{ChannelError, Result};
use crate::ring::{self, RingRegion, RING_HDR_SIZE};
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::signal::IpcSignal;

pub struct SharedRegion {
    shm: ShmHandle,
    data_sig: IpcSignal,
    space_sig: IpcSignal,
    spec: RegionSpec,
}

impl SharedRegion {
    /// Create the named objects for one ring and initialise its header.
    /// `total_size` includes the ring header.
    pub fn create(spec: RegionSpec, total_size: u32) -> Result<Arc<Self>> {
        if total_size <= RING_HDR_SIZE + ring::PACKET_HDR_SIZE
            || (total_size - RING_HDR_SIZE) % 8 != 0
        {
            return Err(ChannelError::InvalidConfig(format!(
                "ring size {total_size} is not usable"
            )));
        }

        let shm = ShmHandle::acquire(&spec.location, total_size as usize, ShmOpenMode::CreateOrOpen)
            .map_err(|e| {
                ChannelError::InvalidRegion(format!(
                    "cannot create shared memory '{}': {e}",
                    spec.location
                ))
            })?;
        if shm.is_creator() {
            unsafe { ring::init_region(shm.get(), total_size) };
        } else {
            // Name collision with a live or stale object: usable only when
            // the existing header checks out.
            unsafe { ring::validate_region(shm.get()) }?;
        }

        Self::with_signals(shm, spec)
    }

    /// Open the named objects of an existing ring and verify its header.
    pub fn open(spec: RegionSpec) -> Result<Arc<Self>> {
        let shm = ShmHandle::open_existing(&spec.location).map_err(|e| {
            ChannelError::InvalidRegion(format!(
                "cannot open shared memory '{}': {e}",
                spec.location
            ))
        })?;
        unsafe { ring::validate_region(shm.get()) }?;
        Self::with_signals(shm, spec)
    }

    fn with_signals(shm: ShmHandle, spec: RegionSpec) -> Result<Arc<Self>> {
        let data_sig = IpcSignal::open(&spec.sync_tx).map_err(|e| {
            ChannelError::InvalidRegion(format!("cannot open signal '{}': {e}", spec.sync_tx))
        })?;
        let space_sig = IpcSignal::open(&spec.sync_rx).map_err(|e| {
            ChannelError::InvalidRegion(format!("cannot open signal '{}': {e}", spec.sync_rx))
        })?;
        Ok(Arc::new(Self {
            shm,
            data_sig,
            space_sig,
            spec,
        }))
    }

    /// The OS object names of this region.
    pub fn spec(&self) -> &RegionSpec {
        &self.spec
    }

    /// Remove the backing OS objects of a region by name.
    pub fn clear_storage(spec: &RegionSpec) {
        ShmHandle::clear_storage(&spec.location);
        IpcSignal::clear_storage(&spec.sync_tx);
        IpcSignal::clear_storage(&spec.sync_rx);
    }
}

impl RingRegion for SharedRegion {
    fn base(&self) -> *mut u8 {
        self.shm.get()
    }

    fn trigger_data(&self) {
        if let Err(e) = self.data_sig.notify_all() {
            log::warn!("data signal on '{}' failed: {e}", self.spec.sync_tx);
        }
    }

    fn wait_for_data(&self, timeout_ms: u64) -> bool {
        if unsafe { ring::has_unread(self.shm.get()) } {
            return true;
        }
        self.data_sig.wait(timeout_ms).unwrap_or(false)
    }

    fn trigger_space(&self) {
        if let Err(e) = self.space_sig.notify_all() {
            log::warn!("space signal on '{}' failed: {e}", self.spec.sync_rx);
        }
    }

    fn wait_for_space(&self, timeout_ms: u64) -> bool {
        self.space_sig.wait(timeout_ms).unwrap_or(false)
    }
}
