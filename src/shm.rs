// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform shared memory handle.
// Delegates to platform::PlatformShm (POSIX or Windows).

use std::io;

use crate::platform::{PlatformShm, ShmMode};

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if the name already exists.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, inter-process shared memory region.
///
/// The mapped region carries a trailing reference counter shared between
/// all handles mapping the same segment; on POSIX the last handle to drop
/// also unlinks the name. Because of that lifetime rule, every handle an
/// accessor opens must stay alive until the owning connection is torn down.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named region of `size` user-visible bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        };
        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Open an existing named region, discovering its size from the OS.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, 0, ShmMode::Open)?;
        Ok(Self { inner })
    }

    /// Mutable pointer to the start of the user-visible region.
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// User-visible size of the region.
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Whether this handle was the first to map the segment.
    pub fn is_creator(&self) -> bool {
        self.inner.prev_ref_count() == 0
    }

    /// Number of handles currently mapping this segment.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Remove the backing object for a named segment without a handle.
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
