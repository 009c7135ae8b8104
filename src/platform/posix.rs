// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX backend: named shared memory via shm_open/mmap, and named signal
// objects built from a process-shared pthread mutex + condition variable
// living in their own small shm segment.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::names;

// ---------------------------------------------------------------------------
// Process-local shm cache.
// All threads within one process that open the same named signal MUST share
// a single mmap: macOS pthread objects store pointers relative to the
// virtual address used at init time, and a second mapping of the same page
// at a different address fails with EINVAL on lock.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    local_ref: AtomicUsize,
}

pub(crate) struct ShmCache {
    map: HashMap<String, Arc<CachedShm>>,
}

fn signal_cache() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(ShmCache {
            map: HashMap::new(),
        })
    })
}

/// Acquire or reuse a cached shm handle.
///
/// On the first local open for `name`, `init_fn` runs with the shm pointer
/// while the cache lock is still held, so no other thread can touch the
/// handle before initialisation completes.
fn cached_shm_acquire<F>(
    cache: &Mutex<ShmCache>,
    name: &str,
    size: usize,
    init_fn: F,
) -> io::Result<Arc<CachedShm>>
where
    F: FnOnce(*mut u8) -> io::Result<()>,
{
    let mut c = cache.lock().unwrap();
    if let Some(entry) = c.map.get(name) {
        entry.local_ref.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let shm = PlatformShm::acquire(name, size, ShmMode::CreateOrOpen)?;
    if shm.prev_ref_count() == 0 {
        init_fn(shm.as_mut_ptr())?;
    }
    let entry = Arc::new(CachedShm {
        shm,
        local_ref: AtomicUsize::new(1),
    });
    c.map.insert(name.to_string(), Arc::clone(&entry));
    Ok(entry)
}

fn cached_shm_release(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = cache.lock().unwrap();
    if let Some(entry) = c.map.get(name) {
        let prev = entry.local_ref.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            c.map.remove(name);
        }
    }
}

fn cached_shm_purge(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = cache.lock().unwrap();
    c.map.remove(name);
}

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by the `libc` crate everywhere.
// macOS has no robust mutexes; there the owner-death case is covered by the
// watchdog tearing the connection down.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout helpers: user size rounded up, plus a trailing atomic<i32> that
// counts the handles mapping the segment.
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Trailing reference counter of a mapped region.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter)
    user_size: usize, // user-visible size
    name: String,     // POSIX name (with leading '/')
    prev_ref: i32,    // ref count before our own increment (0 = we were first)
}

// Safety: the region is process-shared by design; all cross-thread access
// goes through atomics or single-writer cursors.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

impl PlatformShm {
    /// Acquire a named shared memory region.
    ///
    /// In `Open` mode a `user_size` of 0 discovers the size of the existing
    /// object from the filesystem, which is how an accessor attaches to a
    /// ring whose descriptor names the object but not its size.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 && mode != ShmMode::Open {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = names::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;

        // For CreateOrOpen: try exclusive create first so ftruncate only
        // runs on an object we own. On macOS, ftruncate on an already-sized
        // object can zero its contents before returning EINVAL.
        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        let (total_size, user_size) = if need_truncate {
            let total = calc_size(user_size);
            let ret = unsafe { libc::ftruncate(fd, total as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            (total, user_size)
        } else if user_size == 0 {
            // Existing object, unknown size: ask the filesystem.
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            let total = st.st_size as usize;
            if total <= std::mem::size_of::<AtomicI32>() {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "shared memory object is empty",
                ));
            }
            (total, total - std::mem::size_of::<AtomicI32>())
        } else {
            (calc_size(user_size), user_size)
        };

        Self::mmap_and_finish(fd, total_size, user_size, posix_name)
    }

    fn mmap_and_finish(
        fd: i32,
        total_size: usize,
        user_size: usize,
        posix_name: String,
    ) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let prev = unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
            prev_ref: prev,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Ref count before our own increment during acquire; 0 means this
    /// handle was the first to map the segment.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        let posix_name = names::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // Last mapper also unlinks the name.
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSignal — named signal object: {pthread_mutex_t, pthread_cond_t}
// in one cached shm segment, both PROCESS_SHARED.
// ---------------------------------------------------------------------------

#[repr(C)]
struct SignalShm {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

pub struct PlatformSignal {
    cached: Arc<CachedShm>,
    name: String,
}

impl PlatformSignal {
    pub fn open(name: &str) -> io::Result<Self> {
        let shm_size = std::mem::size_of::<SignalShm>();
        let cached = cached_shm_acquire(signal_cache(), name, shm_size, |base| {
            let sig = base as *mut SignalShm;
            unsafe {
                ptr::write_bytes(sig, 0, 1);

                let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
                let mut eno = libc::pthread_mutexattr_init(&mut mattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_mutexattr_destroy(&mut mattr);
                    return Err(io::Error::from_raw_os_error(eno));
                }
                #[cfg(not(target_os = "macos"))]
                {
                    eno = pthread_mutexattr_setrobust(&mut mattr, PTHREAD_MUTEX_ROBUST);
                    if eno != 0 {
                        libc::pthread_mutexattr_destroy(&mut mattr);
                        return Err(io::Error::from_raw_os_error(eno));
                    }
                }
                eno = libc::pthread_mutex_init(&mut (*sig).mutex, &mattr);
                libc::pthread_mutexattr_destroy(&mut mattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }

                let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
                eno = libc::pthread_condattr_init(&mut cattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_condattr_destroy(&mut cattr);
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_cond_init(&mut (*sig).cond, &cattr);
                libc::pthread_condattr_destroy(&mut cattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
            Ok(())
        })?;

        Ok(Self {
            cached,
            name: name.to_string(),
        })
    }

    fn sig(&self) -> *mut SignalShm {
        self.cached.shm.as_mut_ptr() as *mut SignalShm
    }

    fn lock(&self) -> io::Result<()> {
        loop {
            let eno = unsafe { libc::pthread_mutex_lock(&mut (*self.sig()).mutex) };
            match eno {
                0 => return Ok(()),
                #[cfg(not(target_os = "macos"))]
                EOWNERDEAD => {
                    let eno2 = unsafe { pthread_mutex_consistent(&mut (*self.sig()).mutex) };
                    if eno2 != 0 {
                        return Err(io::Error::from_raw_os_error(eno2));
                    }
                    return Ok(());
                }
                _ => return Err(io::Error::from_raw_os_error(eno)),
            }
        }
    }

    fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(&mut (*self.sig()).mutex) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Wake every waiter. The brief lock/unlock barrier ensures a waiter
    /// that has passed its state check is inside `cond_wait` before the
    /// broadcast fires.
    pub fn notify_all(&self) -> io::Result<()> {
        self.lock()?;
        self.unlock()?;
        let eno = unsafe { libc::pthread_cond_broadcast(&mut (*self.sig()).cond) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Block until notified or until `timeout_ms` elapses.
    /// Returns `Ok(true)` when signalled, `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: u64) -> io::Result<bool> {
        use std::time::{SystemTime, UNIX_EPOCH};

        self.lock()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let deadline = now + std::time::Duration::from_millis(timeout_ms);
        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };
        let eno = unsafe {
            libc::pthread_cond_timedwait(&mut (*self.sig()).cond, &mut (*self.sig()).mutex, &ts)
        };
        self.unlock()?;
        match eno {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn clear_storage(name: &str) {
        cached_shm_purge(signal_cache(), name);
        PlatformShm::unlink_by_name(name);
    }
}

impl Drop for PlatformSignal {
    fn drop(&mut self) {
        // No pthread_*_destroy here: after munmap the virtual address may be
        // recycled to a different segment, and destroy would clobber whatever
        // object now lives there. The munmap + unlink in PlatformShm::drop
        // reclaims the memory.
        cached_shm_release(signal_cache(), &self.name);
    }
}
