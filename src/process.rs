// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-lifetime source: the watchdog registers peer PIDs here and is
// called back when one of them leaves the system. Liveness is decided by
// asking the OS about the process, never by timeouts — a peer stopped in a
// debugger stays alive, a crashed peer is reported within one poll round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll interval of the default monitor thread.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callback target for process-exit notifications.
pub trait ProcessEvents: Send + Sync {
    /// `exit_code` is best effort; 0 when the platform cannot provide one.
    fn process_terminated(&self, pid: u32, exit_code: i64);
}

/// A source of process identity and process-exit notifications. Injected
/// into the channel manager so hosting environments can substitute their
/// own implementation.
pub trait ProcessLifetime: Send + Sync {
    fn current_pid(&self) -> u32;

    /// Watch `pid`; returns a non-zero cookie, or 0 when the registration
    /// was refused.
    fn register_monitor(&self, pid: u32, events: Weak<dyn ProcessEvents>) -> u32;

    fn unregister_monitor(&self, cookie: u32);

    /// Stop delivering notifications and release the monitoring resources.
    fn shutdown(&self);
}

/// Whether a process with `pid` currently exists.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if ret == 0 {
            return true;
        }
        // EPERM still proves existence; only ESRCH means gone.
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
        use windows_sys::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle == 0 {
                return false;
            }
            let mut code: u32 = 0;
            let ok = GetExitCodeProcess(handle, &mut code) != 0 && code == STILL_ACTIVE as u32;
            CloseHandle(handle);
            ok
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        true
    }
}

struct Watch {
    cookie: u32,
    pid: u32,
    events: Weak<dyn ProcessEvents>,
}

struct MonitorState {
    watches: Vec<Watch>,
    next_cookie: u32,
}

/// Default [`ProcessLifetime`] implementation: one thread polling the
/// registered PIDs every 100 ms.
pub struct ProcessMonitor {
    state: Mutex<MonitorState>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessMonitor {
    pub fn new() -> Arc<Self> {
        let monitor = Arc::new(Self {
            state: Mutex::new(MonitorState {
                watches: Vec::new(),
                next_cookie: 1,
            }),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&monitor);
        let handle = std::thread::spawn(move || Self::run(weak));
        *monitor.thread.lock().unwrap() = Some(handle);
        monitor
    }

    fn run(weak: Weak<ProcessMonitor>) {
        loop {
            let Some(this) = weak.upgrade() else {
                break;
            };
            if this.stop.load(Ordering::Acquire) {
                break;
            }

            let mut dead = Vec::new();
            {
                let mut state = this.state.lock().unwrap();
                let mut i = 0;
                while i < state.watches.len() {
                    if is_alive(state.watches[i].pid) {
                        i += 1;
                    } else {
                        dead.push(state.watches.swap_remove(i));
                    }
                }
            }

            // Dispatch outside the lock; callbacks may re-enter the monitor.
            for watch in dead {
                log::debug!("process {} terminated", watch.pid);
                if let Some(events) = watch.events.upgrade() {
                    events.process_terminated(watch.pid, 0);
                }
            }

            drop(this);
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ProcessLifetime for ProcessMonitor {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn register_monitor(&self, pid: u32, events: Weak<dyn ProcessEvents>) -> u32 {
        if pid == 0 || self.stop.load(Ordering::Acquire) {
            return 0;
        }
        let mut state = self.state.lock().unwrap();
        let cookie = state.next_cookie;
        state.next_cookie = state.next_cookie.wrapping_add(1).max(1);
        state.watches.push(Watch {
            cookie,
            pid,
            events,
        });
        log::trace!("monitoring process {pid} (cookie {cookie})");
        cookie
    }

    fn unregister_monitor(&self, cookie: u32) {
        if cookie == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.watches.retain(|w| w.cookie != cookie);
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.state.lock().unwrap().watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_alive(0));
    }

    #[test]
    fn register_returns_distinct_cookies() {
        struct Nop;
        impl ProcessEvents for Nop {
            fn process_terminated(&self, _pid: u32, _exit_code: i64) {}
        }

        let monitor = ProcessMonitor::new();
        let target: Arc<dyn ProcessEvents> = Arc::new(Nop);
        let a = monitor.register_monitor(std::process::id(), Arc::downgrade(&target));
        let b = monitor.register_monitor(std::process::id(), Arc::downgrade(&target));
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        monitor.unregister_monitor(a);
        monitor.unregister_monitor(b);
        monitor.shutdown();
    }
}
