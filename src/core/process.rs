//! Process liveness checks.
//!
//! Lock holders and in-flight merge requests record the pid of the process that owns
//! them. Whether that process still exists is the signal the deadlock monitor and the
//! recovery supervisor use to reclaim orphaned state. The check sits behind
//! [`ProcessProbe`] so tests can declare processes dead without killing anything.

use std::fmt;

/// Answers whether a process id refers to a running process.
pub trait ProcessProbe: Send + Sync + fmt::Debug {
    /// Returns `true` if a process with this pid currently exists.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == current_pid() {
            return true;
        }
        is_process_alive(pid)
    }
}

/// Returns the pid of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Checks if a process with the given PID is still alive.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // pid 0 and values past i32::MAX would address process groups
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks process existence, no signal is actually delivered
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn is_process_alive(pid: u32) -> bool {
    use std::ptr;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    // SAFETY: OpenProcess returns null on failure (process doesn't exist); handle is closed immediately after check
    unsafe {
        let handle: HANDLE = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == ptr::null_mut() {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn is_process_alive(_pid: u32) -> bool {
    // Conservative: assume process is alive on unknown platforms
    true
}
