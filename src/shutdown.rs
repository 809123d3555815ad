//! Cooperative shutdown.
//!
//! A [`ShutdownToken`] is an atomic flag paired with an eventfd. Cancelling
//! stores the flag and makes the eventfd readable forever, so any `poll(2)`
//! that includes [`ShutdownToken::wake_fd`] returns at once. Signal handlers
//! do nothing else: they never touch files or the output.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::{Error, Result};

static SIGNAL_TOKEN: OnceLock<ShutdownToken> = OnceLock::new();
static CHILD_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    wake_fd: RawFd,
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Result<Self> {
        let wake_fd = new_eventfd()?;
        Ok(Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                wake_fd,
            }),
        })
    }

    /// Request shutdown. Async-signal-safe.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        poke(self.inner.wake_fd);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Descriptor that turns readable once shutdown is requested.
    pub fn wake_fd(&self) -> RawFd {
        self.inner.wake_fd
    }

    /// Sleep for `timeout` unless shutdown is requested first.
    ///
    /// Returns `true` when the sleep ended because of shutdown.
    pub fn sleep(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut pfd = libc::pollfd {
            fd: self.inner.wake_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // EINTR just shortens the sleep; the flag decides.
        unsafe {
            libc::poll(&mut pfd, 1, millis);
        }
        self.is_cancelled()
    }
}

pub(crate) fn new_eventfd() -> Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(fd)
}

pub(crate) fn poke(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let value: u64 = 1;
    unsafe {
        libc::write(fd, &value as *const u64 as *const _, mem::size_of::<u64>());
    }
}

/// Drain an eventfd counter so the next poll blocks again.
pub(crate) fn drain(fd: RawFd) {
    let mut value: u64 = 0;
    unsafe {
        libc::read(fd, &mut value as *mut u64 as *mut _, mem::size_of::<u64>());
    }
}

pub(crate) fn register_child_wake(fd: RawFd) {
    CHILD_WAKE_FD.store(fd, Ordering::Release);
}

pub(crate) fn unregister_child_wake(fd: RawFd) {
    let _ = CHILD_WAKE_FD.compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Acquire);
}

extern "C" fn handle_signal(sig: libc::c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };
    if sig == libc::SIGCHLD {
        poke(CHILD_WAKE_FD.load(Ordering::Acquire));
    } else if let Some(token) = SIGNAL_TOKEN.get() {
        token.cancel();
    }
    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

/// Route SIGINT and SIGTERM to `token`, and SIGCHLD to the child reaper.
///
/// Only the first token installed in a process receives signals.
pub fn install_signal_handlers(token: &ShutdownToken) -> Result<()> {
    let _ = SIGNAL_TOKEN.set(token.clone());
    for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGCHLD] {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        let res = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, std::ptr::null_mut())
        };
        if res != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
