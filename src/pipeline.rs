//! External filter processes between the encoder and the output file.
//!
//! The child reads the encoded stream from one end of a Unix stream socket
//! pair and writes whatever it produces to the segment's descriptor. The
//! parent keeps only the writable end, which becomes the sink's output.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::shutdown::{drain, new_eventfd, register_child_wake, unregister_child_wake};
use crate::{Error, Result};

const PIPE_BUFFER_SIZE: libc::c_int = 8 * 1024 * 1024;
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
const FALLBACK_FD_LIMIT: libc::c_long = 65_536;
const REAPER_POLL_MS: libc::c_int = 100;

/// Split a `--pipeout` command line on spaces.
pub fn parse_pipeline(command: &str) -> Result<Vec<String>> {
    let argv: Vec<String> = command
        .split(' ')
        .filter(|arg| !arg.is_empty())
        .map(str::to_string)
        .collect();
    if argv.is_empty() {
        return Err(Error::Config("empty pipeline command".to_string()));
    }
    Ok(argv)
}

#[derive(Debug)]
pub struct PipelineSubprocess {
    child: Child,
    program: String,
}

impl PipelineSubprocess {
    /// Start `argv` with stdout on `target`; returns the handle and the
    /// descriptor to write the stream into.
    pub fn spawn(target: File, argv: &[String]) -> Result<(Self, File)> {
        let program = argv
            .first()
            .ok_or_else(|| Error::Config("empty pipeline command".to_string()))?
            .clone();
        let (read_end, write_end) = socket_pair()?;
        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            set_buffer(fd, libc::SO_RCVBUF);
            set_buffer(fd, libc::SO_SNDBUF);
        }

        let mut command = Command::new(&program);
        command
            .args(&argv[1..])
            .stdin(Stdio::from(read_end))
            .stdout(Stdio::from(target))
            .stderr(Stdio::inherit())
            .process_group(0);
        unsafe {
            command.pre_exec(close_inherited_on_exec);
        }
        let child = command
            .spawn()
            .map_err(|err| Error::Pipeline(format!("cannot execute '{program}': {err}")))?;
        debug!("pipeline '{program}' started as pid {}", child.id());
        Ok((Self { child, program }, File::from(write_end)))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }

    /// Ask the filter to stop early.
    pub fn terminate(&mut self) -> Result<()> {
        let pid = self.child.id() as libc::pid_t;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }
}

fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if res != 0 {
        return Err(Error::Pipeline(format!(
            "cannot create pipeline sockets: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn set_buffer(fd: RawFd, option: libc::c_int) {
    let size = PIPE_BUFFER_SIZE;
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res != 0 {
        warn!(
            "cannot size pipeline socket buffer (option {option}): {}",
            io::Error::last_os_error()
        );
    }
}

/// Runs in the forked child: nothing but stdio may survive the exec.
fn close_inherited_on_exec() -> io::Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if res != 0 {
        let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) }.clamp(3, FALLBACK_FD_LIMIT);
        for fd in 3..limit as libc::c_int {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
    }
    Ok(())
}

/// Collects finished pipeline children so none linger as zombies.
///
/// A helper thread wakes on SIGCHLD (or every 100 ms) and polls the adopted
/// children without blocking. The run loop never waits on them.
pub struct ChildReaper {
    children: Arc<Mutex<Vec<PipelineSubprocess>>>,
    wake_fd: RawFd,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChildReaper {
    pub fn start() -> Result<Self> {
        let wake_fd = new_eventfd()?;
        register_child_wake(wake_fd);
        let children = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_children = Arc::clone(&children);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("child-reaper".to_string())
            .spawn(move || {
                let mut pfd = libc::pollfd {
                    fd: wake_fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                while !thread_stop.load(Ordering::Acquire) {
                    let res = unsafe { libc::poll(&mut pfd, 1, REAPER_POLL_MS) };
                    if res > 0 {
                        drain(wake_fd);
                    }
                    reap_exited(&thread_children);
                }
            })?;

        Ok(Self {
            children,
            wake_fd,
            stop,
            handle: Some(handle),
        })
    }

    pub fn adopt(&self, child: PipelineSubprocess) {
        if let Ok(mut guard) = self.children.lock() {
            guard.push(child);
        }
    }

    /// Collect whatever has exited; returns how many were collected.
    pub fn reap(&self) -> usize {
        reap_exited(&self.children)
    }

    pub fn pending(&self) -> usize {
        self.children.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Stop the helper and wait for every remaining child to exit.
    pub fn finish(&mut self) -> Result<()> {
        self.stop_thread();
        let remaining = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return Err(Error::Pipeline("child registry lock poisoned".to_string())),
        };
        for mut child in remaining {
            let status = child.wait()?;
            report_exit(&child, status);
        }
        Ok(())
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Release);
        crate::shutdown::poke(self.wake_fd);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        self.stop_thread();
        unregister_child_wake(self.wake_fd);
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

fn reap_exited(children: &Mutex<Vec<PipelineSubprocess>>) -> usize {
    let Ok(mut guard) = children.lock() else {
        return 0;
    };
    let before = guard.len();
    guard.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            report_exit(child, status);
            false
        }
        Ok(None) => true,
        Err(err) => {
            warn!("cannot poll pipeline '{}' (pid {}): {err}", child.program(), child.id());
            false
        }
    });
    before - guard.len()
}

fn report_exit(child: &PipelineSubprocess, status: ExitStatus) {
    if status.success() {
        debug!("pipeline '{}' (pid {}) finished", child.program(), child.id());
    } else {
        warn!("pipeline '{}' (pid {}) exited with {status}", child.program(), child.id());
    }
}

/// Wait until `reaper` has nothing pending, for at most `timeout`.
pub fn wait_idle(reaper: &ChildReaper, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while reaper.pending() > 0 {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}
