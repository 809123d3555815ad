//! The merge loop over all capture sources.
//!
//! Each round asks every idle source for one event, waits a bounded amount
//! of time for sources that are blocked on a descriptor, then hands back the
//! buffered packet with the smallest timestamp. Only heads that are buffered
//! at the same time are ordered against each other.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::capture::{CaptureEvent, CaptureSource, Packet};
use crate::shutdown::ShutdownToken;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    /// Readiness wait shared by all sources within one round.
    pub max_wait: Duration,
}

impl MuxConfig {
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT)
    }
}

/// One capture input and its bookkeeping.
pub struct Source {
    handle: Box<dyn CaptureSource>,
    pub(crate) uri: String,
    pub(crate) active: bool,
    pub(crate) pending: Option<Packet>,
    pub(crate) prev_ts: Option<Timestamp>,
    pub(crate) total_packets: u64,
    pub(crate) segment_packets: u64,
    pub(crate) disorders: u64,
    /// Drop counter as of the last segment report.
    pub(crate) drop_baseline: u64,
}

impl Source {
    pub fn new(handle: Box<dyn CaptureSource>) -> Self {
        // Drops from before the first segment are not that segment's.
        let drop_baseline = handle.stats().map(|stats| stats.dropped).unwrap_or(0);
        Self {
            uri: handle.uri().to_string(),
            handle,
            active: true,
            pending: None,
            prev_ts: None,
            total_packets: 0,
            segment_packets: 0,
            disorders: 0,
            drop_baseline,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn segment_packets(&self) -> u64 {
        self.segment_packets
    }

    pub fn disorders(&self) -> u64 {
        self.disorders
    }

    pub fn handle(&self) -> &dyn CaptureSource {
        self.handle.as_ref()
    }

    /// Buffer an accepted packet; `true` when it is older than its
    /// predecessor from this source.
    fn accept(&mut self, packet: Packet) -> bool {
        let ts = packet.timestamp;
        let mut disorder = false;
        if let Some(prev) = self.prev_ts {
            if ts < prev {
                self.disorders += 1;
                disorder = true;
                let delta = prev.as_secs_f64() - ts.as_secs_f64();
                debug!("{}: packet at {ts} is {delta:.6}s older than its predecessor", self.uri);
            }
        }
        self.prev_ts = Some(ts);
        self.total_packets += 1;
        self.segment_packets += 1;
        self.pending = Some(packet);
        disorder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Index of the source whose buffered packet goes next.
    Selected(usize),
    Idle,
}

enum Readiness {
    Ready,
    Timeout,
    Shutdown,
}

pub struct Multiplexer {
    config: MuxConfig,
    sources: Vec<Source>,
    active: usize,
    total_packets: u64,
    total_disorders: u64,
    sleep_hint: Option<Duration>,
    waited: bool,
}

impl Multiplexer {
    pub fn new(handles: Vec<Box<dyn CaptureSource>>, config: MuxConfig) -> Self {
        let sources: Vec<Source> = handles.into_iter().map(Source::new).collect();
        Self {
            config,
            active: sources.len(),
            sources,
            total_packets: 0,
            total_disorders: 0,
            sleep_hint: None,
            waited: false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Packets accepted from all sources since startup.
    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    /// Per-source disorders summed over all sources since startup.
    pub fn total_disorders(&self) -> u64 {
        self.total_disorders
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut [Source] {
        &mut self.sources
    }

    /// Remove the buffered packet of source `index`, if any.
    pub fn take(&mut self, index: usize) -> Option<Packet> {
        self.sources.get_mut(index).and_then(|source| source.pending.take())
    }

    /// How long the caller may sleep after an idle round.
    ///
    /// `None` when a source waited on a descriptor during the round (the
    /// wait already paced it) or no source asked for a delay.
    pub fn idle_pause(&self) -> Option<Duration> {
        if self.waited {
            return None;
        }
        self.sleep_hint.map(|hint| hint.min(self.config.max_wait))
    }

    /// Drop every source handle. Buffered packets are discarded.
    pub fn release(&mut self) {
        for source in &mut self.sources {
            source.pending = None;
            source.active = false;
        }
        self.active = 0;
        self.sources.clear();
    }

    /// Tell every active source that nobody reads until [`resume_all`].
    ///
    /// [`resume_all`]: Multiplexer::resume_all
    pub fn pause_all(&mut self) {
        for source in self.sources.iter_mut().filter(|source| source.active) {
            source.handle.pause();
        }
    }

    pub fn resume_all(&mut self) {
        for source in self.sources.iter_mut().filter(|source| source.active) {
            source.handle.resume();
        }
    }

    /// Run one round and pick the next packet to emit.
    pub fn poll(&mut self, shutdown: &ShutdownToken) -> Result<Poll> {
        let mut budget = self.config.max_wait;
        self.sleep_hint = None;
        self.waited = false;

        'sources: for source in self.sources.iter_mut() {
            if !source.active || source.pending.is_some() {
                continue;
            }
            loop {
                let event = source.handle.next_event().map_err(|err| match err {
                    err @ Error::Capture { .. } => err,
                    other => Error::capture(&source.uri, other.to_string()),
                })?;
                match event {
                    CaptureEvent::Sleep(delay) => {
                        self.sleep_hint = Some(self.sleep_hint.map_or(delay, |hint| hint.min(delay)));
                        break;
                    }
                    CaptureEvent::IoWait(fd) => {
                        if budget.is_zero() {
                            break;
                        }
                        self.waited = true;
                        let started = Instant::now();
                        let readiness = wait_readable(fd, shutdown.wake_fd(), budget);
                        budget = budget.saturating_sub(started.elapsed());
                        match readiness {
                            Ok(Readiness::Ready) => continue,
                            Ok(Readiness::Timeout) => break,
                            Ok(Readiness::Shutdown) => break 'sources,
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => break,
                            Err(err) => {
                                warn!("{}: readiness wait failed: {err}", source.uri);
                                break;
                            }
                        }
                    }
                    CaptureEvent::Packet(packet) => {
                        if !packet.has_layer3() {
                            warn!(
                                "{}: skipping packet at {} without a network layer payload",
                                source.uri, packet.timestamp
                            );
                            continue;
                        }
                        if source.accept(packet) {
                            self.total_disorders += 1;
                        }
                        self.total_packets += 1;
                        break;
                    }
                    CaptureEvent::Terminate => {
                        debug_assert!(source.pending.is_none());
                        source.active = false;
                        self.active -= 1;
                        info!("{}: end of capture after {} packets", source.uri, source.total_packets);
                        break;
                    }
                }
            }
        }

        Ok(self.select())
    }

    fn select(&self) -> Poll {
        let mut best: Option<(usize, Timestamp)> = None;
        for (index, source) in self.sources.iter().enumerate() {
            let Some(packet) = &source.pending else {
                continue;
            };
            match best {
                Some((_, ts)) if packet.timestamp >= ts => {}
                _ => best = Some((index, packet.timestamp)),
            }
        }
        match best {
            Some((index, _)) => Poll::Selected(index),
            None => Poll::Idle,
        }
    }
}

fn wait_readable(fd: RawFd, wake_fd: RawFd, timeout: Duration) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let millis = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;
    let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    if res == 0 {
        return Ok(Readiness::Timeout);
    }
    if fds[1].revents != 0 {
        return Ok(Readiness::Shutdown);
    }
    Ok(Readiness::Ready)
}
