//! Output segments and their rotation.
//!
//! At most one segment is open. A segment opens lazily on the next packet
//! after startup or a size rotation, eagerly on a time rotation, and closes
//! on rotation or at shutdown. Closing
//! a segment that never saw a packet writes the format's placeholder so no
//! invalid empty capture is left behind.

use std::fs::{File, OpenOptions};
use std::os::fd::FromRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::capture::Packet;
use crate::clock::Clock;
use crate::gate::BackpressureGate;
use crate::naming::Naming;
use crate::output::{Destination, PacketSink, SinkConfig, SinkFactory};
use crate::pipeline::{ChildReaper, PipelineSubprocess};
use crate::sequence::SequenceStore;
use crate::shutdown::ShutdownToken;
use crate::stats::SegmentSummary;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

const OUTPUT_MODE: u32 = 0o600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the captured bytes of a segment reach this many.
    pub size_threshold: Option<u64>,
    /// Rotate this many seconds after the previous rotation.
    pub interval: Option<u64>,
}

impl RotationPolicy {
    pub fn new(size_threshold: Option<u64>, interval: Option<u64>) -> Self {
        Self {
            size_threshold,
            interval,
        }
    }

    fn interval_elapsed(&self, last_rotated: Timestamp, at: Timestamp) -> bool {
        match self.interval {
            Some(interval) => u64::from(at.secs()) >= u64::from(last_rotated.secs()) + interval,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub naming: Naming,
    pub sink: SinkConfig,
    pub rotation: RotationPolicy,
    pub gate: BackpressureGate,
    /// Side file for the sequence counter; only used with sequenced names.
    pub sequence_file: Option<PathBuf>,
    /// argv of an external filter between the encoder and the file.
    pub pipeline: Option<Vec<String>>,
}

impl OutputConfig {
    pub fn new(naming: Naming, sink: SinkConfig) -> Self {
        Self {
            naming,
            sink,
            rotation: RotationPolicy::default(),
            gate: BackpressureGate::new(None),
            sequence_file: None,
            pipeline: None,
        }
    }
}

struct Segment {
    sink: Box<dyn PacketSink>,
    filename: String,
    child: Option<PipelineSubprocess>,
    bytes: u64,
    packets: u64,
    disorders: u64,
    opened_at: Timestamp,
    last_ts: Option<Timestamp>,
}

impl Segment {
    fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            filename: self.filename.clone(),
            opened_at: self.opened_at,
            last_ts: self.last_ts,
            packets: self.packets,
            bytes: self.bytes,
            disorders: self.disorders,
        }
    }
}

pub struct SegmentManager {
    config: OutputConfig,
    factory: Box<dyn SinkFactory>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownToken,
    sequence: Option<SequenceStore>,
    reaper: Option<ChildReaper>,
    current: Option<Segment>,
    last_rotated: Timestamp,
    segments_opened: u64,
    total_disorders: u64,
    closed: Vec<SegmentSummary>,
}

impl SegmentManager {
    pub fn new(
        config: OutputConfig,
        factory: Box<dyn SinkFactory>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let sequence = match (&config.naming, &config.sequence_file) {
            (Naming::Sequenced { width, .. }, Some(path)) => Some(SequenceStore::open(path, *width)?),
            (Naming::Sequenced { width, .. }, None) => Some(SequenceStore::in_memory(*width)?),
            (Naming::Fixed(_), Some(path)) => {
                warn!("ignoring sequence file {}: output name is fixed", path.display());
                None
            }
            (Naming::Fixed(_), None) => None,
        };
        if let Some(argv) = &config.pipeline {
            if argv.is_empty() {
                return Err(Error::Config("empty pipeline command".to_string()));
            }
        }
        let reaper = match config.pipeline {
            Some(_) => Some(ChildReaper::start()?),
            None => None,
        };
        let last_rotated = clock.now();
        Ok(Self {
            config,
            factory,
            clock,
            shutdown,
            sequence,
            reaper,
            current: None,
            last_rotated,
            segments_opened: 0,
            total_disorders: 0,
            closed: Vec::new(),
        })
    }

    pub fn gate(&self) -> &BackpressureGate {
        &self.config.gate
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Whether a rotation check at `at` would rotate.
    pub fn rotation_due(&self, at: Timestamp) -> bool {
        self.config.rotation.interval_elapsed(self.last_rotated, at)
    }

    /// Wall-clock time of the last close, or of startup.
    pub fn last_rotated(&self) -> Timestamp {
        self.last_rotated
    }

    pub fn current_filename(&self) -> Option<&str> {
        self.current.as_ref().map(|segment| segment.filename.as_str())
    }

    pub fn segments_opened(&self) -> u64 {
        self.segments_opened
    }

    /// Out-of-order packets in the emitted stream since startup.
    pub fn total_disorders(&self) -> u64 {
        self.total_disorders
    }

    /// Summaries of segments closed since the last call.
    pub fn take_closed(&mut self) -> Vec<SegmentSummary> {
        std::mem::take(&mut self.closed)
    }

    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let ts = packet.timestamp;
        let segment = match self.current.take() {
            Some(segment) => segment,
            None => self.open_segment(ts)?,
        };
        let segment = self.current.insert(segment);

        segment.sink.write_packet(packet)?;
        if let Some(last) = segment.last_ts {
            if ts < last {
                segment.disorders += 1;
                self.total_disorders += 1;
                debug!("{}: packet at {ts} written after {last}", segment.filename);
            }
        }
        segment.last_ts = Some(ts);
        segment.packets += 1;
        segment.bytes += u64::from(packet.captured_len);

        // The successor opens with the next packet, named after it.
        if let Some(threshold) = self.config.rotation.size_threshold {
            if segment.bytes >= threshold {
                debug!("{} reached {} bytes", segment.filename, segment.bytes);
                self.close_segment()?;
            }
        }
        Ok(())
    }

    /// Close the open segment, if any, and open the next one stamped `ts`.
    ///
    /// Used by time-based rotation, where a segment exists for every
    /// interval even when no packet arrives in it.
    pub fn rotate(&mut self, ts: Timestamp) -> Result<()> {
        self.close_segment()?;
        // Nothing was open after a size close; the interval restarts anyway.
        self.last_rotated = self.clock.now();
        let segment = self.open_segment(ts)?;
        self.current = Some(segment);
        Ok(())
    }

    pub fn check_idle_rotation(&mut self, now: Timestamp) -> Result<bool> {
        if self.rotation_due(now) {
            self.rotate(now)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn check_packet_rotation(&mut self, ts: Timestamp) -> Result<bool> {
        if self.rotation_due(ts) {
            self.rotate(ts)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Final close at shutdown; no successor is opened.
    ///
    /// A run that never opened a segment gets one here, so even a run
    /// without packets leaves a valid output behind. Waits for pipeline
    /// children to exit.
    pub fn finish(&mut self, now: Timestamp) -> Result<()> {
        if self.current.is_none() && self.segments_opened == 0 {
            let segment = self.open_segment(now)?;
            self.current = Some(segment);
        }
        self.close_segment()?;
        if let Some(reaper) = self.reaper.as_mut() {
            reaper.finish()?;
        }
        Ok(())
    }

    fn open_segment(&mut self, ts: Timestamp) -> Result<Segment> {
        if !self.shutdown.is_cancelled() {
            let slept = self.config.gate.await_ready(&self.shutdown);
            if !slept.is_zero() {
                info!("output was suspended for {:.1}s", slept.as_secs_f64());
            }
        }

        let seq = match self.sequence.as_mut() {
            Some(store) => store.reserve(),
            None => 0,
        };
        let filename = self.config.naming.filename(ts, seq)?;
        let file = open_destination(&filename)?;

        let (file, child) = match &self.config.pipeline {
            Some(argv) => {
                let (child, input) = PipelineSubprocess::spawn(file, argv)?;
                (input, Some(child))
            }
            None => (file, None),
        };
        let sink = self.factory.create(
            Destination {
                name: filename.clone(),
                file,
            },
            &self.config.sink,
        )?;

        self.segments_opened += 1;
        info!("opened segment {filename}");
        Ok(Segment {
            sink,
            filename,
            child,
            bytes: 0,
            packets: 0,
            disorders: 0,
            opened_at: ts,
            last_ts: None,
        })
    }

    fn close_segment(&mut self) -> Result<()> {
        let Some(segment) = self.current.take() else {
            return Ok(());
        };
        let summary = segment.summary();
        let Segment {
            mut sink, child, ..
        } = segment;

        if summary.packets == 0 {
            if let Some(placeholder) = self.config.sink.format.placeholder() {
                sink.write_raw(placeholder)?;
            }
        }
        sink.finish()?;
        if let Some(child) = child {
            match self.reaper.as_ref() {
                Some(reaper) => reaper.adopt(child),
                None => warn!("no reaper for pipeline pid {}", child.id()),
            }
        }

        self.last_rotated = self.clock.now();
        debug!("closed segment {} with {} packets", summary.filename, summary.packets);
        self.closed.push(summary);
        Ok(())
    }
}

impl Drop for SegmentManager {
    fn drop(&mut self) {
        if let Some(segment) = self.current.take() {
            if let Err(err) = segment.sink.finish() {
                warn!("{}: {err}", segment.filename);
            }
        }
    }
}

/// Open an output name for writing; `-` is a duplicate of stdout.
fn open_destination(name: &str) -> Result<File> {
    if name == "-" {
        let fd = unsafe { libc::fcntl(libc::STDOUT_FILENO, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::output(
                name,
                format!("cannot duplicate stdout: {}", std::io::Error::last_os_error()),
            ));
        }
        return Ok(unsafe { File::from_raw_fd(fd) });
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(OUTPUT_MODE)
        .open(name)
        .map_err(|err| Error::output(name, format!("cannot open: {err}")))
}
