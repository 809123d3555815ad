//! Classic pcap streams as capture sources.
//!
//! Regular files are read straight through. Descriptors that can block
//! (FIFOs, pipes, stdin) are switched to non-blocking once the file header
//! has been read, and an empty read surfaces as [`CaptureEvent::IoWait`] so
//! the multiplexer can wait on several of them at once.

use std::cell::Cell;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

use super::{CaptureConfig, CaptureEvent, CaptureSource, CaptureStats, Packet, LINKTYPE_ETHERNET};
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// Large enough for a full 256 KiB snaplen record plus header.
const BUFFER_SIZE: usize = 512 * 1024;

const MAGIC_NANOS_LE: u32 = 0xa1b2_3c4d;
const MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_b2a1;

/// Remembers whether the last read failed only because nothing was ready.
struct NonBlockingInput {
    file: File,
    would_block: Rc<Cell<bool>>,
}

impl Read for NonBlockingInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.would_block.set(true);
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

enum Step {
    Block(usize, Option<Packet>),
    Refill,
    Eof,
    Truncated,
    Failed(String),
}

enum ReadOutcome {
    Packet(Packet),
    WouldBlock,
    Eof,
}

pub struct PcapStreamSource {
    uri: String,
    reader: LegacyPcapReader<NonBlockingInput>,
    fd: RawFd,
    would_block: Rc<Cell<bool>>,
    link_type: u32,
    nanosecond: bool,
    snaplen: u32,
    realtime: bool,
    anchor: Option<(Instant, Timestamp)>,
    held: Option<Packet>,
}

impl PcapStreamSource {
    pub fn open(uri: &str, path: &str, config: &CaptureConfig) -> Result<Self> {
        let file = if path == "-" {
            File::from(io::stdin().as_fd().try_clone_to_owned()?)
        } else {
            File::open(path).map_err(|err| Error::capture(uri, format!("cannot open {path}: {err}")))?
        };
        let fd = file.as_raw_fd();
        let pollable = !file.metadata()?.file_type().is_file();

        let would_block = Rc::new(Cell::new(false));
        let input = NonBlockingInput {
            file,
            would_block: Rc::clone(&would_block),
        };
        let reader = LegacyPcapReader::new(BUFFER_SIZE, input)
            .map_err(|err| Error::capture(uri, format!("not a pcap stream: {err}")))?;

        if pollable {
            set_nonblocking(fd)?;
            debug!("{uri}: descriptor {fd} switched to non-blocking");
        }

        Ok(Self {
            uri: uri.to_string(),
            reader,
            fd,
            would_block,
            link_type: LINKTYPE_ETHERNET,
            nanosecond: false,
            snaplen: config.snaplen,
            realtime: config.realtime,
            anchor: None,
            held: None,
        })
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        loop {
            let step = match self.reader.next() {
                Ok((offset, block)) => {
                    let packet = match block {
                        PcapBlockOwned::Legacy(frame) => {
                            let timestamp = if self.nanosecond {
                                Timestamp::from_nanos(frame.ts_sec, frame.ts_usec)
                            } else {
                                Timestamp::from_micros(frame.ts_sec, frame.ts_usec)
                            };
                            let caplen = (frame.caplen as usize).min(frame.data.len());
                            let mut packet = Packet::new(
                                timestamp,
                                self.link_type,
                                frame.data[..caplen].to_vec(),
                                frame.origlen,
                            );
                            packet.truncate(self.snaplen);
                            Some(packet)
                        }
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.link_type = header.network.0 as u32;
                            self.nanosecond = header.magic_number == MAGIC_NANOS_LE
                                || header.magic_number == MAGIC_NANOS_SWAPPED;
                            None
                        }
                        _ => None,
                    };
                    Step::Block(offset, packet)
                }
                Err(PcapError::Eof) => Step::Eof,
                Err(PcapError::Incomplete(_)) => Step::Refill,
                Err(PcapError::UnexpectedEof) => Step::Truncated,
                Err(err) => Step::Failed(err.to_string()),
            };

            match step {
                Step::Block(offset, packet) => {
                    self.reader.consume(offset);
                    if let Some(packet) = packet {
                        return Ok(ReadOutcome::Packet(packet));
                    }
                }
                Step::Refill => {
                    if let Err(err) = self.reader.refill() {
                        if self.would_block.replace(false) {
                            return Ok(ReadOutcome::WouldBlock);
                        }
                        return Err(Error::capture(&self.uri, format!("read failed: {err}")));
                    }
                }
                Step::Eof => return Ok(ReadOutcome::Eof),
                Step::Truncated => {
                    warn!("{}: stream ends inside a record, dropping it", self.uri);
                    return Ok(ReadOutcome::Eof);
                }
                Step::Failed(reason) => return Err(Error::capture(&self.uri, reason)),
            }
        }
    }

    /// How long `packet` still has to wait in realtime replay.
    fn pacing_delay(&mut self, packet: &Packet) -> Option<Duration> {
        if !self.realtime {
            return None;
        }
        let (wall, first) = *self
            .anchor
            .get_or_insert_with(|| (Instant::now(), packet.timestamp));
        let due = wall + packet.timestamp.saturating_duration_since(first);
        let now = Instant::now();
        (due > now).then(|| due - now)
    }
}

impl CaptureSource for PcapStreamSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_event(&mut self) -> Result<CaptureEvent> {
        let packet = match self.held.take() {
            Some(packet) => packet,
            None => match self.read_packet()? {
                ReadOutcome::Packet(packet) => packet,
                ReadOutcome::WouldBlock => return Ok(CaptureEvent::IoWait(self.fd)),
                ReadOutcome::Eof => return Ok(CaptureEvent::Terminate),
            },
        };
        if let Some(delay) = self.pacing_delay(&packet) {
            self.held = Some(packet);
            return Ok(CaptureEvent::Sleep(delay));
        }
        Ok(CaptureEvent::Packet(packet))
    }

    fn stats(&self) -> Result<CaptureStats> {
        // A recorded stream cannot lose packets on our side.
        Ok(CaptureStats::default())
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}
