#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use etherparse::PacketBuilder;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

use tracemux::capture::{LINKTYPE_ETHERNET, LINKTYPE_NULL, LINKTYPE_RAW};
use tracemux::output::{Destination, PacketSink, SinkConfig, SinkFactory};
use tracemux::{CaptureEvent, CaptureSource, CaptureStats, Packet, Result, Timestamp};

/// A capture source that replays a fixed list of events, then terminates.
pub struct ScriptedSource {
    uri: String,
    events: VecDeque<CaptureEvent>,
    dropped: u64,
}

impl ScriptedSource {
    pub fn new(uri: &str, events: Vec<CaptureEvent>) -> Self {
        Self {
            uri: uri.to_string(),
            events: events.into(),
            dropped: 0,
        }
    }

    /// Packets at the given whole seconds.
    pub fn at_secs(uri: &str, secs: &[u32]) -> Self {
        let events = secs
            .iter()
            .map(|secs| CaptureEvent::Packet(udp_packet(Timestamp::from_secs(*secs), 0)))
            .collect();
        Self::new(uri, events)
    }

    pub fn boxed(self) -> Box<dyn CaptureSource> {
        Box::new(self)
    }
}

impl CaptureSource for ScriptedSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_event(&mut self) -> Result<CaptureEvent> {
        Ok(self.events.pop_front().unwrap_or(CaptureEvent::Terminate))
    }

    fn stats(&self) -> Result<CaptureStats> {
        Ok(CaptureStats {
            dropped: self.dropped,
        })
    }
}

/// Ethernet/IPv4/UDP frame; `tag` lands in the first payload byte.
pub fn udp_frame(tag: u8) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(4000, 5000);
    let payload = [tag, 0xee, 0xee, 0xee];
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload).expect("build frame");
    frame
}

pub fn udp_packet(timestamp: Timestamp, tag: u8) -> Packet {
    let frame = udp_frame(tag);
    let len = frame.len() as u32;
    Packet::new(timestamp, LINKTYPE_ETHERNET, frame, len)
}

/// The UDP datagram of [`udp_frame`] without its Ethernet header.
pub fn raw_ip_packet(timestamp: Timestamp, tag: u8) -> Packet {
    let datagram = udp_frame(tag)[14..].to_vec();
    let len = datagram.len() as u32;
    Packet::new(timestamp, LINKTYPE_RAW, datagram, len)
}

/// The UDP datagram of [`udp_frame`] behind a BSD loopback header.
pub fn loopback_packet(timestamp: Timestamp, tag: u8) -> Packet {
    let mut frame = 2u32.to_ne_bytes().to_vec();
    frame.extend_from_slice(&udp_frame(tag)[14..]);
    let len = frame.len() as u32;
    Packet::new(timestamp, LINKTYPE_NULL, frame, len)
}

/// Ethernet frame with an unknown ether type.
pub fn non_ip_packet(timestamp: Timestamp) -> Packet {
    let mut frame = vec![0u8; 60];
    frame[12] = 0x88;
    frame[13] = 0xb5;
    Packet::new(timestamp, LINKTYPE_ETHERNET, frame, 60)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedSegment {
    pub name: String,
    pub packets: Vec<Packet>,
    pub raw: Vec<u8>,
}

impl RecordedSegment {
    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.packets.iter().map(|packet| packet.timestamp).collect()
    }
}

/// Keeps every finished segment in memory instead of encoding it.
#[derive(Clone, Default)]
pub struct RecordingSinkFactory {
    pub segments: Arc<Mutex<Vec<RecordedSegment>>>,
}

impl RecordingSinkFactory {
    pub fn finished(&self) -> Vec<RecordedSegment> {
        self.segments.lock().expect("lock").clone()
    }
}

struct RecordingSink {
    current: RecordedSegment,
    done: Arc<Mutex<Vec<RecordedSegment>>>,
}

impl SinkFactory for RecordingSinkFactory {
    fn create(&self, destination: Destination, _config: &SinkConfig) -> Result<Box<dyn PacketSink>> {
        Ok(Box::new(RecordingSink {
            current: RecordedSegment {
                name: destination.name,
                ..RecordedSegment::default()
            },
            done: Arc::clone(&self.segments),
        }))
    }
}

impl PacketSink for RecordingSink {
    fn write_packet(&mut self, packet: &Packet) -> Result<usize> {
        self.current.packets.push(packet.clone());
        Ok(packet.data.len())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.current.raw.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.done.lock().expect("lock").push(self.current);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub caplen: u32,
    pub origlen: u32,
    pub data: Vec<u8>,
}

/// Link type and records of a classic pcap file.
pub fn read_pcap(path: &Path) -> (u32, Vec<PcapRecord>) {
    let file = File::open(path).expect("open pcap");
    let mut reader = LegacyPcapReader::new(65_536, file).expect("pcap header");
    let mut link_type = 0;
    let mut records = Vec::new();
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(header) => link_type = header.network.0 as u32,
                    PcapBlockOwned::Legacy(frame) => records.push(PcapRecord {
                        ts_sec: frame.ts_sec,
                        ts_usec: frame.ts_usec,
                        caplen: frame.caplen,
                        origlen: frame.origlen,
                        data: frame.data.to_vec(),
                    }),
                    _ => {}
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => reader.refill().expect("refill"),
            Err(err) => panic!("bad pcap: {err:?}"),
        }
    }
    (link_type, records)
}

/// Write a microsecond pcap file with Ethernet frames at the given times.
pub fn write_pcap(path: &Path, packets: &[(u32, u32, Vec<u8>)]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0xd4, 0xc3, 0xb2, 0xa1, 2, 0, 4, 0]);
    bytes.extend_from_slice(&[0u8; 8]);
    bytes.extend_from_slice(&65_535u32.to_le_bytes());
    bytes.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
    for (secs, usecs, frame) in packets {
        bytes.extend_from_slice(&secs.to_le_bytes());
        bytes.extend_from_slice(&usecs.to_le_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        bytes.extend_from_slice(frame);
    }
    std::fs::write(path, bytes).expect("write pcap");
}

/// Files directly under `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}
