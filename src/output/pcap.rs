//! Classic pcap encoding, little endian, microsecond timestamps.
//!
//! The file header carries the link type, so it is written together with
//! the first packet. A segment that never saw a packet therefore has no
//! bytes at all, which readers reject; [`NULL_PCAP`] is what goes there.

use std::io::Write;

use crate::capture::Packet;
use crate::{Error, Result};

const MAGIC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 262_144;

pub const PCAP_HEADER_LEN: usize = 24;
pub const PCAP_RECORD_HEADER_LEN: usize = 16;

/// A valid pcap file with no records: Ethernet, snaplen 256 KiB.
pub const NULL_PCAP: [u8; PCAP_HEADER_LEN] = [
    0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00, 0x04, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00,
];

#[derive(Debug, Default)]
pub struct PcapEncoder {
    link_type: Option<u32>,
}

impl PcapEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one record; the first packet fixes the segment's link type
    /// and later packets are re-framed to it.
    pub fn write_packet(&mut self, out: &mut impl Write, packet: &Packet) -> Result<usize> {
        match self.link_type {
            None => {
                out.write_all(&file_header(packet.link_type))?;
                self.link_type = Some(packet.link_type);
                Ok(PCAP_HEADER_LEN + write_record(out, packet)?)
            }
            Some(link_type) if link_type != packet.link_type => {
                let reframed = packet.reframed(link_type).ok_or(Error::Unencodable {
                    at: packet.timestamp,
                    reason: "link type differs from the segment's",
                })?;
                write_record(out, &reframed)
            }
            Some(_) => write_record(out, packet),
        }
    }
}

fn write_record(out: &mut impl Write, packet: &Packet) -> Result<usize> {
    let mut record = [0u8; PCAP_RECORD_HEADER_LEN];
    record[0..4].copy_from_slice(&packet.timestamp.secs().to_le_bytes());
    record[4..8].copy_from_slice(&packet.timestamp.subsec_micros().to_le_bytes());
    record[8..12].copy_from_slice(&packet.captured_len.to_le_bytes());
    record[12..16].copy_from_slice(&packet.wire_len.to_le_bytes());
    out.write_all(&record)?;
    out.write_all(&packet.data)?;
    Ok(PCAP_RECORD_HEADER_LEN + packet.data.len())
}

fn file_header(link_type: u32) -> [u8; PCAP_HEADER_LEN] {
    let mut header = [0u8; PCAP_HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    header[16..20].copy_from_slice(&SNAPLEN.to_le_bytes());
    header[20..24].copy_from_slice(&link_type.to_le_bytes());
    header
}
