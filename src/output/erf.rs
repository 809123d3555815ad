//! ERF record encoding.
//!
//! Each record is self-describing, so an ERF file may legitimately be empty.

use std::io::Write;

use crate::capture::{Packet, LINKTYPE_ETHERNET, LINKTYPE_IPV4, LINKTYPE_IPV6, LINKTYPE_RAW};
use crate::{Error, Result};

pub const ERF_HEADER_LEN: usize = 16;

const TYPE_ETH: u8 = 2;
const TYPE_IPV4: u8 = 22;
const TYPE_IPV6: u8 = 23;
const FLAG_VARLEN: u8 = 0x04;
const FLAG_TRUNCATED: u8 = 0x08;
/// Offset and pad bytes in front of Ethernet frames.
const ETH_PAD_LEN: usize = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct ErfEncoder;

impl ErfEncoder {
    pub fn write_packet(&self, out: &mut impl Write, packet: &Packet) -> Result<usize> {
        match packet.link_type {
            LINKTYPE_ETHERNET | LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => self.write_record(out, packet),
            // Loopback frames go out as bare IP.
            _ => match packet.reframed(LINKTYPE_RAW) {
                Some(raw) => self.write_record(out, &raw),
                None => Err(unencodable(packet, "link type has no ERF record type")),
            },
        }
    }

    fn write_record(&self, out: &mut impl Write, packet: &Packet) -> Result<usize> {
        let (record_type, pad) = match packet.link_type {
            LINKTYPE_ETHERNET => (TYPE_ETH, ETH_PAD_LEN),
            _ => match packet.data.first().map(|b| b >> 4) {
                Some(6) => (TYPE_IPV6, 0),
                _ => (TYPE_IPV4, 0),
            },
        };

        let rlen = ERF_HEADER_LEN + pad + packet.data.len();
        let rlen = u16::try_from(rlen).map_err(|_| unencodable(packet, "too large for an ERF record"))?;
        let wlen = u16::try_from(packet.wire_len).unwrap_or(u16::MAX);
        let mut flags = FLAG_VARLEN;
        if packet.captured_len < packet.wire_len {
            flags |= FLAG_TRUNCATED;
        }

        let mut header = [0u8; ERF_HEADER_LEN];
        header[0..8].copy_from_slice(&packet.timestamp.raw().to_le_bytes());
        header[8] = record_type;
        header[9] = flags;
        header[10..12].copy_from_slice(&rlen.to_be_bytes());
        // loss counter stays zero
        header[14..16].copy_from_slice(&wlen.to_be_bytes());
        out.write_all(&header)?;
        out.write_all(&[0u8; ETH_PAD_LEN][..pad])?;
        out.write_all(&packet.data)?;
        Ok(rlen as usize)
    }
}

fn unencodable(packet: &Packet, reason: &'static str) -> Error {
    Error::Unencodable {
        at: packet.timestamp,
        reason,
    }
}
