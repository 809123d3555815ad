//! Capture collaborator.
//!
//! The multiplexer only sees [`CaptureSource`]: something that, when asked,
//! reports what it can do right now. [`open_source`] builds the pcap stream
//! implementation from a URI.

mod layer3;
mod pcap;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::timestamp::Timestamp;
use crate::Result;

pub use layer3::{has_layer3, network_offset};
pub use pcap::PcapStreamSource;

pub const LINKTYPE_NULL: u32 = 0;
pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
pub const LINKTYPE_IPV4: u32 = 228;
pub const LINKTYPE_IPV6: u32 = 229;

pub const DEFAULT_SNAPLEN: u32 = 64;

const ETHERNET_HEADER_LEN: usize = 14;

/// A captured frame owned by the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub timestamp: Timestamp,
    /// Bytes actually held in `data`.
    pub captured_len: u32,
    pub wire_len: u32,
    pub link_type: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(timestamp: Timestamp, link_type: u32, data: Vec<u8>, wire_len: u32) -> Self {
        Self {
            timestamp,
            captured_len: data.len() as u32,
            wire_len: wire_len.max(data.len() as u32),
            link_type,
            data,
        }
    }

    /// Cut the frame down to at most `snaplen` bytes.
    pub fn truncate(&mut self, snaplen: u32) {
        if snaplen > 0 && self.captured_len > snaplen {
            self.data.truncate(snaplen as usize);
            self.captured_len = snaplen;
        }
    }

    pub fn has_layer3(&self) -> bool {
        has_layer3(self.link_type, &self.data)
    }

    /// The same IP datagram under another link type.
    ///
    /// Link headers are stripped; Ethernet and loopback targets get a
    /// synthetic header. `None` when the frame has no IP header or the
    /// target cannot carry its IP version.
    pub fn reframed(&self, link_type: u32) -> Option<Packet> {
        let offset = network_offset(self.link_type, &self.data)?;
        let ip = &self.data[offset..];
        let version = ip.first()? >> 4;
        let header: Vec<u8> = match (link_type, version) {
            (LINKTYPE_RAW, 4 | 6) | (LINKTYPE_IPV4, 4) | (LINKTYPE_IPV6, 6) => Vec::new(),
            (LINKTYPE_ETHERNET, 4 | 6) => {
                let ether_type: u16 = if version == 4 { 0x0800 } else { 0x86dd };
                let mut header = vec![0u8; ETHERNET_HEADER_LEN];
                header[12..].copy_from_slice(&ether_type.to_be_bytes());
                header
            }
            (LINKTYPE_NULL, 4) => (libc::AF_INET as u32).to_ne_bytes().to_vec(),
            (LINKTYPE_NULL, 6) => (libc::AF_INET6 as u32).to_ne_bytes().to_vec(),
            _ => return None,
        };
        let mut data = Vec::with_capacity(header.len() + ip.len());
        data.extend_from_slice(&header);
        data.extend_from_slice(ip);
        let wire_len = self.wire_len.saturating_sub(offset as u32) + header.len() as u32;
        Some(Packet {
            timestamp: self.timestamp,
            captured_len: data.len() as u32,
            wire_len: wire_len.max(data.len() as u32),
            link_type,
            data,
        })
    }
}

#[derive(Debug)]
pub enum CaptureEvent {
    /// Nothing ready before the given delay has passed.
    Sleep(Duration),
    /// Nothing ready until the descriptor turns readable.
    IoWait(RawFd),
    Packet(Packet),
    /// The source is exhausted and will never produce again.
    Terminate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub dropped: u64,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub snaplen: u32,
    /// Replay capture files at the pace they were recorded.
    pub realtime: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snaplen: DEFAULT_SNAPLEN,
            realtime: false,
        }
    }
}

pub trait CaptureSource {
    fn uri(&self) -> &str;

    /// Ask for the next thing that happened on this source.
    ///
    /// Errors are unrecoverable for the source.
    fn next_event(&mut self) -> Result<CaptureEvent>;

    fn stats(&self) -> Result<CaptureStats>;

    /// Best-effort notice that nobody will read for a while.
    fn pause(&mut self) {}

    fn resume(&mut self) {}
}

/// Open a capture source by URI.
///
/// Accepts `pcapfile:<path>`, `pcap:<path>` or a bare path; `-` reads stdin.
pub fn open_source(uri: &str, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    let path = match uri.split_once(':') {
        Some(("pcapfile" | "pcap", path)) => path,
        Some((scheme, _)) if !scheme.contains('/') && scheme.len() > 1 => {
            return Err(crate::Error::capture(uri, format!("unsupported capture scheme '{scheme}'")));
        }
        _ => uri,
    };
    let source = PcapStreamSource::open(uri, path, config)?;
    Ok(Box::new(source))
}
