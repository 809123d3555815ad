//! Output collaborator: encapsulation formats, compression and sinks.
//!
//! The segment manager hands a [`Destination`] to a [`SinkFactory`] and gets
//! back a started [`PacketSink`]. [`TraceSinkFactory`] is the real one.

mod compress;
mod erf;
mod pcap;

use std::fs::File;
use std::io::Write;

use log::warn;

use crate::capture::Packet;
use crate::{Error, Result};

pub use compress::CompressedWriter;
pub use erf::{ErfEncoder, ERF_HEADER_LEN};
pub use pcap::{PcapEncoder, NULL_PCAP, PCAP_HEADER_LEN, PCAP_RECORD_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Classic little-endian microsecond pcap.
    PcapFile,
    /// Endace extensible record format.
    Erf,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "pcapfile" | "pcap" => Ok(OutputFormat::PcapFile),
            "erf" => Ok(OutputFormat::Erf),
            other => Err(Error::Config(format!("unknown output format '{other}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::PcapFile => "pcapfile",
            OutputFormat::Erf => "erf",
        }
    }

    /// Bytes that stand in for a segment without packets, for formats where
    /// a zero-length file is not a valid capture.
    pub fn placeholder(self) -> Option<&'static [u8]> {
        match self {
            OutputFormat::PcapFile => Some(&NULL_PCAP),
            OutputFormat::Erf => None,
        }
    }
}

/// `format:target`, e.g. `pcapfile:-` or `erf:/data/trace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputUri {
    pub format: OutputFormat,
    pub target: String,
}

impl OutputUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (format, target) = uri
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("malformed output uri '{uri}'")))?;
        if target.is_empty() {
            return Err(Error::Config(format!("output uri '{uri}' has no target")));
        }
        Ok(Self {
            format: OutputFormat::from_name(format)?,
            target: target.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub kind: CompressionKind,
    /// 0-9; `None` lets the codec pick.
    pub level: Option<u32>,
}

impl Default for Compression {
    fn default() -> Self {
        Self::none()
    }
}

impl Compression {
    pub const MAX_LEVEL: u32 = 9;

    pub fn none() -> Self {
        Self {
            kind: CompressionKind::None,
            level: None,
        }
    }

    /// Resolve the `--compress-type` / `--compress-level` pair.
    ///
    /// Names match on prefix (`gz`, `gzip`, `zlib`, `zst`, `zstd`, `no`,
    /// `none`). A level without a type means gzip.
    pub fn from_options(kind: Option<&str>, level: Option<u32>) -> Result<Self> {
        if let Some(level) = level {
            if level > Self::MAX_LEVEL {
                return Err(Error::Config(format!(
                    "compression level must be between 0 and {}, got {level}",
                    Self::MAX_LEVEL
                )));
            }
        }
        let kind = match kind {
            None if level.is_some() => {
                warn!("compression level set without a type, using gzip");
                CompressionKind::Gzip
            }
            None => CompressionKind::None,
            Some(name) if name.starts_with("gz") || name.starts_with("zlib") => CompressionKind::Gzip,
            Some(name) if name.starts_with("zst") => CompressionKind::Zstd,
            Some(name) if name.starts_with("no") => CompressionKind::None,
            Some(name) if name.starts_with("bz") || name.starts_with("lzo") || name.starts_with("xz") => {
                return Err(Error::Unsupported("bzip2, lzo and xz output compression"));
            }
            Some(name) => return Err(Error::Config(format!("unknown compression type '{name}'"))),
        };
        Ok(Self { kind, level })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub format: OutputFormat,
    pub compression: Compression,
}

/// An opened output descriptor and the name it was opened under.
#[derive(Debug)]
pub struct Destination {
    pub name: String,
    pub file: File,
}

/// A started output in one encapsulation.
pub trait PacketSink {
    /// Encode and write one packet; returns the bytes handed to the stream.
    fn write_packet(&mut self, packet: &Packet) -> Result<usize>;

    /// Write bytes that bypass the encoder (still compressed).
    fn write_raw(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush everything, end the compressed stream and release the descriptor.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait SinkFactory {
    fn create(&self, destination: Destination, config: &SinkConfig) -> Result<Box<dyn PacketSink>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TraceSinkFactory;

impl SinkFactory for TraceSinkFactory {
    fn create(&self, destination: Destination, config: &SinkConfig) -> Result<Box<dyn PacketSink>> {
        let Destination { name, file } = destination;
        let out = CompressedWriter::new(file, config.compression)
            .map_err(|err| Error::output(&name, format!("cannot start compressor: {err}")))?;
        let encoder = match config.format {
            OutputFormat::PcapFile => Encoder::Pcap(PcapEncoder::new()),
            OutputFormat::Erf => Encoder::Erf(ErfEncoder),
        };
        Ok(Box::new(TraceSink { name, encoder, out }))
    }
}

enum Encoder {
    Pcap(PcapEncoder),
    Erf(ErfEncoder),
}

struct TraceSink {
    name: String,
    encoder: Encoder,
    out: CompressedWriter,
}

impl PacketSink for TraceSink {
    fn write_packet(&mut self, packet: &Packet) -> Result<usize> {
        let written = match &mut self.encoder {
            Encoder::Pcap(encoder) => encoder.write_packet(&mut self.out, packet),
            Encoder::Erf(encoder) => encoder.write_packet(&mut self.out, packet),
        };
        written.map_err(|err| match err {
            Error::Io(io) => Error::output(&self.name, io.to_string()),
            other => other,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|err| Error::output(&self.name, err.to_string()))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let TraceSink { name, out, .. } = *self;
        out.finish()
            .map_err(|err| Error::output(&name, format!("cannot finalise: {err}")))
    }
}
