use std::fs::File;
use std::io::{self, BufWriter, Write};

use flate2::write::GzEncoder;

use super::{Compression, CompressionKind};

const WRITE_BUFFER: usize = 1 << 20;
const DEFAULT_GZIP_LEVEL: u32 = 6;

/// The byte stream under an encoder, optionally compressed.
pub enum CompressedWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
}

impl CompressedWriter {
    pub fn new(file: File, compression: Compression) -> io::Result<Self> {
        let buffered = BufWriter::with_capacity(WRITE_BUFFER, file);
        Ok(match compression.kind {
            CompressionKind::None => CompressedWriter::Plain(buffered),
            CompressionKind::Gzip => {
                let level = compression.level.unwrap_or(DEFAULT_GZIP_LEVEL);
                CompressedWriter::Gzip(GzEncoder::new(buffered, flate2::Compression::new(level)))
            }
            CompressionKind::Zstd => {
                // zstd treats 0 as its own default level
                let level = compression.level.unwrap_or(0) as i32;
                CompressedWriter::Zstd(zstd::Encoder::new(buffered, level)?)
            }
        })
    }

    /// Terminate the compressed stream and flush down to the descriptor.
    pub fn finish(self) -> io::Result<()> {
        let mut buffered = match self {
            CompressedWriter::Plain(buffered) => buffered,
            CompressedWriter::Gzip(encoder) => encoder.finish()?,
            CompressedWriter::Zstd(encoder) => encoder.finish()?,
        };
        buffered.flush()?;
        let file = buffered.into_inner().map_err(|err| err.into_error())?;
        // fsync is meaningless for pipes and sockets; ignore its failure there
        let _ = file.sync_data();
        Ok(())
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Gzip(w) => w.write(buf),
            CompressedWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Gzip(w) => w.flush(),
            CompressedWriter::Zstd(w) => w.flush(),
        }
    }
}
