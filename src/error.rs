use std::path::PathBuf;

use thiserror::Error;

use crate::timestamp::Timestamp;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt sequence file {}: {reason}", path.display())]
    CorruptSequence { path: PathBuf, reason: String },
    #[error("capture error on {uri}: {reason}")]
    Capture { uri: String, reason: String },
    #[error("output error on {name}: {reason}")]
    Output { name: String, reason: String },
    #[error("pipeline error: {0}")]
    Pipeline(String),
    #[error("statistics unavailable for {uri}: {reason}")]
    Stats { uri: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// One packet the output format cannot carry; the run goes on without it.
    #[error("packet at {at} not written: {reason}")]
    Unencodable { at: Timestamp, reason: &'static str },
}

impl Error {
    pub(crate) fn capture(uri: &str, reason: impl Into<String>) -> Self {
        Error::Capture {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn output(name: &str, reason: impl Into<String>) -> Self {
        Error::Output {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the run loop has to stop on this error.
    ///
    /// Statistics queries are best effort and a single unencodable packet
    /// is dropped; everything else that reaches the controller means the
    /// output can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Stats { .. } | Error::Unencodable { .. } => false,
            Error::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
