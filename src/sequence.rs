//! Persisted segment sequence counter.
//!
//! The side file holds the last reserved number as decimal text followed by
//! a newline. A number is reserved, and persisted, before the file that
//! carries it is opened, so a restart can skip a value but never reuse one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Error, Result};

pub const DEFAULT_SEQUENCE_WIDTH: usize = 8;
const MAX_SEQUENCE_WIDTH: usize = 19;

#[derive(Debug)]
pub struct SequenceStore {
    path: Option<PathBuf>,
    next: u64,
    max: u64,
}

impl SequenceStore {
    /// Counter starting at zero that is never written anywhere.
    pub fn in_memory(width: usize) -> Result<Self> {
        Ok(Self {
            path: None,
            next: 0,
            max: max_for_width(width)?,
        })
    }

    /// Resume from `path`: the next value is the stored one plus one.
    ///
    /// A missing or empty file starts at zero. Anything else that is not a
    /// single in-range decimal line is fatal.
    pub fn open(path: impl Into<PathBuf>, width: usize) -> Result<Self> {
        let path = path.into();
        let max = max_for_width(width)?;
        let next = match load_sequence(&path, max)? {
            Some(last) => wrap_next(last, max),
            None => 0,
        };
        Ok(Self {
            path: Some(path),
            next,
            max,
        })
    }

    /// The value the next [`reserve`](Self::reserve) hands out.
    pub fn peek(&self) -> u64 {
        self.next
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Take the next value and record it as used.
    ///
    /// A failed write is logged; the counter advances regardless.
    pub fn reserve(&mut self) -> u64 {
        let value = self.next;
        if let Some(path) = &self.path {
            if let Err(err) = store_sequence(path, value) {
                warn!("cannot save sequence number {value} to {}: {err}", path.display());
            }
        }
        self.next = wrap_next(value, self.max);
        value
    }
}

fn max_for_width(width: usize) -> Result<u64> {
    if width == 0 || width > MAX_SEQUENCE_WIDTH {
        return Err(Error::Config(format!(
            "sequence width must be between 1 and {MAX_SEQUENCE_WIDTH}, got {width}"
        )));
    }
    Ok(10u64.pow(width as u32) - 1)
}

fn wrap_next(value: u64, max: u64) -> u64 {
    if value >= max {
        0
    } else {
        value + 1
    }
}

pub fn load_sequence(path: &Path, max: u64) -> Result<Option<u64>> {
    let corrupt = |reason: &str| Error::CorruptSequence {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            OpenOptions::new().create(true).append(true).open(path)?;
            warn!("sequence file {} did not exist, starting from zero", path.display());
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    if contents.is_empty() {
        warn!("sequence file {} is truncated, starting from zero", path.display());
        return Ok(None);
    }
    let Some(digits) = contents.strip_suffix(b"\n") else {
        return Err(corrupt("missing trailing newline"));
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(corrupt("expected a single decimal number"));
    }
    let text = std::str::from_utf8(digits).map_err(|_| corrupt("not text"))?;
    let value: u64 = text.parse().map_err(|_| corrupt("number out of range"))?;
    if value > max {
        return Err(corrupt("number exceeds the configured width"));
    }
    Ok(Some(value))
}

pub fn store_sequence(path: &Path, value: u64) -> Result<()> {
    let tmp_path = path.with_extension("seq.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(format!("{value}\n").as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
