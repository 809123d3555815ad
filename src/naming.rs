//! Segment file naming.

use std::path::{Path, PathBuf};

use time::{OffsetDateTime, UtcOffset};

use crate::sequence::DEFAULT_SEQUENCE_WIDTH;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// Calendar used for the date and time parts of a segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameZone {
    Utc,
    /// Fixed offset captured at startup.
    Local(UtcOffset),
}

impl NameZone {
    /// The host's current offset.
    ///
    /// Must be called before any thread is spawned; the lookup refuses to
    /// run in a multithreaded process, in which case UTC is used.
    pub fn local() -> Self {
        match UtcOffset::current_local_offset() {
            Ok(offset) => NameZone::Local(offset),
            Err(err) => {
                log::warn!("cannot determine local time offset ({err}), naming segments in UTC");
                NameZone::Utc
            }
        }
    }

    fn offset(self) -> UtcOffset {
        match self {
            NameZone::Utc => UtcOffset::UTC,
            NameZone::Local(offset) => offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Naming {
    /// Every segment reopens the same name; `-` is stdout.
    Fixed(String),
    /// `<base>/<YYYYMMDD>-<hhmmss>-<seq><extension>`.
    Sequenced {
        base: PathBuf,
        extension: String,
        zone: NameZone,
        width: usize,
    },
}

impl Naming {
    pub fn sequenced(base: impl Into<PathBuf>) -> Self {
        Naming::Sequenced {
            base: base.into(),
            extension: String::new(),
            zone: NameZone::Utc,
            width: DEFAULT_SEQUENCE_WIDTH,
        }
    }

    pub fn is_sequenced(&self) -> bool {
        matches!(self, Naming::Sequenced { .. })
    }

    /// Name for a segment opened at `ts`. `seq` is ignored for fixed names.
    pub fn filename(&self, ts: Timestamp, seq: u64) -> Result<String> {
        match self {
            Naming::Fixed(name) => Ok(name.clone()),
            Naming::Sequenced {
                base,
                extension,
                zone,
                width,
            } => segment_filename(base, ts, seq, *width, extension, *zone),
        }
    }
}

pub fn segment_filename(
    base: &Path,
    ts: Timestamp,
    seq: u64,
    width: usize,
    extension: &str,
    zone: NameZone,
) -> Result<String> {
    let dt = OffsetDateTime::from_unix_timestamp(i64::from(ts.secs()))
        .map_err(|err| Error::Config(format!("segment timestamp out of range: {err}")))?
        .to_offset(zone.offset());
    let date = dt.date();
    let name = format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}-{seq:0width$}{extension}",
        date.year(),
        date.month() as u8,
        date.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
    );
    Ok(base.join(name).to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::offset;

    #[test]
    fn utc_name_layout() {
        // 2021-03-04 05:06:07 UTC
        let ts = Timestamp::from_secs(1_614_834_367);
        let name = segment_filename(Path::new("/data"), ts, 42, 8, ".pcap.gz", NameZone::Utc)
            .expect("name");
        assert_eq!(name, "/data/20210304-050607-00000042.pcap.gz");
    }

    #[test]
    fn local_offset_shifts_the_clock() {
        let ts = Timestamp::from_secs(1_614_834_367);
        let zone = NameZone::Local(offset!(+8));
        let name = segment_filename(Path::new("out"), ts, 7, 3, "", zone).expect("name");
        assert_eq!(name, "out/20210304-130607-007");
    }

    #[test]
    fn fixed_name_ignores_sequence() {
        let naming = Naming::Fixed("-".to_string());
        assert_eq!(naming.filename(Timestamp::from_secs(5), 9).expect("name"), "-");
        assert!(!naming.is_sequenced());
        assert!(Naming::sequenced("/tmp").is_sequenced());
    }
}
