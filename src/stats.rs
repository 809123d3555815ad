//! Segment and lifetime statistics reports.
//!
//! Drop counts are differential per segment: each segment report moves the
//! source's drop baseline forward and clears its segment packet count.

use log::{info, warn};

use crate::multiplexer::Source;
use crate::timestamp::Timestamp;

/// What a closed segment held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub filename: String,
    pub opened_at: Timestamp,
    pub last_ts: Option<Timestamp>,
    pub packets: u64,
    /// Sum of captured lengths.
    pub bytes: u64,
    pub disorders: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub packets: u64,
    /// Packets older than their predecessor from the same source.
    pub disorders: u64,
    /// Packets older than their predecessor in the merged output.
    pub output_disorders: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub uri: String,
    pub packets: u64,
    pub disorders: u64,
    /// `None` when the capture layer could not report drops.
    pub dropped: Option<u64>,
}

pub fn dump_segment_stats(summary: &SegmentSummary, sources: &mut [Source]) -> Vec<SourceRow> {
    info!(
        "segment {}: packets={}, bytes={}, disorders={}",
        summary.filename, summary.packets, summary.bytes, summary.disorders
    );
    let mut rows = Vec::with_capacity(sources.len());
    for source in sources.iter_mut() {
        let dropped = match source.handle().stats() {
            Ok(stats) => {
                let delta = stats.dropped.saturating_sub(source.drop_baseline);
                source.drop_baseline = stats.dropped;
                Some(delta)
            }
            Err(err) => {
                warn!("{}: {err}", source.uri);
                None
            }
        };
        let row = SourceRow {
            uri: source.uri.clone(),
            packets: source.segment_packets,
            disorders: source.disorders,
            dropped,
        };
        log_row(&row);
        source.segment_packets = 0;
        rows.push(row);
    }
    rows
}

/// Lifetime totals; drops are absolute here.
pub fn dump_total_stats(global: &GlobalStats, sources: &[Source]) -> Vec<SourceRow> {
    info!(
        "total: packets={}, disorders={}, output_disorders={}",
        global.packets, global.disorders, global.output_disorders
    );
    sources
        .iter()
        .map(|source| {
            let dropped = match source.handle().stats() {
                Ok(stats) => Some(stats.dropped),
                Err(err) => {
                    warn!("{}: {err}", source.uri);
                    None
                }
            };
            let row = SourceRow {
                uri: source.uri.clone(),
                packets: source.total_packets,
                disorders: source.disorders,
                dropped,
            };
            log_row(&row);
            row
        })
        .collect()
}

fn log_row(row: &SourceRow) {
    match row.dropped {
        Some(dropped) => info!(
            "  uri={}, packets={}, disorders={}, dropped={}",
            row.uri, row.packets, row.disorders, dropped
        ),
        None => info!("  uri={}, packets={}, disorders={}", row.uri, row.packets, row.disorders),
    }
}
