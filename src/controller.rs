//! Drives the multiplexer and the segment manager until the inputs run dry
//! or shutdown is requested.

use std::sync::Arc;

use log::{info, warn};

use crate::clock::Clock;
use crate::multiplexer::{Multiplexer, Poll};
use crate::segment::SegmentManager;
use crate::shutdown::ShutdownToken;
use crate::stats::{dump_segment_stats, dump_total_stats, GlobalStats, SourceRow};
use crate::Result;

/// Totals of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub global: GlobalStats,
    pub segments: u64,
    pub sources: Vec<SourceRow>,
}

pub struct Controller {
    mux: Multiplexer,
    segments: SegmentManager,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownToken,
}

impl Controller {
    pub fn new(
        mux: Multiplexer,
        segments: SegmentManager,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            mux,
            segments,
            clock,
            shutdown,
        }
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    /// Run to completion, then close the output and report totals.
    ///
    /// On a fatal error the output is still closed on a best-effort basis
    /// before the error is returned.
    pub fn run(mut self) -> Result<RunSummary> {
        while self.mux.active_count() > 0 && !self.shutdown.is_cancelled() {
            match self.step() {
                Ok(()) => {}
                Err(err) if !err.is_fatal() => warn!("{err}"),
                Err(err) => {
                    if let Err(close_err) = self.segments.finish(self.clock.now()) {
                        warn!("cannot close output after failure: {close_err}");
                    }
                    return Err(err);
                }
            }
        }
        if self.shutdown.is_cancelled() {
            info!("shutdown requested");
        } else {
            info!("all capture sources finished");
        }
        self.finish()
    }

    /// One round: idle rotation, merge, write.
    pub fn step(&mut self) -> Result<()> {
        let now = self.clock.now();
        if self.segments.rotation_due(now) {
            self.await_consumer();
        }
        self.segments.check_idle_rotation(now)?;
        self.report_closed();

        match self.mux.poll(&self.shutdown)? {
            Poll::Selected(index) => {
                if let Some(packet) = self.mux.take(index) {
                    if !self.segments.is_open() || self.segments.rotation_due(packet.timestamp) {
                        self.await_consumer();
                    }
                    self.segments.check_packet_rotation(packet.timestamp)?;
                    self.segments.write_packet(&packet)?;
                }
            }
            Poll::Idle => {
                if let Some(pause) = self.mux.idle_pause() {
                    self.shutdown.sleep(pause);
                }
            }
        }
        self.report_closed();
        Ok(())
    }

    /// Hold the sources paused while the next segment waits for its
    /// consumer.
    fn await_consumer(&mut self) {
        let gate = self.segments.gate();
        if gate.is_ready() || self.shutdown.is_cancelled() {
            return;
        }
        self.mux.pause_all();
        let slept = gate.await_ready(&self.shutdown);
        self.mux.resume_all();
        info!("sources were paused for {:.1}s", slept.as_secs_f64());
    }

    fn finish(mut self) -> Result<RunSummary> {
        self.segments.finish(self.clock.now())?;
        self.report_closed();

        let global = GlobalStats {
            packets: self.mux.total_packets(),
            disorders: self.mux.total_disorders(),
            output_disorders: self.segments.total_disorders(),
        };
        let sources = dump_total_stats(&global, self.mux.sources());
        let segments = self.segments.segments_opened();
        self.mux.release();
        Ok(RunSummary {
            global,
            segments,
            sources,
        })
    }

    fn report_closed(&mut self) {
        for summary in self.segments.take_closed() {
            dump_segment_stats(&summary, self.mux.sources_mut());
        }
    }
}
