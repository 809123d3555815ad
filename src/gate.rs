//! Rendezvous with an external consumer.
//!
//! Before a segment opens, the consumer has to signal readiness by making a
//! marker path exist. Its contents are never read.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::info;

use crate::shutdown::ShutdownToken;

pub const DEFAULT_GATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BackpressureGate {
    marker: Option<PathBuf>,
    interval: Duration,
}

impl BackpressureGate {
    pub fn new(marker: Option<PathBuf>) -> Self {
        Self {
            marker,
            interval: DEFAULT_GATE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }

    /// Whether opening a segment right now would not wait.
    pub fn is_ready(&self) -> bool {
        self.marker.as_deref().map_or(true, Path::exists)
    }

    /// Block until the marker exists or shutdown is requested.
    ///
    /// Returns the time spent sleeping; zero when no marker is configured or
    /// it already exists.
    pub fn await_ready(&self, shutdown: &ShutdownToken) -> Duration {
        let Some(marker) = &self.marker else {
            return Duration::ZERO;
        };
        let mut slept = Duration::ZERO;
        let mut suspended = false;
        loop {
            if shutdown.is_cancelled() || marker.exists() {
                break;
            }
            if !suspended {
                info!("waiting for {} before opening the next segment", marker.display());
                suspended = true;
            }
            let started = Instant::now();
            let interrupted = shutdown.sleep(self.interval);
            slept += started.elapsed();
            if interrupted {
                break;
            }
        }
        slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_never_waits() {
        let token = ShutdownToken::new().expect("token");
        assert_eq!(BackpressureGate::new(None).await_ready(&token), Duration::ZERO);
    }

    #[test]
    fn existing_marker_passes_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("go");
        let gate = BackpressureGate::new(Some(marker.clone()));
        assert!(!gate.is_ready());
        std::fs::write(&marker, b"").expect("marker");
        assert!(gate.is_ready());
        let token = ShutdownToken::new().expect("token");
        assert_eq!(gate.await_ready(&token), Duration::ZERO);
        assert!(BackpressureGate::new(None).is_ready());
    }

    #[test]
    fn shutdown_aborts_the_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = ShutdownToken::new().expect("token");
        token.cancel();
        let gate = BackpressureGate::new(Some(dir.path().join("never")));
        assert_eq!(gate.await_ready(&token), Duration::ZERO);
    }

    #[test]
    fn interrupted_sleep_counts_only_the_time_spent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = ShutdownToken::new().expect("token");
        let gate = BackpressureGate::new(Some(dir.path().join("never")))
            .with_interval(Duration::from_secs(30));

        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let slept = gate.await_ready(&token);
        canceller.join().expect("join");

        assert!(slept >= Duration::from_millis(40));
        assert!(slept < Duration::from_secs(10));
    }
}
