//! Timestamp-ordered merging of several packet captures into rotated,
//! sequence-numbered trace segments.

pub mod capture;
pub mod clock;
pub mod controller;
pub mod error;
pub mod gate;
pub mod multiplexer;
pub mod naming;
pub mod output;
pub mod pipeline;
pub mod privileges;
pub mod segment;
pub mod sequence;
pub mod shutdown;
pub mod stats;
pub mod timestamp;

pub use capture::{open_source, CaptureConfig, CaptureEvent, CaptureSource, CaptureStats, Packet};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{Controller, RunSummary};
pub use error::{Error, Result};
pub use gate::BackpressureGate;
pub use multiplexer::{Multiplexer, MuxConfig, Poll};
pub use naming::{NameZone, Naming};
pub use output::{Compression, OutputFormat, OutputUri, PacketSink, SinkConfig, SinkFactory, TraceSinkFactory};
pub use segment::{OutputConfig, RotationPolicy, SegmentManager};
pub use sequence::SequenceStore;
pub use shutdown::{install_signal_handlers, ShutdownToken};
pub use timestamp::Timestamp;
