use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

use tracemux::capture::{open_source, CaptureConfig, DEFAULT_SNAPLEN};
use tracemux::naming::{NameZone, Naming};
use tracemux::pipeline::parse_pipeline;
use tracemux::privileges::drop_privileges;
use tracemux::sequence::DEFAULT_SEQUENCE_WIDTH;
use tracemux::{
    install_signal_handlers, BackpressureGate, Clock, Compression, Controller, Multiplexer, MuxConfig,
    OutputConfig, OutputUri, RotationPolicy, SegmentManager, ShutdownToken, SinkConfig, SystemClock,
    TraceSinkFactory,
};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "tracemux")]
#[command(about = "Merge packet captures by timestamp into rotated trace segments")]
#[command(override_usage = "tracemux [OPTIONS] <OUTPUT_URI> <INPUT_URI>...\n       \
                            tracemux [OPTIONS] --baseuri <BASE_URI> <INPUT_URI>...")]
struct Cli {
    /// Write sequence-numbered, timestamped files under this format:directory
    #[arg(short = 'B', long = "baseuri")]
    base_uri: Option<String>,

    /// Rotate the output every so many seconds, even without packets
    #[arg(short = 'G', long = "rotate-seconds")]
    rotate_seconds: Option<u64>,

    /// Rotate the output once a segment holds this many MiB of packets
    #[arg(short = 'S', long = "rotate-sizemb")]
    rotate_size_mb: Option<u64>,

    /// Persist the segment sequence number in this file
    #[arg(short = 'N', long = "seqfile")]
    seqfile: Option<PathBuf>,

    /// Bytes of each packet to keep
    #[arg(short = 's', long, default_value_t = DEFAULT_SNAPLEN)]
    snaplen: u32,

    /// Name segments in UTC instead of local time
    #[arg(short = 'U', long = "use-utc")]
    use_utc: bool,

    /// More log output (repeat for debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Wait for this file to exist before opening each segment
    #[arg(short = 'W', long)]
    watchfile: Option<PathBuf>,

    /// Readiness wait per merge round, in milliseconds
    #[arg(short = 'w', long = "maxwait_ms", default_value_t = 1)]
    max_wait_ms: u64,

    /// Compression level, 0-9
    #[arg(short = 'z', long = "compress-level", value_parser = clap::value_parser!(u32).range(0..=9))]
    compress_level: Option<u32>,

    /// Compression type: none, gzip, zstd
    #[arg(short = 'Z', long = "compress-type")]
    compress_type: Option<String>,

    /// Extension appended to sequenced file names (with --baseuri)
    #[arg(long = "file-ext")]
    file_ext: Option<String>,

    /// Switch to this user once the inputs are open
    #[arg(long = "relinquish-privileges")]
    relinquish_privileges: Option<String>,

    /// Pipe the output through this command before it reaches the file
    #[arg(long)]
    pipeout: Option<String>,

    /// Replay capture files at their recorded pace
    #[arg(long)]
    realtime: bool,

    /// Output URI (unless --baseuri is given) followed by input URIs
    #[arg(required = true)]
    uris: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    // The local offset can only be read while the process is single threaded.
    let zone = if cli.use_utc { NameZone::Utc } else { NameZone::local() };

    let mut uris = cli.uris.into_iter();
    let (output, naming) = match &cli.base_uri {
        Some(base) => {
            let output = OutputUri::parse(base).context("invalid --baseuri")?;
            let naming = Naming::Sequenced {
                base: PathBuf::from(&output.target),
                extension: cli.file_ext.clone().unwrap_or_default(),
                zone,
                width: DEFAULT_SEQUENCE_WIDTH,
            };
            (output, naming)
        }
        None => {
            let Some(first) = uris.next() else {
                bail!("missing output uri");
            };
            let output = OutputUri::parse(&first).context("invalid output uri")?;
            if cli.file_ext.is_some() {
                log::warn!("--file-ext only applies with --baseuri");
            }
            let naming = Naming::Fixed(output.target.clone());
            (output, naming)
        }
    };
    let inputs: Vec<String> = uris.collect();
    if inputs.is_empty() {
        bail!("at least one input uri is required");
    }

    let compression = Compression::from_options(cli.compress_type.as_deref(), cli.compress_level)
        .context("invalid compression options")?;
    let mut config = OutputConfig::new(
        naming,
        SinkConfig {
            format: output.format,
            compression,
        },
    );
    config.rotation = RotationPolicy::new(
        cli.rotate_size_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB)),
        cli.rotate_seconds.filter(|secs| *secs > 0),
    );
    config.gate = BackpressureGate::new(cli.watchfile);
    config.sequence_file = cli.seqfile;
    config.pipeline = cli
        .pipeout
        .as_deref()
        .map(parse_pipeline)
        .transpose()
        .context("invalid --pipeout")?;

    let shutdown = ShutdownToken::new().context("cannot create shutdown token")?;
    install_signal_handlers(&shutdown).context("cannot install signal handlers")?;

    let capture = CaptureConfig {
        snaplen: cli.snaplen,
        realtime: cli.realtime,
    };
    let mut sources = Vec::with_capacity(inputs.len());
    for uri in &inputs {
        let source = open_source(uri, &capture).with_context(|| format!("cannot open input {uri}"))?;
        sources.push(source);
    }

    if let Some(user) = &cli.relinquish_privileges {
        drop_privileges(user).context("cannot relinquish privileges")?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let segments = SegmentManager::new(
        config,
        Box::new(TraceSinkFactory),
        Arc::clone(&clock),
        shutdown.clone(),
    )
    .context("cannot set up output")?;
    let mux = Multiplexer::new(sources, MuxConfig::new(Duration::from_millis(cli.max_wait_ms)));

    info!("merging {} inputs into {}", inputs.len(), output.format.name());
    let summary = Controller::new(mux, segments, clock, shutdown).run()?;
    info!(
        "done: {} packets, {} disorders ({} in output), {} segments",
        summary.global.packets,
        summary.global.disorders,
        summary.global.output_disorders,
        summary.segments
    );
    Ok(())
}
