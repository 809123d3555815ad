mod common;

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{
    loopback_packet, raw_ip_packet, read_pcap, udp_frame, udp_packet, write_pcap, ScriptedSource,
};
use tempfile::tempdir;
use tracemux::output::{Compression, OutputFormat, SinkConfig};
use tracemux::capture::LINKTYPE_ETHERNET;
use tracemux::output::ERF_HEADER_LEN;
use tracemux::{
    open_source, CaptureConfig, CaptureEvent, CaptureSource, Clock, Controller, Multiplexer,
    MuxConfig, Naming, OutputConfig, RunSummary, SegmentManager, ShutdownToken, SystemClock,
    Timestamp, TraceSinkFactory,
};

fn run_files(inputs: &[String], output: &std::path::Path, snaplen: u32) -> RunSummary {
    let capture = CaptureConfig {
        snaplen,
        realtime: false,
    };
    let sources = inputs
        .iter()
        .map(|uri| open_source(uri, &capture).expect("open input"))
        .collect();
    run_sources(sources, output, OutputFormat::PcapFile)
}

fn run_sources(
    sources: Vec<Box<dyn CaptureSource>>,
    output: &std::path::Path,
    format: OutputFormat,
) -> RunSummary {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shutdown = ShutdownToken::new().expect("token");
    let config = OutputConfig::new(
        Naming::Fixed(output.to_string_lossy().into_owned()),
        SinkConfig {
            format,
            compression: Compression::none(),
        },
    );
    let segments = SegmentManager::new(
        config,
        Box::new(TraceSinkFactory),
        Arc::clone(&clock),
        shutdown.clone(),
    )
    .expect("segments");
    let mux = Multiplexer::new(sources, MuxConfig::new(Duration::from_millis(5)));
    Controller::new(mux, segments, clock, shutdown)
        .run()
        .expect("run")
}

#[test]
fn two_capture_files_merge_into_one_pcap() {
    let dir = tempdir().expect("tempdir");
    let a = dir.path().join("a.pcap");
    let b = dir.path().join("b.pcap");
    write_pcap(&a, &[(100, 1, udp_frame(1)), (100, 3, udp_frame(3)), (101, 0, udp_frame(5))]);
    write_pcap(&b, &[(100, 2, udp_frame(2)), (100, 4, udp_frame(4))]);
    let output = dir.path().join("merged.pcap");

    let inputs = vec![
        format!("pcapfile:{}", a.display()),
        b.to_string_lossy().into_owned(),
    ];
    let summary = run_files(&inputs, &output, 65_535);
    assert_eq!(summary.global.packets, 5);
    assert_eq!(summary.global.disorders, 0);

    let (link_type, records) = read_pcap(&output);
    assert_eq!(link_type, 1);
    let times: Vec<(u32, u32)> = records.iter().map(|r| (r.ts_sec, r.ts_usec)).collect();
    assert_eq!(times, vec![(100, 1), (100, 2), (100, 3), (100, 4), (101, 0)]);
}

#[test]
fn ethernet_and_raw_ip_inputs_share_one_pcap() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("mixed.pcap");
    let sources = vec![
        ScriptedSource::new(
            "eth",
            vec![
                CaptureEvent::Packet(udp_packet(Timestamp::from_secs(1), 1)),
                CaptureEvent::Packet(udp_packet(Timestamp::from_secs(3), 3)),
            ],
        )
        .boxed(),
        ScriptedSource::new("raw", vec![CaptureEvent::Packet(raw_ip_packet(Timestamp::from_secs(2), 2))])
            .boxed(),
    ];

    let summary = run_sources(sources, &output, OutputFormat::PcapFile);
    assert_eq!(summary.global.packets, 3);

    let (link_type, records) = read_pcap(&output);
    assert_eq!(link_type, LINKTYPE_ETHERNET);
    assert_eq!(records.iter().map(|r| r.ts_sec).collect::<Vec<_>>(), vec![1, 2, 3]);
    // Synthetic header in front of the raw datagram.
    assert_eq!(&records[1].data[12..14], &[0x08, 0x00]);
    assert_eq!(&records[1].data[14..], &udp_frame(2)[14..]);
}

#[test]
fn loopback_input_is_written_to_erf() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("loop.erf");
    let sources = vec![ScriptedSource::new(
        "lo",
        vec![
            CaptureEvent::Packet(loopback_packet(Timestamp::from_secs(1), 1)),
            CaptureEvent::Packet(loopback_packet(Timestamp::from_secs(2), 2)),
        ],
    )
    .boxed()];

    let summary = run_sources(sources, &output, OutputFormat::Erf);
    assert_eq!(summary.global.packets, 2);

    let bytes = fs::read(&output).expect("read");
    let datagram_len = udp_frame(0).len() - 14;
    assert_eq!(bytes.len(), 2 * (ERF_HEADER_LEN + datagram_len));
    assert_eq!(&bytes[ERF_HEADER_LEN..ERF_HEADER_LEN + datagram_len], &udp_frame(1)[14..]);
}

#[test]
fn snaplen_truncates_written_records() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("in.pcap");
    let mut big = udp_frame(9);
    big.resize(200, 0xab);
    write_pcap(&input, &[(50, 0, big)]);
    let output = dir.path().join("out.pcap");

    run_files(&[input.to_string_lossy().into_owned()], &output, 64);

    let (_, records) = read_pcap(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].caplen, 64);
    assert_eq!(records[0].origlen, 200);
}

#[test]
fn empty_capture_produces_a_valid_empty_pcap() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("empty.pcap");
    write_pcap(&input, &[]);
    let output = dir.path().join("out.pcap");

    let summary = run_files(&[input.to_string_lossy().into_owned()], &output, 64);
    assert_eq!(summary.global.packets, 0);
    assert_eq!(summary.segments, 1);
    assert_eq!(fs::read(&output).expect("read"), tracemux::output::NULL_PCAP);
}

#[test]
fn fifo_input_is_read_as_a_stream() {
    let dir = tempdir().expect("tempdir");
    let fifo = dir.path().join("feed");
    let c_path = CString::new(fifo.as_os_str().as_bytes()).expect("path");
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

    let staging = dir.path().join("staging.pcap");
    write_pcap(&staging, &[(7, 0, udp_frame(1)), (8, 0, udp_frame(2))]);
    let bytes = fs::read(&staging).expect("staging");

    let writer_path = fifo.clone();
    let writer = thread::spawn(move || {
        let mut pipe = fs::OpenOptions::new()
            .write(true)
            .open(&writer_path)
            .expect("open fifo");
        pipe.write_all(&bytes[..40]).expect("header");
        thread::sleep(Duration::from_millis(50));
        pipe.write_all(&bytes[40..]).expect("rest");
    });

    let output = dir.path().join("out.pcap");
    let summary = run_files(&[fifo.to_string_lossy().into_owned()], &output, 65_535);
    writer.join().expect("writer");

    assert_eq!(summary.global.packets, 2);
    let (_, records) = read_pcap(&output);
    assert_eq!(records.iter().map(|r| r.ts_sec).collect::<Vec<_>>(), vec![7, 8]);
}
