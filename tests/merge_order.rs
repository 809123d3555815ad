mod common;

use std::sync::Arc;

use common::{non_ip_packet, udp_packet, RecordingSinkFactory, ScriptedSource};
use tempfile::tempdir;
use tracemux::output::{Compression, OutputFormat, SinkConfig};
use tracemux::{
    CaptureEvent, CaptureSource, Clock, Controller, ManualClock, Multiplexer, MuxConfig, Naming,
    OutputConfig, RunSummary, SegmentManager, ShutdownToken, Timestamp,
};

fn run_merge(sources: Vec<Box<dyn CaptureSource>>) -> (RunSummary, RecordingSinkFactory) {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("merged.pcap");
    let factory = RecordingSinkFactory::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_secs(1_000)));
    let shutdown = ShutdownToken::new().expect("token");

    let config = OutputConfig::new(
        Naming::Fixed(output.to_string_lossy().into_owned()),
        SinkConfig {
            format: OutputFormat::PcapFile,
            compression: Compression::none(),
        },
    );
    let segments = SegmentManager::new(
        config,
        Box::new(factory.clone()),
        Arc::clone(&clock),
        shutdown.clone(),
    )
    .expect("segments");
    let mux = Multiplexer::new(sources, MuxConfig::default());
    let summary = Controller::new(mux, segments, clock, shutdown)
        .run()
        .expect("run");
    (summary, factory)
}

#[test]
fn interleaved_sources_merge_in_timestamp_order() {
    let (summary, factory) = run_merge(vec![
        ScriptedSource::at_secs("a", &[1, 3, 5]).boxed(),
        ScriptedSource::at_secs("b", &[2, 4, 6]).boxed(),
    ]);

    let segments = factory.finished();
    assert_eq!(segments.len(), 1);
    let expected: Vec<Timestamp> = (1..=6).map(Timestamp::from_secs).collect();
    assert_eq!(segments[0].timestamps(), expected);
    assert!(segments[0].raw.is_empty());

    assert_eq!(summary.global.packets, 6);
    assert_eq!(summary.global.disorders, 0);
    assert_eq!(summary.global.output_disorders, 0);
    assert_eq!(summary.segments, 1);
    assert_eq!(summary.sources.len(), 2);
    assert!(summary.sources.iter().all(|row| row.packets == 3 && row.disorders == 0));
}

#[test]
fn single_source_disorder_counts_at_both_levels() {
    let (summary, factory) = run_merge(vec![ScriptedSource::at_secs("a", &[5, 3]).boxed()]);

    let segments = factory.finished();
    assert_eq!(
        segments[0].timestamps(),
        vec![Timestamp::from_secs(5), Timestamp::from_secs(3)]
    );
    assert_eq!(summary.sources[0].disorders, 1);
    assert_eq!(summary.global.disorders, 1);
    assert_eq!(summary.global.output_disorders, 1);
    assert_eq!(summary.global.packets, 2);
}

#[test]
fn packets_without_network_layer_are_skipped() {
    let events = vec![
        CaptureEvent::Packet(non_ip_packet(Timestamp::from_secs(1))),
        CaptureEvent::Packet(udp_packet(Timestamp::from_secs(2), 7)),
        CaptureEvent::Packet(non_ip_packet(Timestamp::from_secs(3))),
    ];
    let (summary, factory) = run_merge(vec![ScriptedSource::new("a", events).boxed()]);

    let segments = factory.finished();
    assert_eq!(segments[0].timestamps(), vec![Timestamp::from_secs(2)]);
    assert_eq!(summary.global.packets, 1);
}

#[test]
fn equal_timestamps_go_to_the_lower_index_first() {
    let sources = vec![
        ScriptedSource::new("a", vec![CaptureEvent::Packet(udp_packet(Timestamp::from_secs(1), 0xa))])
            .boxed(),
        ScriptedSource::new("b", vec![CaptureEvent::Packet(udp_packet(Timestamp::from_secs(1), 0xb))])
            .boxed(),
    ];
    let (_, factory) = run_merge(sources);

    let packets = &factory.finished()[0].packets;
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0], udp_packet(Timestamp::from_secs(1), 0xa));
    assert_eq!(packets[1], udp_packet(Timestamp::from_secs(1), 0xb));
}

#[test]
fn merge_is_greedy_over_available_heads() {
    // b has nothing ready in the first round, so a's later packet goes first.
    let sources = vec![
        ScriptedSource::at_secs("a", &[10]).boxed(),
        ScriptedSource::new(
            "b",
            vec![
                CaptureEvent::Sleep(std::time::Duration::from_micros(10)),
                CaptureEvent::Packet(udp_packet(Timestamp::from_secs(5), 0)),
            ],
        )
        .boxed(),
    ];
    let (summary, factory) = run_merge(sources);

    assert_eq!(
        factory.finished()[0].timestamps(),
        vec![Timestamp::from_secs(10), Timestamp::from_secs(5)]
    );
    // Out of order in the output, but each source stayed ordered.
    assert_eq!(summary.global.output_disorders, 1);
    assert_eq!(summary.global.disorders, 0);
    assert!(summary.sources.iter().all(|row| row.disorders == 0));
}

#[test]
fn source_disorders_add_up_globally() {
    let (summary, _) = run_merge(vec![
        ScriptedSource::at_secs("a", &[4, 2, 6]).boxed(),
        ScriptedSource::at_secs("b", &[9, 7, 8, 1]).boxed(),
    ]);

    let per_source: Vec<u64> = summary.sources.iter().map(|row| row.disorders).collect();
    assert_eq!(per_source, vec![1, 2]);
    assert_eq!(summary.global.disorders, 3);
    assert_eq!(summary.global.packets, 7);
}
