//! Stop protocol integration tests
//!
//! Tests cover:
//! - Every sample accepted while running reaches the sinks after stop
//! - Partial packets and multi-input nodes drain on stop
//! - Concurrent stop requests
//! - Devices feeding the graph from their own threads
//! - Emergency stop on queue overflow
//! - Recorded files and the record set index

mod common;

use common::builders::GraphBuilder;
use common::mock_helpers::create_test_daq;
use common::{ramp, test_settings, wait_until};
use flowgraph_rs::backend::{Device, SignalPattern, SimulatedDevice};
use flowgraph_rs::pipeline::nodes::{CollectorSinkNode, RecorderNode, ValueSinkNode};
use flowgraph_rs::pipeline::{
    AttributeValue, GraphEvent, InputPort, NodeArgs, NodeBehavior, NodeCore, NotificationLevel,
    PortDataType, PortDescriptor, ProcessingState, TimeLocatedBuffer,
};
use flowgraph_rs::session::{LineKind, RecordSetCollector, RecordSetReader, INDEX_FILE_NAME};
use flowgraph_rs::{Graph, GraphState, Result, TimeStamp};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn collected(graph: &Graph, name: &str) -> Vec<f64> {
    graph
        .node_by_name(name)
        .and_then(|node| node.with_behavior(|sink: &CollectorSinkNode| sink.samples().to_vec()))
        .unwrap_or_default()
}

fn chain(dir: &tempfile::TempDir) -> Graph {
    let (graph, _) = GraphBuilder::new(test_settings(dir))
        .node("signal_source", "Source")
        .node("passthrough", "A")
        .node_with("gain", "B", &[("factor", AttributeValue::Double(1.0))])
        .node_with("collector_sink", "Sink", &[("keep", AttributeValue::Bool(true))])
        .link("Source", "A")
        .link("A", "B")
        .link("B", "Sink")
        .build();
    graph
}

#[test]
fn test_stop_delivers_queued_packets() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain(&dir);
    let feed = graph.feed(graph.node_by_name("Source").unwrap().id()).unwrap();
    graph.run().unwrap();

    for i in 0..3 {
        feed.push(&ramp(i * 100, 100)).unwrap();
    }
    assert!(graph.stop().unwrap());

    assert_eq!(collected(&graph, "Sink"), ramp(0, 300));
    let last = graph
        .node_by_name("Sink")
        .unwrap()
        .with_behavior(|sink: &CollectorSinkNode| sink.last_stamp())
        .unwrap();
    assert_eq!(last, Some(TimeStamp::from_seconds(0.3)));
    assert!(graph
        .nodes()
        .iter()
        .all(|n| n.state() == ProcessingState::Stopped));
}

#[test]
fn test_stop_delivers_partial_packets() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain(&dir);
    let feed = graph.feed(graph.node_by_name("Source").unwrap().id()).unwrap();
    graph.run().unwrap();

    feed.push(&ramp(0, 37)).unwrap();
    feed.push(&ramp(37, 250)).unwrap();
    feed.push(&ramp(287, 13)).unwrap();
    assert!(graph.stop().unwrap());

    assert_eq!(collected(&graph, "Sink"), ramp(0, 300));
    let sink = graph.node_by_name("Sink").unwrap();
    assert_eq!(sink.inputs()[0].queued(), 0);
}

#[test]
fn test_push_after_stop_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain(&dir);
    let feed = graph.feed(graph.node_by_name("Source").unwrap().id()).unwrap();
    assert!(feed.push(&[1.0]).is_err());
    graph.run().unwrap();
    assert!(feed.is_running());
    graph.stop().unwrap();
    assert!(!feed.is_running());
    assert!(feed.push(&[1.0]).is_err());
}

#[test]
fn test_runs_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain(&dir);
    let feed = graph.feed(graph.node_by_name("Source").unwrap().id()).unwrap();

    graph.run().unwrap();
    feed.push(&ramp(0, 150)).unwrap();
    graph.stop().unwrap();

    graph.run().unwrap();
    assert_eq!(feed.position(), TimeStamp::ZERO);
    feed.push(&ramp(0, 50)).unwrap();
    graph.stop().unwrap();

    assert_eq!(collected(&graph, "Sink").len(), 200);
    assert_eq!(graph.run_count(), 2);
}

#[test]
#[serial]
fn test_concurrent_stop_is_performed_once() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain(&dir);
    let feed = graph.feed(graph.node_by_name("Source").unwrap().id()).unwrap();
    graph.run().unwrap();
    feed.push(&ramp(0, 420)).unwrap();

    let performed: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4).map(|_| s.spawn(|| graph.stop().unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(performed.iter().filter(|p| **p).count(), 1);
    assert_eq!(graph.state(), GraphState::Stopped);
    assert_eq!(collected(&graph, "Sink"), ramp(0, 420));
}

#[test]
fn test_adder_drains_both_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, ids) = GraphBuilder::new(test_settings(&dir))
        .node("signal_source", "A")
        .node("signal_source", "B")
        .node("adder", "Sum")
        .node_with("collector_sink", "Sink", &[("keep", AttributeValue::Bool(true))])
        .connect("A", "out", "Sum", "in0")
        .connect("B", "out", "Sum", "in1")
        .link("Sum", "Sink")
        .build();
    let a = graph.feed(ids["A"]).unwrap();
    let b = graph.feed(ids["B"]).unwrap();
    graph.run().unwrap();

    a.push(&vec![1.0; 250]).unwrap();
    b.push(&vec![2.0; 250]).unwrap();
    assert!(graph.stop().unwrap());

    assert_eq!(collected(&graph, "Sink"), vec![3.0; 250]);
}

#[test]
fn test_unconnected_nodes_do_not_block_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, ids) = GraphBuilder::new(test_settings(&dir))
        .node("signal_source", "Source")
        .node("passthrough", "Lonely")
        .node("adder", "Half")
        .node_with("collector_sink", "Sink", &[("keep", AttributeValue::Bool(true))])
        .connect("Source", "out", "Half", "in1")
        .link("Half", "Sink")
        .build();
    let feed = graph.feed(ids["Source"]).unwrap();
    graph.run().unwrap();
    feed.push(&vec![0.5; 130]).unwrap();
    assert!(graph.stop().unwrap());

    assert_eq!(collected(&graph, "Sink"), vec![0.5; 130]);
    let lonely = graph.node(ids["Lonely"]).unwrap();
    assert_eq!(lonely.state(), ProcessingState::Stopped);
    assert!(!lonely.inputs()[0].is_initialized());
}

#[test]
fn test_threshold_events_reach_value_sink() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, ids) = GraphBuilder::new(test_settings(&dir))
        .node("signal_source", "Source")
        .node_with("threshold", "Level", &[("level", AttributeValue::Double(0.5))])
        .node("value_sink", "Events")
        .link("Source", "Level")
        .connect("Level", "events", "Events", "in")
        .build();
    let feed = graph.feed(ids["Source"]).unwrap();
    graph.run().unwrap();

    let mut signal = vec![0.0; 50];
    signal.extend(vec![1.0; 50]);
    signal.extend(vec![0.0; 50]);
    feed.push(&signal).unwrap();
    assert!(graph.stop().unwrap());

    let events = graph
        .with_behavior(ids["Events"], |sink: &ValueSinkNode| sink.values().to_vec())
        .unwrap();
    let values: Vec<f64> = events.iter().map(|e| e.value).collect();
    let stamps: Vec<TimeStamp> = events.iter().map(|e| e.stamp).collect();
    assert_eq!(values, vec![1.0, 0.0]);
    assert_eq!(
        stamps,
        vec![TimeStamp::from_samples(50, 1000), TimeStamp::from_samples(100, 1000)]
    );
}

#[test]
#[serial]
fn test_device_data_is_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, _) = GraphBuilder::new(test_settings(&dir))
        .node_with(
            "device_source",
            "Device",
            &[("device", AttributeValue::Text("sim".to_string()))],
        )
        .node("passthrough", "Pass")
        .node("collector_sink", "Sink")
        .link("Device", "Pass")
        .link("Pass", "Sink")
        .build();
    // The device joins after the node exists; selecting it again takes its rate.
    let device = Arc::new(SimulatedDevice::with_options(
        "sim",
        vec![(SignalPattern::Constant(1.0), 1000)],
        10,
        false,
    ));
    graph.engine().register_device(device.clone());
    graph
        .set_attribute(
            graph.node_by_name("Device").unwrap().id(),
            "device",
            AttributeValue::Text("sim".to_string()),
        )
        .unwrap();

    graph.run().unwrap();
    let count = |graph: &Graph| {
        graph
            .node_by_name("Sink")
            .and_then(|n| n.with_behavior(|s: &CollectorSinkNode| s.count()))
            .unwrap_or(0)
    };
    assert!(wait_until(|| count(&graph) >= 2000));
    assert!(graph.stop().unwrap());

    assert!(!device.is_sampling());
    assert_eq!(count(&graph), device.produced(0));
}

#[test]
fn test_mock_device_feeds_graph() {
    let dir = tempfile::tempdir().unwrap();
    let (mut device, slot) = create_test_daq("daq", 1000);
    device.expect_has_active_ports().return_const(true);
    device.expect_start_sampling().times(1).returning(|| Ok(()));
    device.expect_is_sampling().return_const(true);
    device.expect_stop_sampling().times(1).returning(|| Ok(()));

    let (graph, _) = GraphBuilder::new(test_settings(&dir))
        .node("collector_sink", "Sink")
        .build();
    graph.engine().register_device(Arc::new(device));
    let mut args = NodeArgs::new();
    args.insert("device".to_string(), AttributeValue::Text("daq".to_string()));
    graph.add_node_with("device_source", "Device", &args).unwrap();
    graph.connect_by_name("Device", "out", "Sink", "in").unwrap();

    graph.run().unwrap();
    let callback = slot.lock().unwrap().clone().expect("callback installed on start");
    for i in 1..=3 {
        let buffer = TimeLocatedBuffer::from_samples(
            vec![i as f64; 100],
            1000,
            TimeStamp::from_samples(i * 100, 1000),
        );
        callback(&buffer);
    }
    assert!(graph.stop().unwrap());

    assert!(slot.lock().unwrap().is_none());
    let sink = graph.node_by_name("Sink").unwrap();
    let (count, sum) = sink
        .with_behavior(|s: &CollectorSinkNode| (s.count(), s.sum()))
        .unwrap();
    assert_eq!(count, 300);
    common::assert_float_eq(sum, 600.0, 1e-9);

    // The callback outlives the run but no longer delivers anything.
    callback(&TimeLocatedBuffer::from_samples(vec![9.0; 10], 1000, TimeStamp::from_seconds(1.0)));
    assert_eq!(sink.with_behavior(|s: &CollectorSinkNode| s.count()), Some(300));
}

/// Emits ten samples for every sample it receives.
struct Burst;

impl NodeBehavior for Burst {
    fn type_key(&self) -> &str {
        "burst"
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDataType::Array),
            PortDescriptor::output("out", PortDataType::Array),
        ]
    }

    fn input_samplerate_changed(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        core.output(0).set_samplerate(port.samplerate())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        let Some(buffer) = port.read() else {
            return Ok(());
        };
        let burst = TimeLocatedBuffer::from_samples(
            vec![0.0; buffer.written() * 10],
            buffer.rate(),
            buffer.current_time(),
        );
        core.output(0).send(&burst)
    }
}

#[test]
#[serial]
fn test_overflow_stops_graph() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Graph::with_settings(test_settings(&dir));
    let source = graph.add_node("signal_source", "Source").unwrap();
    graph.add_behavior("Burst", Box::new(Burst)).unwrap();
    graph.add_node("collector_sink", "Sink").unwrap();
    graph.connect_by_name("Source", "out", "Burst", "in").unwrap();
    graph.connect_by_name("Burst", "out", "Sink", "in").unwrap();
    let events = graph.subscribe();
    let feed = graph.feed(source).unwrap();

    graph.run().unwrap();
    feed.push(&[1.0; 100]).unwrap();

    assert!(wait_until(|| graph.state() == GraphState::Stopped));
    assert!(graph.engine().emergency_requested());
    assert!(events.try_iter().any(|e| matches!(
        e,
        GraphEvent::Notification(n) if n.level == NotificationLevel::Error
    )));
    assert!(!graph.stop().unwrap());

    // A new run starts clean.
    graph.run().unwrap();
    assert!(!graph.engine().emergency_requested());
    assert!(graph.stop().unwrap());
}

#[test]
fn test_recorder_writes_file_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let (graph, ids) = GraphBuilder::new(test_settings(&dir))
        .node("signal_source", "Source")
        .node("recorder", "Recorder")
        .node("recorder", "Idle")
        .link("Source", "Recorder")
        .build();
    let records = Arc::new(RecordSetCollector::new());
    graph.engine().set_recording_sink(records.clone());
    let feed = graph.feed(ids["Source"]).unwrap();

    graph.run().unwrap();
    feed.push(&ramp(0, 300)).unwrap();
    graph.stop().unwrap();
    graph.run().unwrap();
    feed.push(&ramp(0, 100)).unwrap();
    graph.stop().unwrap();

    let path = graph
        .with_behavior(ids["Recorder"], |r: &RecorderNode| r.path().map(|p| p.to_path_buf()))
        .flatten()
        .unwrap();
    assert_eq!(path, dir.path().join("set 1").join("Recorder.bin"));
    let bytes = std::fs::read(dir.path().join("set 0").join("Recorder.bin")).unwrap();
    assert_eq!(bytes.len(), 300 * 8);
    let first: [u8; 8] = bytes[8..16].try_into().unwrap();
    assert_eq!(f64::from_le_bytes(first), 1.0);
    // The unconnected recorder never opens a file.
    assert!(graph
        .with_behavior(ids["Idle"], |r: &RecorderNode| r.path().is_none())
        .unwrap());

    let index = dir.path().join(INDEX_FILE_NAME);
    records.write_index(&index).unwrap();
    let set = RecordSetReader::read_from_file(&index).unwrap();
    assert_eq!(set.records.len(), 2);
    let line = &set.records[0].lines[0];
    assert_eq!(line.kind, LineKind::Stream1D);
    assert_eq!(line.samplerate, Some(1000));
    assert_eq!(line.begin, TimeStamp::ZERO);
    assert_eq!(line.end, TimeStamp::from_seconds(0.3));
    assert_eq!(line.path, dir.path().join("set 0").join("Recorder.bin"));
    assert_eq!(set.records[1].lines[0].end, TimeStamp::from_seconds(0.1));
}

#[test]
fn test_backpressure_holds_long_pushes() {
    let dir = tempfile::tempdir().unwrap();
    let graph = chain(&dir);
    let feed = graph.feed(graph.node_by_name("Source").unwrap().id()).unwrap();
    graph.run().unwrap();

    // More than a queue's worth: the pushing thread is held back by
    // backpressure instead of overflowing.
    let pusher = {
        let feed = feed.clone();
        std::thread::spawn(move || feed.push(&ramp(0, 2000)))
    };
    pusher.join().unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    assert!(graph.stop().unwrap());
    assert_eq!(collected(&graph, "Sink"), ramp(0, 2000));
}

#[test]
fn test_push_larger_than_free_space_completes() {
    let dir = tempfile::tempdir().unwrap();
    let settings = flowgraph_rs::EngineSettings {
        queue_ms: 100,
        buffer_ms: 100,
        ..test_settings(&dir)
    };
    settings.validate().unwrap();
    let (graph, ids) = GraphBuilder::new(settings)
        .node("signal_source", "Source")
        .node_with("collector_sink", "Sink", &[("keep", AttributeValue::Bool(true))])
        .link("Source", "Sink")
        .build();
    let graph = Arc::new(graph);
    let feed = graph.feed(ids["Source"]).unwrap();
    graph.run().unwrap();

    // 37 samples wait below one dispatch buffer; the next 100 only fit in part.
    feed.push(&ramp(0, 37)).unwrap();
    let (pushed_tx, pushed) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        pushed_tx.send(feed.push(&ramp(37, 100))).ok();
    });
    assert!(pushed.recv_timeout(common::test_timeout()).unwrap().is_ok());

    let (stopped_tx, stopped) = crossbeam_channel::bounded(1);
    let stopping = Arc::clone(&graph);
    std::thread::spawn(move || {
        stopped_tx.send(stopping.stop()).ok();
    });
    assert!(stopped.recv_timeout(common::test_timeout()).unwrap().unwrap());
    assert_eq!(collected(&graph, "Sink"), ramp(0, 137));
}
