//! flowgraph-rs demo runner
//!
//! Builds a small graph around a simulated device, runs it for a while and
//! reports what reached the sinks:
//!
//! ```text
//! [Device] ──► [Gain] ──► [Stats]
//!    ├───────► [Spectrum] ──► [Peaks]
//!    └───────► [Recorder]
//! ```
//!
//! Usage: `flowgraph-rs [seconds] [settings.toml]`

use anyhow::Context;
use flowgraph_rs::{
    backend::{SignalPattern, SimulatedDevice},
    config::{self, EngineSettings, LogSettings},
    pipeline::{
        nodes::{CollectorSinkNode, RecorderNode, SpectrumSinkNode},
        AttributeValue, EngineContext, Graph, GraphEvent, NodeArgs,
    },
    session::{RecordSetCollector, INDEX_FILE_NAME},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEVICE_NAME: &str = "sim";
const DEMO_SAMPLERATE: u32 = 1000;

fn init_logging(settings: &LogSettings) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &settings.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file {:?} has no file name", path))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter)))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn args(pairs: &[(&str, AttributeValue)]) -> NodeArgs {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn build_graph(engine: &Arc<EngineContext>) -> anyhow::Result<Graph> {
    let graph = Graph::new(Arc::clone(engine));
    graph.add_node_with(
        "device_source",
        "Device",
        &args(&[("device", AttributeValue::Text(DEVICE_NAME.to_string()))]),
    )?;
    graph.add_node_with("gain", "Gain", &args(&[("factor", AttributeValue::Double(0.5))]))?;
    graph.add_node("collector_sink", "Stats")?;
    graph.add_node_with("spectrum", "Spectrum", &args(&[("fft_size", AttributeValue::Int(256))]))?;
    graph.add_node("spectrum_sink", "Peaks")?;
    graph.add_node("recorder", "Recorder")?;

    graph.connect_by_name("Device", "out", "Gain", "in")?;
    graph.connect_by_name("Gain", "out", "Stats", "in")?;
    graph.connect_by_name("Device", "out", "Spectrum", "in")?;
    graph.connect_by_name("Spectrum", "spectrum", "Peaks", "in")?;
    graph.connect_by_name("Device", "out", "Recorder", "in")?;
    Ok(graph)
}

fn main() -> anyhow::Result<()> {
    let mut cli = std::env::args().skip(1);
    let seconds: f64 = match cli.next() {
        Some(s) => s.parse().with_context(|| format!("invalid duration '{}'", s))?,
        None => 2.0,
    };
    let settings_path = cli.next().map(PathBuf::from).or_else(config::settings_path);
    let settings = EngineSettings::load_or_default(settings_path.as_deref());
    let _log_guard = init_logging(&settings.log)?;

    tracing::info!("Starting flowgraph-rs demo for {:.1} s", seconds);

    let engine = EngineContext::new(settings);
    engine.register_device(Arc::new(SimulatedDevice::new(
        DEVICE_NAME,
        vec![(
            SignalPattern::Sine {
                frequency: 50.0,
                amplitude: 1.0,
                offset: 0.0,
            },
            DEMO_SAMPLERATE,
        )],
    )));
    let records = Arc::new(RecordSetCollector::new());
    engine.set_recording_sink(records.clone());

    let graph = build_graph(&engine).context("failed to build the demo graph")?;
    let events = graph.subscribe();

    graph.run().context("failed to start the graph")?;
    std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
    let stopped = graph.stop().context("failed to stop the graph")?;
    if !stopped {
        tracing::warn!("Graph was already stopped");
    }

    for event in events.try_iter() {
        if let GraphEvent::Notification(notification) = event {
            tracing::info!("{:?}: {}", notification.level, notification.message);
        }
    }

    let stats = graph.node_by_name("Stats").context("Stats node missing")?;
    if let Some((count, mean)) = stats.with_behavior(|c: &CollectorSinkNode| (c.count(), c.mean())) {
        tracing::info!("Stats received {} samples, mean {:?}", count, mean);
    }
    let peaks = graph.node_by_name("Peaks").context("Peaks node missing")?;
    if let Some((frames, peak)) = peaks.with_behavior(|s: &SpectrumSinkNode| (s.frames(), s.peak_frequency())) {
        tracing::info!("Peaks received {} frames, strongest at {:?} Hz", frames, peak);
    }
    let recorder = graph.node_by_name("Recorder").context("Recorder node missing")?;
    if let Some(Some(path)) = recorder.with_behavior(|r: &RecorderNode| r.path().map(Path::to_path_buf)) {
        tracing::info!("Recorded to {}", path.display());
    }

    if graph.working_dir().is_some() {
        let index = engine.settings().working_dir_base.join(INDEX_FILE_NAME);
        records
            .write_index(&index)
            .with_context(|| format!("failed to write {}", index.display()))?;
        tracing::info!("Wrote {}", index.display());
    }

    Ok(())
}
