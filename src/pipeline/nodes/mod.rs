//! Built-in pipeline node implementations.
//!
//! Every module exposes a `create` constructor taking the registry's
//! [`NodeArgs`]; [`register_builtins`] wires them into a [`NodeRegistry`].

pub mod accumulator;
pub mod adder;
pub mod collector_sink;
pub mod device_source;
pub mod filter;
pub mod gain;
pub mod passthrough;
pub mod recorder;
pub mod resample;
pub mod rms;
pub mod signal_source;
pub mod spectrum;
pub mod spectrum_sink;
pub mod threshold;
pub mod value_sink;

pub use accumulator::AccumulatorNode;
pub use adder::AdderNode;
pub use collector_sink::CollectorSinkNode;
pub use device_source::DeviceSourceNode;
pub use filter::{FilterNode, FilterParams};
pub use gain::GainNode;
pub use passthrough::PassthroughNode;
pub use recorder::RecorderNode;
pub use resample::ResampleNode;
pub use rms::RmsNode;
pub use signal_source::{OutputFeed, SignalSourceNode};
pub use spectrum::SpectrumNode;
pub use spectrum_sink::SpectrumSinkNode;
pub use threshold::ThresholdNode;
pub use value_sink::ValueSinkNode;

use crate::error::Result;
use crate::pipeline::attributes::AttributeValue;
use crate::pipeline::node::FlushState;
use crate::pipeline::port::{InputPort, OutputPort};
use crate::pipeline::registry::{NodeArgs, NodeCategory, NodeRegistry};
use crate::pipeline::time_located::TimeLocatedBuffer;

/// Register every built-in node type.
pub fn register_builtins(registry: &NodeRegistry) {
    use NodeCategory::*;

    registry.register(
        signal_source::TYPE_KEY,
        Source,
        "Samples pushed from code through an output feed",
        signal_source::create,
    );
    registry.register(
        device_source::TYPE_KEY,
        Source,
        "Buffers of one device port",
        device_source::create,
    );
    registry.register(
        passthrough::TYPE_KEY,
        Transform,
        "Forwards its input unchanged",
        passthrough::create,
    );
    registry.register(gain::TYPE_KEY, Transform, "Multiplies by a factor", gain::create);
    registry.register(
        adder::TYPE_KEY,
        Transform,
        "Sample-wise sum of its inputs",
        adder::create,
    );
    registry.register(
        threshold::TYPE_KEY,
        Transform,
        "Emits an event whenever the signal crosses a level",
        threshold::create,
    );
    registry.register(
        filter::TYPE_KEY,
        Transform,
        "Biquad low, high, band, notch, peak or shelf filter",
        filter::create,
    );
    registry.register(
        rms::TYPE_KEY,
        Transform,
        "Root mean square over consecutive windows",
        rms::create,
    );
    registry.register(
        resample::TYPE_KEY,
        Transform,
        "Converts to the samplerate attribute's rate",
        resample::create,
    );
    registry.register(
        spectrum::TYPE_KEY,
        Transform,
        "Windowed FFT magnitude frames",
        spectrum::create,
    );
    registry.register(
        collector_sink::TYPE_KEY,
        Sink,
        "Counts, sums and optionally keeps samples",
        collector_sink::create,
    );
    registry.register(
        value_sink::TYPE_KEY,
        Sink,
        "Collects time-located values",
        value_sink::create,
    );
    registry.register(
        spectrum_sink::TYPE_KEY,
        Sink,
        "Keeps the latest spectrum frame",
        spectrum_sink::create,
    );
    registry.register(
        accumulator::TYPE_KEY,
        Sink,
        "Running total of its input",
        accumulator::create,
    );
    registry.register(
        recorder::TYPE_KEY,
        Sink,
        "Writes samples to a file in the working directory",
        recorder::create,
    );
}

/// Optional construction argument.
pub(crate) fn arg<'a>(args: &'a NodeArgs, name: &str) -> Option<&'a AttributeValue> {
    args.get(name)
}

/// Move what `input` has queued to `output`, applying `map` to each chunk.
///
/// Chunks are bounded by the free space of the fullest downstream queue, so
/// flushing never overflows a suspended consumer. Whatever does not fit
/// stays queued for the next flush pass.
pub(crate) fn flush_through(
    input: &InputPort,
    output: &OutputPort,
    mut map: impl FnMut(&mut [f64]),
) -> Result<FlushState> {
    let mut state = FlushState::Empty;
    loop {
        let count = input
            .queued()
            .min(output.min_free())
            .min(input.buffer_len());
        if count == 0 {
            break;
        }
        let Some(mut buffer) = input.read_count(Some(count)) else {
            break;
        };
        let written = buffer.written();
        map(&mut buffer.samples_mut()[..written]);
        output.send(&buffer)?;
        state = FlushState::Some;
    }
    if input.queued() > 0 {
        tracing::debug!(
            "'{}' keeps {} samples until downstream has room",
            input.full_name(),
            input.queued()
        );
    }
    Ok(state)
}

/// Send `buffer` in pieces no longer than the shortest dispatch buffer of the
/// connected inputs, each piece stamped with its own end time.
pub(crate) fn send_in_chunks(output: &OutputPort, buffer: &TimeLocatedBuffer) -> Result<()> {
    let chunk = output
        .connections()
        .iter()
        .map(|input| input.buffer_len())
        .min()
        .unwrap_or(0);
    if chunk == 0 || buffer.written() <= chunk {
        return output.send(buffer);
    }
    let total = buffer.written();
    let mut offset = 0;
    while offset < total {
        let len = chunk.min(total - offset);
        output.send(&buffer.slice(offset, len))?;
        offset += len;
    }
    Ok(())
}
