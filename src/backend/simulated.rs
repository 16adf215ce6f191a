//! Simulated device for testing and demos
//!
//! Generates waveform patterns on a background sampling thread, pacing
//! buffers in real time. Each port has its own pattern and samplerate; sample
//! `n` of a port is stamped `n / samplerate` seconds after sampling started.

use super::device::{BufferCallback, Device, PortStatus};
use crate::error::{EngineError, Result};
use crate::pipeline::lock;
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default length of one generated buffer
const DEFAULT_BUFFER_MS: u32 = 20;

/// Pattern for generating simulated data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SignalPattern {
    /// Constant value
    Constant(f64),
    /// Sine wave with frequency and amplitude
    Sine {
        frequency: f64,
        amplitude: f64,
        offset: f64,
    },
    /// Counter that increments by `step` per sample, wrapping from `max` to `min`
    Counter { step: f64, min: f64, max: f64 },
    /// Sawtooth wave
    Sawtooth { period: f64, amplitude: f64 },
    /// Square wave
    Square { period: f64, amplitude: f64 },
    /// Triangle wave
    Triangle { period: f64, amplitude: f64 },
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 1.0,
            offset: 0.0,
        }
    }
}

impl SignalPattern {
    /// Value of sample `index` at `rate` Hz
    pub fn sample(&self, index: u64, rate: u32) -> f64 {
        let t = if rate == 0 {
            0.0
        } else {
            index as f64 / rate as f64
        };
        match *self {
            SignalPattern::Constant(v) => v,
            SignalPattern::Sine {
                frequency,
                amplitude,
                offset,
            } => offset + amplitude * (2.0 * PI * frequency * t).sin(),
            SignalPattern::Counter { step, min, max } => {
                let span = max - min;
                if span <= 0.0 {
                    return min;
                }
                min + (index as f64 * step).rem_euclid(span + step.abs())
                    .min(span)
            }
            SignalPattern::Sawtooth { period, amplitude } => {
                let t = t % period;
                amplitude * (t / period)
            }
            SignalPattern::Square { period, amplitude } => {
                let t = t % period;
                if t < period / 2.0 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            SignalPattern::Triangle { period, amplitude } => {
                let t = t % period;
                let half = period / 2.0;
                if t < half {
                    amplitude * (2.0 * t / half - 1.0)
                } else {
                    amplitude * (1.0 - 2.0 * (t - half) / half)
                }
            }
        }
    }
}

struct PortConfig {
    pattern: SignalPattern,
    rate: u32,
    status: PortStatus,
    callback: Option<BufferCallback>,
    /// Samples produced since sampling started
    position: u64,
}

struct Shared {
    ports: Mutex<Vec<PortConfig>>,
    running: AtomicBool,
    buffer_ms: u32,
    realtime: bool,
}

/// A device producing waveform patterns
pub struct SimulatedDevice {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    /// Create a device with one port per `(pattern, samplerate)` pair
    pub fn new(name: impl Into<String>, ports: Vec<(SignalPattern, u32)>) -> Self {
        Self::with_options(name, ports, DEFAULT_BUFFER_MS, true)
    }

    /// `buffer_ms` sets the length of each buffer. Without `realtime` buffers
    /// are produced as fast as the consumers accept them.
    pub fn with_options(
        name: impl Into<String>,
        ports: Vec<(SignalPattern, u32)>,
        buffer_ms: u32,
        realtime: bool,
    ) -> Self {
        let ports = ports
            .into_iter()
            .map(|(pattern, rate)| PortConfig {
                pattern,
                rate,
                status: PortStatus::Idle,
                callback: None,
                position: 0,
            })
            .collect();
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                ports: Mutex::new(ports),
                running: AtomicBool::new(false),
                buffer_ms: buffer_ms.max(1),
                realtime,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn set_pattern(&self, port: usize, pattern: SignalPattern) -> Result<()> {
        let mut ports = lock(&self.shared.ports);
        let config = ports
            .get_mut(port)
            .ok_or_else(|| EngineError::device(&self.name, format!("no port {}", port)))?;
        config.pattern = pattern;
        Ok(())
    }

    /// Samples produced by `port` since sampling last started
    pub fn produced(&self, port: usize) -> u64 {
        lock(&self.shared.ports)
            .get(port)
            .map(|p| p.position)
            .unwrap_or(0)
    }

    fn with_port<R>(&self, port: usize, f: impl FnOnce(&mut PortConfig) -> R) -> Result<R> {
        let mut ports = lock(&self.shared.ports);
        ports
            .get_mut(port)
            .map(f)
            .ok_or_else(|| EngineError::device(&self.name, format!("no port {}", port)))
    }
}

impl Device for SimulatedDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn port_count(&self) -> usize {
        lock(&self.shared.ports).len()
    }

    fn port_status(&self, port: usize) -> PortStatus {
        lock(&self.shared.ports)
            .get(port)
            .map(|p| p.status)
            .unwrap_or_default()
    }

    fn set_port_status(&self, port: usize, status: PortStatus) -> Result<()> {
        self.with_port(port, |p| p.status = status)
    }

    fn samplerate(&self, port: usize) -> u32 {
        lock(&self.shared.ports)
            .get(port)
            .map(|p| p.rate)
            .unwrap_or(0)
    }

    fn set_samplerate(&self, port: usize, rate: u32) -> Result<()> {
        if self.is_sampling() {
            return Err(EngineError::device(
                &self.name,
                "cannot change samplerate while sampling",
            ));
        }
        if rate == 0 {
            return Err(EngineError::device(&self.name, "samplerate must be positive"));
        }
        self.with_port(port, |p| p.rate = rate)
    }

    fn set_buffer_callback(&self, port: usize, callback: Option<BufferCallback>) -> Result<()> {
        self.with_port(port, |p| p.callback = callback)
    }

    fn start_sampling(&self) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }

        for p in lock(&self.shared.ports).iter_mut() {
            p.position = 0;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("device-{}", self.name))
            .spawn(move || sampling_loop(shared))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                EngineError::device(&self.name, format!("failed to spawn sampling thread: {}", e))
            })?;
        *thread = Some(handle);
        tracing::info!("Device '{}' started sampling", self.name);
        Ok(())
    }

    fn stop_sampling(&self) -> Result<()> {
        let handle = lock(&self.thread).take();
        let Some(handle) = handle else {
            return Ok(());
        };
        self.shared.running.store(false, Ordering::SeqCst);
        handle
            .join()
            .map_err(|_| EngineError::device(&self.name, "sampling thread panicked"))?;
        tracing::info!("Device '{}' stopped sampling", self.name);
        Ok(())
    }

    fn is_sampling(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        if let Err(e) = self.stop_sampling() {
            tracing::warn!("Error stopping device on drop: {}", e);
        }
    }
}

fn sampling_loop(shared: Arc<Shared>) {
    let tick = Duration::from_millis(shared.buffer_ms as u64);
    let mut next_tick = Instant::now() + tick;

    while shared.running.load(Ordering::SeqCst) {
        // Build buffers under the lock, deliver them without it.
        let mut batch: Vec<(BufferCallback, TimeLocatedBuffer)> = Vec::new();
        {
            let mut ports = lock(&shared.ports);
            for port in ports.iter_mut() {
                if port.status != PortStatus::Active || port.rate == 0 {
                    continue;
                }
                let Some(callback) = port.callback.clone() else {
                    continue;
                };
                let count = ((port.rate as u64 * shared.buffer_ms as u64) / 1000).max(1);
                let samples: Vec<f64> = (port.position..port.position + count)
                    .map(|i| port.pattern.sample(i, port.rate))
                    .collect();
                port.position += count;
                let end = TimeStamp::from_samples(port.position as i64, port.rate);
                batch.push((callback, TimeLocatedBuffer::from_samples(samples, port.rate, end)));
            }
        }

        for (callback, buffer) in &batch {
            callback(buffer);
        }

        if shared.realtime {
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            }
            next_tick += tick;
        } else {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_patterns() {
        assert_eq!(SignalPattern::Constant(3.0).sample(17, 100), 3.0);

        let sine = SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 2.0,
            offset: 1.0,
        };
        assert!((sine.sample(0, 4) - 1.0).abs() < 1e-12);
        assert!((sine.sample(1, 4) - 3.0).abs() < 1e-12);

        let square = SignalPattern::Square {
            period: 1.0,
            amplitude: 1.0,
        };
        assert_eq!(square.sample(0, 10), 1.0);
        assert_eq!(square.sample(6, 10), -1.0);

        let counter = SignalPattern::Counter {
            step: 1.0,
            min: 0.0,
            max: 3.0,
        };
        let values: Vec<f64> = (0..6).map(|i| counter.sample(i, 1)).collect();
        assert_eq!(values, [0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_set_samplerate_rejected_while_sampling() {
        let device = SimulatedDevice::with_options("dev", vec![(SignalPattern::Constant(1.0), 100)], 5, false);
        device.start_sampling().unwrap();
        assert!(device.is_sampling());
        assert!(device.set_samplerate(0, 200).is_err());
        device.stop_sampling().unwrap();
        assert!(!device.is_sampling());
        device.set_samplerate(0, 200).unwrap();
        assert_eq!(device.samplerate(0), 200);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let device = SimulatedDevice::new("dev", vec![(SignalPattern::default(), 1000)]);
        device.stop_sampling().unwrap();
        device.start_sampling().unwrap();
        device.start_sampling().unwrap();
        device.stop_sampling().unwrap();
        device.stop_sampling().unwrap();
    }

    #[test]
    fn test_active_port_delivers_continuous_buffers() {
        let device = SimulatedDevice::with_options(
            "dev",
            vec![
                (SignalPattern::Counter { step: 1.0, min: 0.0, max: 1e9 }, 1000),
                (SignalPattern::Constant(0.0), 1000),
            ],
            10,
            false,
        );
        assert!(!device.has_active_ports());
        device.set_port_status(0, PortStatus::Active).unwrap();
        assert!(device.has_active_ports());

        let received = Arc::new(Mutex::new(Vec::<TimeLocatedBuffer>::new()));
        let sink = Arc::clone(&received);
        device
            .set_buffer_callback(0, Some(Arc::new(move |buf| sink.lock().unwrap().push(buf.clone()))))
            .unwrap();

        let idle_calls = Arc::new(AtomicUsize::new(0));
        let idle = Arc::clone(&idle_calls);
        device
            .set_buffer_callback(1, Some(Arc::new(move |_| {
                idle.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        device.start_sampling().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.lock().unwrap().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        device.stop_sampling().unwrap();

        let buffers = received.lock().unwrap();
        assert!(buffers.len() >= 5);
        assert_eq!(idle_calls.load(Ordering::SeqCst), 0);
        for pair in buffers.windows(2) {
            assert_eq!(pair[1].front_time(), pair[0].current_time());
            assert_eq!(pair[1].written_samples()[0], pair[0].written_samples()[9] + 1.0);
        }
    }
}
