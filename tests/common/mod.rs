//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use flowgraph_rs::EngineSettings;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Engine settings with run directories inside `dir`
pub fn test_settings(dir: &TempDir) -> EngineSettings {
    EngineSettings {
        min_workers: 2,
        backpressure_poll_ms: 1,
        ..EngineSettings::default()
    }
    .with_working_dir_base(dir.path())
}

/// Poll `condition` until it holds or the test timeout expires
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Ramp `start..start + len` as samples
pub fn ramp(start: usize, len: usize) -> Vec<f64> {
    (start..start + len).map(|i| i as f64).collect()
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
