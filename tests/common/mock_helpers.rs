//! Mock construction helpers

use flowgraph_rs::backend::{BufferCallback, Device, PortStatus};
use flowgraph_rs::Result;
use mockall::mock;
use std::sync::{Arc, Mutex};

mock! {
    pub Daq {}

    impl Device for Daq {
        fn name(&self) -> String;
        fn port_count(&self) -> usize;
        fn port_status(&self, port: usize) -> PortStatus;
        fn set_port_status(&self, port: usize, status: PortStatus) -> Result<()>;
        fn samplerate(&self, port: usize) -> u32;
        fn set_samplerate(&self, port: usize, rate: u32) -> Result<()>;
        fn set_buffer_callback(&self, port: usize, callback: Option<BufferCallback>) -> Result<()>;
        fn start_sampling(&self) -> Result<()>;
        fn stop_sampling(&self) -> Result<()>;
        fn is_sampling(&self) -> bool;
        fn has_active_ports(&self) -> bool;
    }
}

/// Slot the mock stores the installed buffer callback in
pub type CallbackSlot = Arc<Mutex<Option<BufferCallback>>>;

/// A single-port mock device named `name` that keeps its buffer callback in
/// the returned slot, so the test can play the device thread
pub fn create_test_daq(name: &str, rate: u32) -> (MockDaq, CallbackSlot) {
    let slot: CallbackSlot = Arc::new(Mutex::new(None));
    let mut device = MockDaq::new();
    device.expect_name().return_const(name.to_string());
    device.expect_port_count().return_const(1usize);
    device.expect_samplerate().return_const(rate);
    device.expect_set_port_status().returning(|_, _| Ok(()));
    let stored = Arc::clone(&slot);
    device
        .expect_set_buffer_callback()
        .returning(move |_, callback| {
            *stored.lock().unwrap() = callback;
            Ok(())
        });
    (device, slot)
}
