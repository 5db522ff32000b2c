//! The one concrete [`arg_gateway::director::Capture`] implementation this
//! binary ships. A real deployment backs the internal and external
//! interfaces with a TUN device and a raw socket respectively; wiring
//! either is platform-specific and deliberately left to the pluggable
//! trait rather than built here. This implementation exists so `arg`
//! links and runs end-to-end against the device names from its
//! configuration file, doing nothing but idle.

use std::time::Duration;

use arg_gateway::director::Capture;

pub struct NullCapture {
    internal_device: String,
    external_device: String,
}

impl NullCapture {
    pub fn new(internal_device: &str, external_device: &str) -> Self {
        Self { internal_device: internal_device.to_string(), external_device: external_device.to_string() }
    }
}

impl Capture for NullCapture {
    fn recv_internal(&self) -> std::io::Result<Vec<u8>> {
        let _ = &self.internal_device;
        std::thread::sleep(Duration::from_secs(1));
        Ok(Vec::new())
    }

    fn send_internal(&self, _packet: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    fn recv_external(&self) -> std::io::Result<Vec<u8>> {
        let _ = &self.external_device;
        std::thread::sleep(Duration::from_secs(1));
        Ok(Vec::new())
    }

    fn send_external(&self, _packet: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}
