//! A software-only device for tests without hardware.
//!
//! Every operation is a no-op: batches move nothing, the link is down, and
//! `is_supported` is false so applications can tell it apart from a real
//! NIC. It exists so everything above the driver boundary can run on any
//! machine.

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceStats};
use crate::error::Result;
use crate::mempool::PacketBuffer;

pub struct DummyDevice {
    pci_addr: String,
    promiscuous: bool,
}

impl DummyDevice {
    pub fn new(pci_addr: &str) -> Self {
        DummyDevice {
            pci_addr: pci_addr.to_string(),
            promiscuous: false,
        }
    }
}

/// Factory registered under the `"dummy"` driver name.
pub fn dummy_factory(pci_addr: &str, _config: &DeviceConfig) -> Result<Box<dyn Device>> {
    Ok(Box::new(DummyDevice::new(pci_addr)))
}

impl Device for DummyDevice {
    fn driver_name(&self) -> &str {
        "dummy"
    }

    fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn allocate(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_stats(&self, _stats: &mut DeviceStats) {}

    fn reset_stats(&mut self) {}

    fn is_promiscuous(&self) -> bool {
        self.promiscuous
    }

    fn enable_promiscuous(&mut self) {
        self.promiscuous = true;
    }

    fn disable_promiscuous(&mut self) {
        self.promiscuous = false;
    }

    fn link_speed_mbit(&self) -> u16 {
        0
    }

    fn rx_batch(&mut self, _queue: u16, _bufs: &mut [PacketBuffer]) -> usize {
        0
    }

    fn tx_batch(&mut self, _queue: u16, _bufs: &[PacketBuffer]) -> usize {
        0
    }
}
