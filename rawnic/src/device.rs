//! The polymorphic device contract and the driver registry.
//!
//! Applications obtain devices by name through [`get_device`]; the registry
//! maps driver names to factory functions so tests can run against the
//! software-only dummy driver and new hardware families can be plugged in
//! without touching callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, RwLock};

use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::{DriverError, Result};
use crate::mempool::PacketBuffer;

/// Packet and byte counters of a device, cumulative since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {} pkts / {} bytes, tx {} pkts / {} bytes",
            self.rx_pkts, self.rx_bytes, self.tx_pkts, self.tx_bytes
        )
    }
}

/// A poll-mode network device.
///
/// Not internally synchronized: drive each queue from exactly one thread.
/// The batch calls never block; shortfalls (fewer packets than requested)
/// are the data-path signal for empty rings, full rings, and starved pools.
pub trait Device: Send {
    /// Registry name of the driver behind this device.
    fn driver_name(&self) -> &str;

    /// PCI address the device was opened with.
    fn pci_addr(&self) -> &str;

    /// Whether this device drives real hardware.
    fn is_supported(&self) -> bool;

    /// Secondary initialization: program the hardware and bring the device
    /// to its running state. Requires every rx queue to have a pool.
    fn allocate(&mut self) -> Result<()>;

    /// Accumulate the device's hardware counters into `stats`.
    fn read_stats(&self, stats: &mut DeviceStats);

    /// Clear the hardware counters.
    fn reset_stats(&mut self);

    fn is_promiscuous(&self) -> bool;
    fn enable_promiscuous(&mut self);
    fn disable_promiscuous(&mut self);

    /// Negotiated link speed in Mbit/s, 0 while the link is down.
    fn link_speed_mbit(&self) -> u16;

    /// Receive up to `bufs.len()` packets from `queue`, filling a prefix of
    /// `bufs` with app-owned buffers. Returns the number received.
    fn rx_batch(&mut self, queue: u16, bufs: &mut [PacketBuffer]) -> usize;

    /// Post a prefix of `bufs` onto `queue` for transmission, taking
    /// ownership of the posted buffers. Returns how many were posted.
    fn tx_batch(&mut self, queue: u16, bufs: &[PacketBuffer]) -> usize;
}

/// Builds an initialized device for one hardware family.
pub type DriverFactory = fn(&str, &DeviceConfig) -> Result<Box<dyn Device>>;

static DRIVERS: LazyLock<RwLock<HashMap<&'static str, DriverFactory>>> = LazyLock::new(|| {
    let mut drivers: HashMap<&'static str, DriverFactory> = HashMap::new();
    drivers.insert("ixgbe", crate::ixgbe::ixgbe_factory);
    drivers.insert("dummy", crate::dummy::dummy_factory);
    RwLock::new(drivers)
});

/// Register a driver factory under `name`, replacing any previous entry.
/// Intended for startup time.
pub fn register_driver(name: &'static str, factory: DriverFactory) {
    DRIVERS.write().unwrap().insert(name, factory);
}

/// Open and initialize the device at `pci_addr` with the named driver and
/// default configuration.
pub fn get_device(pci_addr: &str, driver: &str) -> Result<Box<dyn Device>> {
    get_device_with_config(pci_addr, driver, &DeviceConfig::default())
}

/// Open and initialize the device at `pci_addr` with the named driver.
pub fn get_device_with_config(
    pci_addr: &str,
    driver: &str,
    config: &DeviceConfig,
) -> Result<Box<dyn Device>> {
    let factory = DRIVERS
        .read()
        .unwrap()
        .get(driver)
        .copied()
        .ok_or_else(|| DriverError::UnknownDriver(driver.to_string()))?;

    debug!(pci_addr, driver, "dispatching to driver factory");
    factory(pci_addr, config)
}
