//! Device configuration knobs.

use serde::{Deserialize, Serialize};

use crate::mempool::DEFAULT_ENTRY_SIZE;

/// Sizing and behavior of a device opened through the driver registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of receive queues.
    pub num_rx_queues: u16,
    /// Number of transmit queues.
    pub num_tx_queues: u16,
    /// Descriptors per ring; must be a power of two.
    pub ring_size: u16,
    /// Buffers in each per-rx-queue pool.
    pub pool_entries: u32,
    /// Size of one pool slot in bytes.
    pub entry_size: u32,
    /// Whether to accept all frames regardless of destination MAC.
    pub promiscuous: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            num_rx_queues: 1,
            num_tx_queues: 1,
            ring_size: 512,
            pool_entries: 1024,
            entry_size: DEFAULT_ENTRY_SIZE,
            promiscuous: true,
        }
    }
}

impl DeviceConfig {
    /// Parse a configuration from JSON, e.g. a file an application ships.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.ring_size, 512);
        assert!(cfg.ring_size.is_power_of_two());
        assert_eq!(cfg.entry_size, 2048);
        assert!(cfg.promiscuous);
    }

    #[test]
    fn test_partial_json_overrides() {
        let cfg = DeviceConfig::from_json(r#"{"num_rx_queues": 4, "promiscuous": false}"#).unwrap();
        assert_eq!(cfg.num_rx_queues, 4);
        assert!(!cfg.promiscuous);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.ring_size, 512);
        assert_eq!(cfg.pool_entries, 1024);
    }
}
