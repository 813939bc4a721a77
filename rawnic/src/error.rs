//! Driver error types.

use std::io;
use thiserror::Error;

/// Driver errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("operation requires root privileges")]
    NotPrivileged,

    #[error("PCI device not found: {0}")]
    DeviceNotFound(String),

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("unsupported PCI device {vendor:04x}:{device:04x}")]
    UnsupportedDevice { vendor: u16, device: u16 },

    #[error("timeout waiting for register {register} (mask {mask:#010x})")]
    InitTimeout { register: &'static str, mask: u32 },

    #[error("failed to allocate {0} bytes of hugepage memory")]
    HugepagesExhausted(usize),

    #[error("allocation would span non-contiguous hugepages")]
    AllocationNotContiguous,

    #[error("memory pool ran out of buffers during ring setup")]
    PoolExhausted,

    #[error("rx queue {0} has no memory pool attached")]
    QueueWithoutPool(u16),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
