//! Userspace driver for Intel 10 GbE NICs of the ixgbe (82599) family.
//!
//! The kernel network stack is bypassed entirely: the driver unbinds the
//! kernel driver, maps the NIC's BAR0 register window through sysfs, pins
//! hugepage-backed DMA memory, and exchanges packet buffers with the
//! hardware through descriptor rings. Everything is poll-mode; there are no
//! interrupts and no blocking calls on the data path.
//!
//! ```no_run
//! use rawnic::{Device, PacketBuffer};
//!
//! let mut dev = rawnic::get_device("0000:01:00.0", "ixgbe")?;
//! let mut bufs = vec![PacketBuffer::empty(); 32];
//! loop {
//!     let received = dev.rx_batch(0, &mut bufs);
//!     let sent = dev.tx_batch(0, &bufs[..received]);
//!     // Unsent buffers stay with the caller.
//!     # let _ = sent; break;
//! }
//! # Ok::<(), rawnic::DriverError>(())
//! ```

pub mod config;
pub mod device;
pub mod dummy;
pub mod error;
pub mod ixgbe;
pub mod memory;
pub mod mempool;
pub mod mmio;
pub mod pci;

pub use config::DeviceConfig;
pub use device::{Device, DeviceStats, get_device, get_device_with_config, register_driver};
pub use dummy::DummyDevice;
pub use error::{DriverError, Result};
pub use ixgbe::IxgbeDevice;
pub use mempool::{HEADROOM, Mempool, PacketBuffer};
