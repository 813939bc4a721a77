//! PCI device access through sysfs.
//!
//! Opening a device unbinds whatever kernel driver holds it, enables
//! bus-mastering so the NIC can DMA, and maps BAR0 read-write into the
//! process. No kernel module of our own is involved; everything goes
//! through `/sys/bus/pci/devices/<addr>/`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr;

use nix::libc;
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::mmio::MmioRegion;

/// Bit 2 of the config-space command register: bus master enable.
const COMMAND_BUS_MASTER: u16 = 1 << 2;

/// Offset of the command register in config space.
const COMMAND_OFFSET: u64 = 0x04;

/// An opened PCI device with its config space at hand.
pub struct PciDevice {
    pci_addr: String,
    config: File,
}

impl PciDevice {
    /// Open `pci_addr` (e.g. `"0000:01:00.0"`), keep only devices whose
    /// `(vendor, device)` pair passes `accept`, and map BAR0.
    ///
    /// The kernel driver, if any, is unbound and bus-mastering is enabled
    /// before the mapping is returned.
    pub fn open(pci_addr: &str, accept: fn(u16, u16) -> bool) -> Result<(PciDevice, MmioRegion)> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(DriverError::NotPrivileged);
        }

        let device_path = sysfs_path(pci_addr);
        if !device_path.exists() {
            return Err(DriverError::DeviceNotFound(pci_addr.to_string()));
        }

        let config = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path.join("config"))?;

        let (vendor, device) = read_ids(&config)?;
        if !accept(vendor, device) {
            return Err(DriverError::UnsupportedDevice { vendor, device });
        }
        debug!(
            pci_addr,
            vendor = %format_args!("{vendor:04x}"),
            device = %format_args!("{device:04x}"),
            "matched pci ids"
        );

        unbind_kernel_driver(pci_addr);

        let dev = PciDevice {
            pci_addr: pci_addr.to_string(),
            config,
        };
        dev.enable_bus_master()?;

        let bar0 = dev.map_resource(&device_path)?;
        info!(pci_addr, bar0_len = bar0.len(), "opened pci device");

        Ok((dev, bar0))
    }

    pub fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    /// Set the bus-master bit so the device may initiate DMA.
    fn enable_bus_master(&self) -> Result<()> {
        let mut buf = [0u8; 2];
        self.config.read_exact_at(&mut buf, COMMAND_OFFSET)?;

        let command = u16::from_le_bytes(buf) | COMMAND_BUS_MASTER;
        self.config.write_all_at(&command.to_le_bytes(), COMMAND_OFFSET)?;
        Ok(())
    }

    fn map_resource(&self, device_path: &std::path::Path) -> Result<MmioRegion> {
        let resource = File::options()
            .read(true)
            .write(true)
            .open(device_path.join("resource0"))?;
        let len = resource.metadata()?.len() as usize;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                resource.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        // The mapping survives the fd; resource0 can be closed here.
        Ok(MmioRegion::from_mapping(ptr as *mut u8, len))
    }
}

fn sysfs_path(pci_addr: &str) -> PathBuf {
    PathBuf::from(format!("/sys/bus/pci/devices/{pci_addr}"))
}

/// Read the vendor and device id out of an open config-space file.
pub(crate) fn read_ids(config: &File) -> Result<(u16, u16)> {
    let mut buf = [0u8; 4];
    config.read_exact_at(&mut buf, 0)?;

    let vendor = u16::from_le_bytes([buf[0], buf[1]]);
    let device = u16::from_le_bytes([buf[2], buf[3]]);
    Ok((vendor, device))
}

/// Detach the kernel driver from the device, if one is bound. A device
/// without a driver is the expected case on repeat opens.
fn unbind_kernel_driver(pci_addr: &str) {
    let unbind = sysfs_path(pci_addr).join("driver/unbind");
    if !unbind.exists() {
        debug!(pci_addr, "no kernel driver bound");
        return;
    }

    match OpenOptions::new().write(true).open(&unbind) {
        Ok(mut f) => {
            if let Err(e) = f.write_all(pci_addr.as_bytes()) {
                warn!(pci_addr, error = %e, "failed to unbind kernel driver");
            } else {
                info!(pci_addr, "unbound kernel driver");
            }
        }
        Err(e) => warn!(pci_addr, error = %e, "failed to open unbind node"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ids_little_endian() {
        let mut file = tempfile::tempfile().unwrap();
        // 8086:10fb plus the start of the command register.
        file.write_all(&[0x86, 0x80, 0xfb, 0x10, 0x00, 0x00])
            .unwrap();

        let (vendor, device) = read_ids(&file).unwrap();
        assert_eq!(vendor, 0x8086);
        assert_eq!(device, 0x10fb);
    }

    #[test]
    fn test_missing_device_is_not_found() {
        // geteuid gate fires first for unprivileged runs; both outcomes are
        // open-rejections for a nonsense address.
        let res = PciDevice::open("ffff:ff:1f.7", |_, _| true);
        assert!(matches!(
            res,
            Err(DriverError::DeviceNotFound(_)) | Err(DriverError::NotPrivileged)
        ));
    }
}
