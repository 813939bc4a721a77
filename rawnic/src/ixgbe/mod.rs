//! Driver for the Intel 82599 family of 10 GbE controllers.
//!
//! Strictly poll-mode: interrupts are masked at reset and never enabled.
//! Each queue owns a descriptor ring in DMA memory plus a parallel shadow
//! array of buffer handles; software owns the tail registers, the NIC owns
//! the heads. Section references follow the 82599 datasheet.

pub mod regs;

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceStats};
use crate::error::{DriverError, Result};
use crate::memory::DmaRegion;
use crate::mempool::{Mempool, PacketBuffer};
use crate::mmio::MmioRegion;
use crate::pci::PciDevice;

use regs::{AdvRxDesc, AdvTxDesc};

const DRIVER_NAME: &str = "ixgbe";

const MAX_QUEUES: u16 = 64;
const DESC_SIZE: usize = 16;

/// Completed tx descriptors are returned to their pool in batches of this
/// size; probing DD on every slot individually is not worth the bus reads.
const TX_CLEAN_BATCH: u16 = 32;

/// Bound on every init-time register poll except the link wait.
const INIT_POLL_TIMEOUT: Duration = Duration::from_millis(10);
const LINK_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_SETTLE: Duration = Duration::from_millis(10);

const fn wrap_ring(index: u16, ring_size: u16) -> u16 {
    (index + 1) & (ring_size - 1)
}

fn is_ixgbe_id(vendor: u16, device: u16) -> bool {
    const INTEL: u16 = 0x8086;
    const DEVICE_IDS: &[u16] = &[
        0x10F7, // 82599 KX4
        0x10F8, // 82599 combined backplane
        0x10F9, // 82599 CX4
        0x10FB, // 82599 SFP
        0x10FC, // 82599 XAUI
        0x1517, // 82599 KR
        0x151C, // 82599 10GBASE-T
        0x154D, // 82599 SFP SF2
        0x1557, // 82599 single-port SFP
    ];
    vendor == INTEL && DEVICE_IDS.contains(&device)
}

/// Soft event counters, separate from the NIC's own statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPathCounters {
    /// Rx batches cut short because the pool had no buffer for a refill.
    pub rx_starved: u64,
    /// Tx batches cut short because the ring had no free descriptor.
    pub tx_ring_full: u64,
}

struct RxQueue {
    ring: DmaRegion,
    /// Buffer handle behind each descriptor slot.
    shadow: Vec<PacketBuffer>,
    pool: Arc<Mempool>,
    ring_size: u16,
    index: u16,
}

struct TxQueue {
    ring: DmaRegion,
    shadow: Vec<PacketBuffer>,
    ring_size: u16,
    /// First slot not yet posted to the NIC.
    index: u16,
    /// First posted slot not yet confirmed completed.
    clean_index: u16,
    /// Last pool buffers were returned to; avoids a registry lookup per
    /// cleaned buffer in the common one-pool case.
    pool_cache: Option<Arc<Mempool>>,
}

pub struct IxgbeDevice {
    pci_addr: String,
    mmio: MmioRegion,
    _pci: Option<PciDevice>,
    config: DeviceConfig,
    rx_pools: Vec<Option<Arc<Mempool>>>,
    rx_queues: Vec<RxQueue>,
    tx_queues: Vec<TxQueue>,
    counters: DataPathCounters,
    running: bool,
    /// Rings come from plain heap memory instead of hugepages; set by the
    /// register-file test constructor only.
    host_backed: bool,
}

/// Factory registered under the `"ixgbe"` driver name. Builds one pool per
/// rx queue and brings the device all the way up.
pub(crate) fn ixgbe_factory(pci_addr: &str, config: &DeviceConfig) -> Result<Box<dyn Device>> {
    let mut dev = IxgbeDevice::with_config(pci_addr, config.clone())?;

    for queue in 0..config.num_rx_queues {
        let pool = Mempool::new(config.pool_entries, config.entry_size)?;
        pool.allocate();
        dev.attach_rx_pool(queue, pool);
    }

    dev.allocate()?;
    Ok(Box::new(dev))
}

impl IxgbeDevice {
    /// Open the NIC at `pci_addr` with default sizing. The device comes
    /// back unconfigured; attach rx pools, then call [`Device::allocate`].
    pub fn new(pci_addr: &str) -> Result<Self> {
        Self::with_config(pci_addr, DeviceConfig::default())
    }

    pub fn with_config(pci_addr: &str, config: DeviceConfig) -> Result<Self> {
        assert!(
            config.num_rx_queues <= MAX_QUEUES && config.num_tx_queues <= MAX_QUEUES,
            "queue limit is {MAX_QUEUES}"
        );
        assert!(
            config.ring_size.is_power_of_two(),
            "ring size must be a power of two"
        );

        let (pci, mmio) = PciDevice::open(pci_addr, is_ixgbe_id)?;
        let rx_pools = (0..config.num_rx_queues).map(|_| None).collect();

        Ok(IxgbeDevice {
            pci_addr: pci_addr.to_string(),
            mmio,
            _pci: Some(pci),
            config,
            rx_pools,
            rx_queues: Vec::new(),
            tx_queues: Vec::new(),
            counters: DataPathCounters::default(),
            running: false,
            host_backed: false,
        })
    }

    /// Associate `pool` with rx queue `queue`. Must happen before
    /// [`Device::allocate`]; receiving into a queue without a pool is a bug
    /// caught there.
    pub fn attach_rx_pool(&mut self, queue: u16, pool: Arc<Mempool>) {
        assert!(!self.running, "cannot reassign pools on a running device");
        self.rx_pools[queue as usize] = Some(pool);
    }

    /// Soft event counters of this device.
    pub fn counters(&self) -> DataPathCounters {
        self.counters
    }

    fn allocate_inner(&mut self) -> Result<()> {
        for queue in 0..self.config.num_rx_queues {
            if self.rx_pools[queue as usize].is_none() {
                return Err(DriverError::QueueWithoutPool(queue));
            }
        }

        self.reset_and_init()
    }

    /// Section 4.6: global reset and full bring-up.
    fn reset_and_init(&mut self) -> Result<()> {
        info!(pci_addr = %self.pci_addr, "resetting device");

        // 4.6.3.1 - mask all interrupts; we poll.
        self.mmio.set_reg32(regs::EIMC, regs::IRQ_CLEAR_MASK);

        // 4.6.3.2 - global reset, then give the device time to settle.
        self.mmio.set_reg32(regs::CTRL, regs::CTRL_RST_MASK);
        thread::sleep(RESET_SETTLE);

        // The reset re-arms interrupts; mask them again.
        self.mmio.set_reg32(regs::EIMC, regs::IRQ_CLEAR_MASK);

        // 4.6.3 - EEPROM auto-read and DMA init must finish first.
        self.mmio
            .wait_set_reg32(regs::EEC, regs::EEC_ARD, "EEC", INIT_POLL_TIMEOUT)?;
        self.mmio.wait_set_reg32(
            regs::RDRXCTL,
            regs::RDRXCTL_DMAIDONE,
            "RDRXCTL",
            INIT_POLL_TIMEOUT,
        )?;

        // 4.6.4 - link auto-negotiation.
        self.init_link();

        // 4.6.5 - the counters are reset-on-read; read them once.
        self.reset_stats_regs();

        // 4.6.7 / 4.6.8 - ring setup.
        self.init_rx()?;
        self.init_tx()?;

        for queue in 0..self.config.num_rx_queues {
            self.start_rx_queue(queue)?;
        }
        for queue in 0..self.config.num_tx_queues {
            self.start_tx_queue(queue)?;
        }

        self.mmio.set_flags32(regs::RXCTRL, regs::RXCTRL_RXEN);

        if self.config.promiscuous {
            self.set_promiscuous(true);
        }

        self.wait_for_link();
        self.running = true;
        Ok(())
    }

    // Section 4.6.4.
    fn init_link(&self) {
        self.mmio.set_reg32(
            regs::AUTOC,
            (self.mmio.get_reg32(regs::AUTOC) & !regs::AUTOC_LMS_MASK)
                | regs::AUTOC_LMS_10G_SERIAL,
        );
        self.mmio.set_reg32(
            regs::AUTOC,
            (self.mmio.get_reg32(regs::AUTOC) & !regs::AUTOC_10G_PMA_PMD_MASK)
                | regs::AUTOC_10G_PMA_PMD_XAUI,
        );
        self.mmio.set_flags32(regs::AUTOC, regs::AUTOC_AN_RESTART);
    }

    // Section 4.6.7.
    fn init_rx(&mut self) -> Result<()> {
        // Hold rx off while reconfiguring.
        self.mmio.clear_flags32(regs::RXCTRL, regs::RXCTRL_RXEN);

        // 4.6.11.3.4 - all packet buffer space to pool 0.
        self.mmio.set_reg32(regs::rxpbsize(0), regs::RXPBSIZE_128KB);
        for i in 1..8 {
            self.mmio.set_reg32(regs::rxpbsize(i), 0);
        }

        // CRC strip must match on both registers.
        self.mmio.set_flags32(regs::HLREG0, regs::HLREG0_RXCRCSTRP);
        self.mmio.set_flags32(regs::RDRXCTL, regs::RDRXCTL_CRCSTRIP);

        // Accept broadcast.
        self.mmio.set_flags32(regs::FCTRL, regs::FCTRL_BAM);

        let ring_size = self.config.ring_size;
        for queue in 0..self.config.num_rx_queues {
            debug!(queue, "configuring rx queue");

            // Advanced one-buffer descriptors; drop on descriptor underrun
            // instead of backpressuring the whole port.
            self.mmio.set_reg32(
                regs::srrctl(queue),
                (self.mmio.get_reg32(regs::srrctl(queue)) & !regs::SRRCTL_DESCTYPE_MASK)
                    | regs::SRRCTL_DESCTYPE_ADV_ONEBUF,
            );
            self.mmio.set_flags32(regs::srrctl(queue), regs::SRRCTL_DROP_EN);

            let ring = self.alloc_ring(ring_size)?;
            self.mmio
                .set_reg32(regs::rdbal(queue), (ring.phys() & 0xffff_ffff) as u32);
            self.mmio
                .set_reg32(regs::rdbah(queue), (ring.phys() as u64 >> 32) as u32);
            self.mmio
                .set_reg32(regs::rdlen(queue), (ring_size as usize * DESC_SIZE) as u32);
            self.mmio.set_reg32(regs::rdh(queue), 0);
            self.mmio.set_reg32(regs::rdt(queue), 0);

            let pool = self.rx_pools[queue as usize]
                .as_ref()
                .expect("checked before init")
                .clone();

            self.rx_queues.push(RxQueue {
                ring,
                shadow: vec![PacketBuffer::empty(); ring_size as usize],
                pool,
                ring_size,
                index: 0,
            });
        }

        // Last sentence of 4.6.7.
        self.mmio.set_flags32(regs::CTRL_EXT, regs::CTRL_EXT_NS_DIS);

        // This bit ships as 1 but must be 0.
        for queue in 0..self.config.num_rx_queues {
            self.mmio.clear_flags32(regs::dca_rxctrl(queue), 1 << 12);
        }

        Ok(())
    }

    // Section 4.6.8.
    fn init_tx(&mut self) -> Result<()> {
        // CRC insertion and padding of runt frames.
        self.mmio
            .set_flags32(regs::HLREG0, regs::HLREG0_TXCRCEN | regs::HLREG0_TXPADEN);

        // 4.6.11.3.4 - all packet buffer space to pool 0.
        self.mmio.set_reg32(regs::txpbsize(0), regs::TXPBSIZE_40KB);
        for i in 1..8 {
            self.mmio.set_reg32(regs::txpbsize(i), 0);
        }

        // Required when DCB and virtualization are off.
        self.mmio.set_reg32(regs::DTXMXSZRQ, 0xffff);
        self.mmio.clear_flags32(regs::RTTDCS, regs::RTTDCS_ARBDIS);

        let ring_size = self.config.ring_size;
        for queue in 0..self.config.num_tx_queues {
            debug!(queue, "configuring tx queue");

            let ring = self.alloc_ring(ring_size)?;
            self.mmio
                .set_reg32(regs::tdbal(queue), (ring.phys() & 0xffff_ffff) as u32);
            self.mmio
                .set_reg32(regs::tdbah(queue), (ring.phys() as u64 >> 32) as u32);
            self.mmio
                .set_reg32(regs::tdlen(queue), (ring_size as usize * DESC_SIZE) as u32);

            // Writeback thresholds (7.2.3.4.1): prefetch 36, host 8, and
            // no write-back coalescing, as descriptor-done probing relies
            // on prompt DD updates.
            let mut txdctl = self.mmio.get_reg32(regs::txdctl(queue));
            txdctl &= !(0x3f | (0x3f << 8) | (0x3f << 16));
            txdctl |= 36 | (8 << 8);
            self.mmio.set_reg32(regs::txdctl(queue), txdctl);

            self.tx_queues.push(TxQueue {
                ring,
                shadow: vec![PacketBuffer::empty(); ring_size as usize],
                ring_size,
                index: 0,
                clean_index: 0,
                pool_cache: None,
            });
        }

        // Enable DMA once, globally.
        self.mmio.set_flags32(regs::DMATXCTL, regs::DMATXCTL_TE);

        Ok(())
    }

    fn alloc_ring(&self, ring_size: u16) -> Result<DmaRegion> {
        let bytes = ring_size as usize * DESC_SIZE;
        let ring = if self.host_backed {
            DmaRegion::host(bytes)?
        } else {
            DmaRegion::hugetlb(bytes, true)?
        };

        // 0xff everywhere so a prematurely fetched descriptor never points
        // at address 0.
        unsafe { ptr::write_bytes(ring.virt(), 0xff, bytes) };
        Ok(ring)
    }

    /// Enable rx queue `queue`, arm every descriptor with a pool buffer,
    /// and publish the full ring to the NIC.
    fn start_rx_queue(&mut self, queue: u16) -> Result<()> {
        debug!(queue, "starting rx queue");

        self.mmio.set_flags32(regs::rxdctl(queue), regs::RXDCTL_ENABLE);
        self.mmio
            .wait_set_reg32(regs::rxdctl(queue), regs::RXDCTL_ENABLE, "RXDCTL", INIT_POLL_TIMEOUT)?;

        {
            let rxq = &mut self.rx_queues[queue as usize];
            let descriptors = rxq.ring.virt() as *mut AdvRxDesc;

            for i in 0..rxq.ring_size as usize {
                let buf = rxq.pool.pop();
                if buf.is_empty_sentinel() {
                    return Err(DriverError::PoolExhausted);
                }

                unsafe {
                    let desc = descriptors.add(i);
                    ptr::write_volatile(&raw mut (*desc).read.pkt_addr, buf.dma_addr());
                    ptr::write_volatile(&raw mut (*desc).read.hdr_addr, 0);
                }
                rxq.shadow[i] = buf;
            }
        }

        // The rx ring starts out full.
        let ring_size = self.rx_queues[queue as usize].ring_size;
        fence(Ordering::Release);
        self.mmio.set_reg32(regs::rdt(queue), u32::from(ring_size - 1));

        Ok(())
    }

    fn start_tx_queue(&mut self, queue: u16) -> Result<()> {
        debug!(queue, "starting tx queue");

        // The tx ring starts out empty.
        self.mmio.set_reg32(regs::tdh(queue), 0);
        self.mmio.set_reg32(regs::tdt(queue), 0);

        self.mmio.set_flags32(regs::txdctl(queue), regs::TXDCTL_ENABLE);
        self.mmio
            .wait_set_reg32(regs::txdctl(queue), regs::TXDCTL_ENABLE, "TXDCTL", INIT_POLL_TIMEOUT)?;

        Ok(())
    }

    fn wait_for_link(&self) {
        let start = Instant::now();
        let mut speed = self.link_speed();
        while speed == 0 && start.elapsed() < LINK_TIMEOUT {
            thread::sleep(Duration::from_millis(10));
            speed = self.link_speed();
        }

        if speed == 0 {
            warn!(pci_addr = %self.pci_addr, "link did not come up");
        } else {
            info!(pci_addr = %self.pci_addr, speed_mbit = speed, "link established");
        }
    }

    fn link_speed(&self) -> u16 {
        let links = self.mmio.get_reg32(regs::LINKS);
        if links & regs::LINKS_UP == 0 {
            return 0;
        }
        match links & regs::LINKS_SPEED_MASK {
            regs::LINKS_SPEED_100M => 100,
            regs::LINKS_SPEED_1G => 1000,
            regs::LINKS_SPEED_10G => 10000,
            _ => 0,
        }
    }

    fn set_promiscuous(&mut self, enabled: bool) {
        if enabled {
            info!(pci_addr = %self.pci_addr, "enabling promiscuous mode");
            self.mmio
                .set_flags32(regs::FCTRL, regs::FCTRL_UPE | regs::FCTRL_MPE);
        } else {
            info!(pci_addr = %self.pci_addr, "disabling promiscuous mode");
            self.mmio
                .clear_flags32(regs::FCTRL, regs::FCTRL_UPE | regs::FCTRL_MPE);
        }
    }

    fn reset_stats_regs(&self) {
        self.mmio.get_reg32(regs::GPRC);
        self.mmio.get_reg32(regs::GPTC);
        self.mmio.get_reg32(regs::GORCL);
        self.mmio.get_reg32(regs::GORCH);
        self.mmio.get_reg32(regs::GOTCL);
        self.mmio.get_reg32(regs::GOTCH);
    }

    /// Harvest completed descriptors on `queue`, returning up to
    /// `bufs.len()` packets. Each harvested slot is immediately re-armed
    /// with a fresh pool buffer; on pool underrun the batch stops short of
    /// the starved slot so the NIC never sees an unarmed descriptor.
    fn rx_batch_inner(&mut self, queue_id: u16, bufs: &mut [PacketBuffer]) -> usize {
        assert!(self.running, "device is not running");
        let queue = &mut self.rx_queues[queue_id as usize];

        let descriptors = queue.ring.virt() as *mut AdvRxDesc;
        let mut index = queue.index;
        let mut last_filled = index;
        let mut received = 0;

        while received < bufs.len() {
            let desc = unsafe { descriptors.add(index as usize) };
            let status = unsafe { ptr::read_volatile(&raw const (*desc).wb.status_error) };
            if status & regs::RXD_STAT_DD == 0 {
                break;
            }
            assert!(
                status & regs::RXD_STAT_EOP != 0,
                "multi-descriptor frame received: increase buffer size or decrease MTU"
            );

            let fresh = queue.pool.pop();
            if fresh.is_empty_sentinel() {
                // Leave this slot completed-but-unharvested; it is picked
                // up again once the pool has buffers.
                self.counters.rx_starved += 1;
                debug!(queue = queue_id, "rx refill starved");
                break;
            }

            let length = unsafe { ptr::read_volatile(&raw const (*desc).wb.length) };
            let mut done = std::mem::replace(&mut queue.shadow[index as usize], fresh);
            done.set_len(length as usize);
            bufs[received] = done;

            // Re-arm: the read-format write also clears the writeback
            // status, returning the slot to the NIC.
            unsafe {
                ptr::write_volatile(
                    &raw mut (*desc).read.pkt_addr,
                    queue.shadow[index as usize].dma_addr(),
                );
                ptr::write_volatile(&raw mut (*desc).read.hdr_addr, 0);
            }

            last_filled = index;
            index = wrap_ring(index, queue.ring_size);
            received += 1;
        }

        if received > 0 {
            queue.index = index;
            // Descriptor writes must be visible before the tail moves.
            fence(Ordering::Release);
            self.mmio.set_reg32(regs::rdt(queue_id), u32::from(last_filled));
        }

        received
    }

    /// Post up to `bufs.len()` packets on `queue`. Completed descriptors
    /// are cleaned first; when the ring fills, the rest of the batch is
    /// left with the caller.
    fn tx_batch_inner(&mut self, queue_id: u16, bufs: &[PacketBuffer]) -> usize {
        assert!(self.running, "device is not running");
        let queue = &mut self.tx_queues[queue_id as usize];

        clean_tx_queue(queue);

        let descriptors = queue.ring.virt() as *mut AdvTxDesc;
        let mut index = queue.index;
        let mut sent = 0;

        for buf in bufs {
            assert!(
                !buf.is_empty_sentinel(),
                "cannot transmit the empty sentinel"
            );

            let next = wrap_ring(index, queue.ring_size);
            if next == queue.clean_index {
                self.counters.tx_ring_full += 1;
                debug!(queue = queue_id, "tx ring full");
                break;
            }

            let len = buf.len() as u32;
            unsafe {
                let desc = descriptors.add(index as usize);
                ptr::write_volatile(&raw mut (*desc).read.buffer_addr, buf.dma_addr());
                ptr::write_volatile(
                    &raw mut (*desc).read.cmd_type_len,
                    regs::TXD_DCMD_EOP
                        | regs::TXD_DCMD_RS
                        | regs::TXD_DCMD_IFCS
                        | regs::TXD_DCMD_DEXT
                        | regs::TXD_DTYP_DATA
                        | len,
                );
                ptr::write_volatile(&raw mut (*desc).read.olinfo_status, len << regs::TXD_PAYLEN_SHIFT);
            }

            queue.shadow[index as usize] = *buf;
            index = next;
            sent += 1;
        }

        if sent > 0 {
            queue.index = index;
            fence(Ordering::Release);
            self.mmio.set_reg32(regs::tdt(queue_id), u32::from(index));
        }

        sent
    }
}

/// Return completed tx buffers to their pools, [`TX_CLEAN_BATCH`] slots at
/// a time: the DD bit is probed only on batch-final descriptors.
fn clean_tx_queue(queue: &mut TxQueue) {
    loop {
        let mut cleanable = queue.index as i32 - queue.clean_index as i32;
        if cleanable < 0 {
            cleanable += queue.ring_size as i32;
        }
        if cleanable < TX_CLEAN_BATCH as i32 {
            break;
        }

        let mut cleanup_to = queue.clean_index as usize + TX_CLEAN_BATCH as usize - 1;
        if cleanup_to >= queue.ring_size as usize {
            cleanup_to -= queue.ring_size as usize;
        }

        let desc = unsafe { (queue.ring.virt() as *mut AdvTxDesc).add(cleanup_to) };
        let status = unsafe { ptr::read_volatile(&raw const (*desc).wb.status) };
        if status & regs::TXD_STAT_DD == 0 {
            break;
        }

        let mut idx = queue.clean_index as usize;
        loop {
            let buf = std::mem::replace(&mut queue.shadow[idx], PacketBuffer::empty());

            let pool_id = buf.pool_id();
            if !queue.pool_cache.as_ref().is_some_and(|p| p.id() == pool_id) {
                queue.pool_cache = Mempool::by_id(pool_id);
            }
            match &queue.pool_cache {
                Some(pool) => {
                    pool.push(buf);
                }
                None => {
                    tracing::error!(pool = pool_id, "tx buffer belongs to a dead pool, leaking");
                }
            }

            if idx == cleanup_to {
                break;
            }
            idx = wrap_ring(idx as u16, queue.ring_size) as usize;
        }

        queue.clean_index = wrap_ring(cleanup_to as u16, queue.ring_size);
    }
}

impl Device for IxgbeDevice {
    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn allocate(&mut self) -> Result<()> {
        assert!(!self.running, "device is already running");

        let res = self.allocate_inner();
        if res.is_err() {
            // Timed-out init leaves the device unconfigured.
            self.rx_queues.clear();
            self.tx_queues.clear();
            self.running = false;
        }
        res
    }

    fn read_stats(&self, stats: &mut DeviceStats) {
        stats.rx_pkts += u64::from(self.mmio.get_reg32(regs::GPRC));
        stats.tx_pkts += u64::from(self.mmio.get_reg32(regs::GPTC));
        stats.rx_bytes += u64::from(self.mmio.get_reg32(regs::GORCL))
            + (u64::from(self.mmio.get_reg32(regs::GORCH)) << 32);
        stats.tx_bytes += u64::from(self.mmio.get_reg32(regs::GOTCL))
            + (u64::from(self.mmio.get_reg32(regs::GOTCH)) << 32);
    }

    fn reset_stats(&mut self) {
        self.reset_stats_regs();
    }

    fn is_promiscuous(&self) -> bool {
        let fctrl = self.mmio.get_reg32(regs::FCTRL);
        fctrl & (regs::FCTRL_UPE | regs::FCTRL_MPE) == (regs::FCTRL_UPE | regs::FCTRL_MPE)
    }

    fn enable_promiscuous(&mut self) {
        self.set_promiscuous(true);
    }

    fn disable_promiscuous(&mut self) {
        self.set_promiscuous(false);
    }

    fn link_speed_mbit(&self) -> u16 {
        self.link_speed()
    }

    fn rx_batch(&mut self, queue: u16, bufs: &mut [PacketBuffer]) -> usize {
        self.rx_batch_inner(queue, bufs)
    }

    fn tx_batch(&mut self, queue: u16, bufs: &[PacketBuffer]) -> usize {
        self.tx_batch_inner(queue, bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device over an in-memory register file and heap-backed rings. Brings
    /// the queues up through the regular init paths; only the waits that
    /// depend on hardware-set bits (EEPROM, DMA init) are skipped.
    fn host_device(config: DeviceConfig) -> IxgbeDevice {
        let rx_pools = (0..config.num_rx_queues).map(|_| None).collect();
        IxgbeDevice {
            pci_addr: "0000:00:00.0".to_string(),
            mmio: MmioRegion::host(128 * 1024),
            _pci: None,
            config,
            rx_pools,
            rx_queues: Vec::new(),
            tx_queues: Vec::new(),
            counters: DataPathCounters::default(),
            running: false,
            host_backed: true,
        }
    }

    fn small_config(ring_size: u16) -> DeviceConfig {
        DeviceConfig {
            ring_size,
            ..DeviceConfig::default()
        }
    }

    fn started_device(ring_size: u16, pool_entries: u32) -> IxgbeDevice {
        let mut dev = host_device(small_config(ring_size));
        let pool = Mempool::new_host(pool_entries, 2048).unwrap();
        pool.allocate();
        dev.attach_rx_pool(0, pool);

        dev.init_rx().unwrap();
        dev.init_tx().unwrap();
        dev.start_rx_queue(0).unwrap();
        dev.start_tx_queue(0).unwrap();
        dev.running = true;
        dev
    }

    /// Simulate the NIC completing rx descriptor `i` with a frame of
    /// `length` bytes.
    fn complete_rx_desc(dev: &mut IxgbeDevice, i: usize, length: u16) {
        let descriptors = dev.rx_queues[0].ring.virt() as *mut AdvRxDesc;
        unsafe {
            let desc = descriptors.add(i);
            ptr::write_volatile(
                &raw mut (*desc).wb.status_error,
                regs::RXD_STAT_DD | regs::RXD_STAT_EOP,
            );
            ptr::write_volatile(&raw mut (*desc).wb.length, length);
        }
    }

    /// Simulate the NIC reporting tx descriptor `i` as done.
    fn complete_tx_desc(dev: &mut IxgbeDevice, i: usize) {
        let descriptors = dev.tx_queues[0].ring.virt() as *mut AdvTxDesc;
        unsafe {
            ptr::write_volatile(&raw mut (*descriptors.add(i)).wb.status, regs::TXD_STAT_DD);
        }
    }

    #[test]
    fn test_rx_ring_starts_full() {
        let dev = started_device(8, 32);

        // All 8 slots armed, tail published at ring_size - 1.
        assert_eq!(dev.mmio.get_reg32(regs::rdt(0)), 7);
        assert_eq!(dev.rx_queues[0].pool.size(), 32 - 8);

        let descriptors = dev.rx_queues[0].ring.virt() as *mut AdvRxDesc;
        for i in 0..8 {
            let addr = unsafe { ptr::read_volatile(&raw const (*descriptors.add(i)).read.pkt_addr) };
            assert_ne!(addr, 0, "descriptor {i} left unarmed");
        }
    }

    #[test]
    fn test_rx_batch_harvests_completed_prefix() {
        let mut dev = started_device(8, 32);

        for i in 0..5 {
            complete_rx_desc(&mut dev, i, 60);
        }

        let mut bufs = vec![PacketBuffer::empty(); 10];
        let received = dev.rx_batch_inner(0, &mut bufs);

        assert_eq!(received, 5);
        assert_eq!(dev.rx_queues[0].index, 5);
        assert_eq!(dev.mmio.get_reg32(regs::rdt(0)), 4);
        for buf in &bufs[..5] {
            assert!(!buf.is_empty_sentinel());
            assert_eq!(buf.len(), 60);
        }

        // Conservation: 8 slots nic-owned, 5 app-owned, rest free.
        assert_eq!(dev.rx_queues[0].pool.size(), 32 - 8 - 5);

        // Every slot is re-armed; no descriptor points at address 0.
        let descriptors = dev.rx_queues[0].ring.virt() as *mut AdvRxDesc;
        for i in 0..8 {
            let addr = unsafe { ptr::read_volatile(&raw const (*descriptors.add(i)).read.pkt_addr) };
            assert_ne!(addr, 0);
        }
    }

    #[test]
    fn test_rx_batch_stops_at_first_pending_descriptor() {
        let mut dev = started_device(8, 32);
        let mut bufs = vec![PacketBuffer::empty(); 8];

        // Nothing completed yet.
        assert_eq!(dev.rx_batch_inner(0, &mut bufs), 0);
        assert_eq!(dev.rx_queues[0].index, 0);

        // Index advances by exactly the harvested count across batches.
        complete_rx_desc(&mut dev, 0, 64);
        complete_rx_desc(&mut dev, 1, 64);
        assert_eq!(dev.rx_batch_inner(0, &mut bufs), 2);
        assert_eq!(dev.rx_queues[0].index, 2);

        complete_rx_desc(&mut dev, 2, 64);
        assert_eq!(dev.rx_batch_inner(0, &mut bufs), 1);
        assert_eq!(dev.rx_queues[0].index, 3);
    }

    #[test]
    fn test_rx_starvation_stops_before_unarmed_slot() {
        let mut dev = started_device(8, 32);

        // Drain the pool so no refill buffer exists.
        let pool = dev.rx_queues[0].pool.clone();
        let mut drained = Vec::new();
        loop {
            let buf = pool.pop();
            if buf.is_empty_sentinel() {
                break;
            }
            drained.push(buf);
        }

        for i in 0..3 {
            complete_rx_desc(&mut dev, i, 60);
        }

        let mut bufs = vec![PacketBuffer::empty(); 8];
        assert_eq!(dev.rx_batch_inner(0, &mut bufs), 0);
        // Tail untouched, slot still completed and harvestable later.
        assert_eq!(dev.mmio.get_reg32(regs::rdt(0)), 7);
        assert_eq!(dev.counters().rx_starved, 1);

        // Buffers return, harvesting resumes where it stopped.
        for buf in drained {
            assert!(pool.push(buf));
        }
        assert_eq!(dev.rx_batch_inner(0, &mut bufs), 3);
        assert_eq!(dev.mmio.get_reg32(regs::rdt(0)), 2);
    }

    #[test]
    fn test_tx_backpressure_and_clean() {
        let mut dev = started_device(512, 1024);
        let pool = dev.rx_queues[0].pool.clone();

        let mut bufs = Vec::new();
        for _ in 0..512 {
            let mut buf = pool.pop();
            assert!(!buf.is_empty_sentinel());
            buf.set_len(60);
            bufs.push(buf);
        }

        // One slot always stays unused to keep tail != clean boundary.
        let sent = dev.tx_batch_inner(0, &bufs);
        assert_eq!(sent, 511);
        assert_eq!(dev.mmio.get_reg32(regs::tdt(0)), 511);

        // Ring full, nothing completed: no progress.
        assert_eq!(dev.tx_batch_inner(0, &bufs[sent..]), 0);
        assert_eq!(dev.counters().tx_ring_full, 2);

        // 16 done is below the clean batch; still no slots reclaimed.
        for i in 0..16 {
            complete_tx_desc(&mut dev, i);
        }
        let after_16 = dev.tx_batch_inner(0, &bufs[sent..]);
        assert!(after_16 <= 16);

        // A full clean batch of 32 frees exactly 32 slots.
        for i in 0..32 {
            complete_tx_desc(&mut dev, i);
        }
        let free_before = pool.size();
        assert_eq!(dev.tx_batch_inner(0, &bufs[sent..]), 1);
        assert_eq!(pool.size(), free_before + 32);
        assert_eq!(dev.tx_queues[0].clean_index, 32);
    }

    #[test]
    fn test_init_times_out_on_dead_eeprom() {
        let mut dev = host_device(small_config(512));
        let pool = Mempool::new_host(8, 2048).unwrap();
        pool.allocate();
        dev.attach_rx_pool(0, pool);

        let start = Instant::now();
        let res = dev.allocate();
        let elapsed = start.elapsed();

        match res {
            Err(DriverError::InitTimeout { register, mask }) => {
                assert_eq!(register, "EEC");
                assert_eq!(mask, regs::EEC_ARD);
            }
            _ => panic!("expected EEC init timeout"),
        }

        // Reset settle plus one bounded poll, with scheduler slack.
        assert!(elapsed < Duration::from_millis(100));
        assert!(!dev.running);
        assert!(dev.rx_queues.is_empty());
    }

    #[test]
    fn test_allocate_requires_pools() {
        let mut dev = host_device(small_config(512));
        let res = dev.allocate();
        assert!(matches!(res, Err(DriverError::QueueWithoutPool(0))));
    }

    #[test]
    fn test_wrap_ring() {
        assert_eq!(wrap_ring(0, 8), 1);
        assert_eq!(wrap_ring(7, 8), 0);
        assert_eq!(wrap_ring(511, 512), 0);
    }
}
