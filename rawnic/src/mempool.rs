//! Packet buffers and the DMA memory pool.
//!
//! A pool owns one physically contiguous DMA region carved into equal
//! fixed-size slots. Each slot starts with a small header (bus address,
//! owning pool, payload length) followed by headroom padding; the payload
//! begins [`HEADROOM`] bytes in, which is what NIC descriptors point at.
//! Free buffers live on a LIFO stack so the most recently freed (and
//! cache-hot) buffer is reused first.
//!
//! Pools register themselves in a process-wide table keyed by a unique
//! nonzero id, so the owning pool of any buffer can be resolved from the
//! id stamped into its header.

use std::collections::HashMap;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use tracing::{debug, error};

use crate::error::Result;
use crate::memory::{DmaRegion, hugepage_size};

/// Offset of the payload from the start of a buffer slot. NIC descriptors
/// are programmed with `header_phys + HEADROOM`.
pub const HEADROOM: usize = 64;

/// Default slot size, enough for a full non-jumbo Ethernet frame.
pub const DEFAULT_ENTRY_SIZE: u32 = 2048;

#[repr(C)]
pub(crate) struct BufferHeader {
    /// Bus address of this header, fixed at pool setup.
    phys_addr: u64,
    /// Owning pool id, 0 for the orphan sentinel.
    pool_id: u32,
    /// Current payload length in bytes.
    size: u32,
}

const _: () = assert!(std::mem::size_of::<BufferHeader>() <= HEADROOM);

/// Backing for the orphan sentinel handle. Never written through.
static EMPTY_HEADER: BufferHeader = BufferHeader {
    phys_addr: 0,
    pool_id: 0,
    size: 0,
};

/// Handle to one fixed-size DMA packet buffer.
///
/// Handles are plain values; ownership of the underlying slot is tracked by
/// where the handle currently lives (pool free stack, ring shadow array, or
/// application code), never by the handle itself.
#[derive(Clone, Copy, Debug)]
pub struct PacketBuffer {
    header: *mut BufferHeader,
    entry_size: u32,
}

// Safety: a buffer is accessed by one owner at a time; handing a handle to
// another thread transfers that role.
unsafe impl Send for PacketBuffer {}

impl PacketBuffer {
    /// The orphan sentinel returned by [`Mempool::pop`] on underrun. It has
    /// no pool and no payload; arming a descriptor with it is a bug.
    pub fn empty() -> Self {
        PacketBuffer {
            header: &EMPTY_HEADER as *const BufferHeader as *mut BufferHeader,
            entry_size: 0,
        }
    }

    pub fn is_empty_sentinel(&self) -> bool {
        ptr::eq(self.header, &EMPTY_HEADER)
    }

    /// Bus address of the buffer header.
    pub fn phys_addr(&self) -> u64 {
        unsafe { (*self.header).phys_addr }
    }

    /// Bus address of the payload, the value NIC descriptors carry.
    pub fn dma_addr(&self) -> u64 {
        self.phys_addr() + HEADROOM as u64
    }

    /// Id of the owning pool.
    pub fn pool_id(&self) -> u32 {
        unsafe { (*self.header).pool_id }
    }

    /// Current payload length.
    pub fn len(&self) -> usize {
        unsafe { (*self.header).size as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload capacity of the slot.
    pub fn capacity(&self) -> usize {
        (self.entry_size as usize).saturating_sub(HEADROOM)
    }

    /// Set the payload length, e.g. after writing a frame for transmit.
    pub fn set_len(&mut self, len: usize) {
        assert!(!self.is_empty_sentinel(), "cannot resize the empty sentinel");
        assert!(len <= self.capacity(), "length {len} exceeds buffer capacity");
        unsafe { (*self.header).size = len as u32 };
    }

    /// The received or to-be-sent frame bytes.
    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.payload_ptr(), self.len()) }
    }

    /// The full writable payload area, capacity bytes long.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        assert!(!self.is_empty_sentinel(), "cannot write into the empty sentinel");
        unsafe { slice::from_raw_parts_mut(self.payload_ptr(), self.capacity()) }
    }

    fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self.header as *mut u8).add(HEADROOM) }
    }
}

struct PoolTable {
    pools: HashMap<u32, Weak<Mempool>>,
    last_id: u32,
}

/// Process-wide pool registry. Touched at pool construction, drop, and
/// ownership lookup; never on the per-packet fast path of a warmed-up queue.
static POOLS: LazyLock<Mutex<PoolTable>> = LazyLock::new(|| {
    Mutex::new(PoolTable {
        pools: HashMap::new(),
        last_id: 0,
    })
});

/// A bounded pool of fixed-size DMA packet buffers.
pub struct Mempool {
    id: u32,
    region: DmaRegion,
    entry_size: u32,
    entry_count: u32,
    free_stack: Mutex<Vec<PacketBuffer>>,
    carved: AtomicBool,
}

impl Mempool {
    /// Create a pool backed by pinned hugepage memory.
    ///
    /// The region is required to be physically contiguous so that every
    /// buffer's bus address is `base_phys + i * entry_size`; this caps
    /// `entry_count * entry_size` at one hugepage.
    ///
    /// The pool starts empty: call [`Mempool::allocate`] once to carve the
    /// region into buffers.
    pub fn new(entry_count: u32, entry_size: u32) -> Result<Arc<Mempool>> {
        assert!(entry_size > HEADROOM as u32, "entry size must exceed the headroom");
        assert!(
            hugepage_size() % entry_size as usize == 0,
            "entry size must divide the hugepage size"
        );

        let region = DmaRegion::hugetlb(entry_count as usize * entry_size as usize, true)?;
        Ok(Self::register(region, entry_count, entry_size))
    }

    /// Create a heap-backed pool for software devices and tests. Identity
    /// "bus" addresses; never attach one to real hardware.
    pub fn new_host(entry_count: u32, entry_size: u32) -> Result<Arc<Mempool>> {
        assert!(entry_size > HEADROOM as u32, "entry size must exceed the headroom");

        let region = DmaRegion::host(entry_count as usize * entry_size as usize)?;
        Ok(Self::register(region, entry_count, entry_size))
    }

    fn register(region: DmaRegion, entry_count: u32, entry_size: u32) -> Arc<Mempool> {
        let mut table = POOLS.lock().unwrap();

        // Probe upward from the last assigned id, skipping live ids and the
        // reserved 0. Ids of dropped pools become reusable.
        let mut id = table.last_id.wrapping_add(1);
        while id == 0 || table.pools.get(&id).is_some_and(|w| w.strong_count() > 0) {
            id = id.wrapping_add(1);
        }
        table.last_id = id;

        let pool = Arc::new(Mempool {
            id,
            region,
            entry_size,
            entry_count,
            free_stack: Mutex::new(Vec::with_capacity(entry_count as usize)),
            carved: AtomicBool::new(false),
        });

        table.pools.insert(id, Arc::downgrade(&pool));
        debug!(pool = id, entries = entry_count, entry_size, "registered mempool");

        pool
    }

    /// Look up a live pool by the id stamped into a buffer header.
    pub fn by_id(id: u32) -> Option<Arc<Mempool>> {
        POOLS.lock().unwrap().pools.get(&id).and_then(Weak::upgrade)
    }

    /// Carve the region into buffers and fill the free stack.
    ///
    /// One-time transition from *empty* to *ready*; a second call is a bug.
    ///
    /// # Panics
    ///
    /// Panics if the pool's buffers were already carved.
    pub fn allocate(&self) {
        assert!(
            !self.carved.swap(true, Ordering::SeqCst),
            "pool {} buffers already allocated",
            self.id
        );

        let mut stack = self.free_stack.lock().unwrap();
        for i in 0..self.entry_count {
            let offset = i as usize * self.entry_size as usize;
            let header = unsafe { self.region.virt().add(offset) } as *mut BufferHeader;

            // The region is physically contiguous, so per-slot addresses
            // follow from the base translation done at mmap time.
            unsafe {
                (*header).phys_addr = (self.region.phys() + offset) as u64;
                (*header).pool_id = self.id;
                (*header).size = 0;
            }

            stack.push(PacketBuffer {
                header,
                entry_size: self.entry_size,
            });
        }
    }

    /// Pop a free buffer. Returns the empty sentinel on underrun; never
    /// blocks.
    pub fn pop(&self) -> PacketBuffer {
        match self.free_stack.lock().unwrap().pop() {
            Some(buf) => buf,
            None => {
                debug!(pool = self.id, "pool exhausted");
                PacketBuffer::empty()
            }
        }
    }

    /// Pop up to `bufs.len()` free buffers into `bufs`, returning how many
    /// were produced.
    pub fn pop_batch(&self, bufs: &mut [PacketBuffer]) -> usize {
        let mut stack = self.free_stack.lock().unwrap();
        let n = bufs.len().min(stack.len());
        for slot in bufs[..n].iter_mut() {
            *slot = stack.pop().unwrap();
        }
        n
    }

    /// Return a buffer to the pool.
    ///
    /// Rejects the empty sentinel, buffers of other pools, and pushes onto
    /// a full stack (a double free); all three return `false`.
    pub fn push(&self, buf: PacketBuffer) -> bool {
        if buf.is_empty_sentinel() {
            error!(pool = self.id, "attempt to free the empty sentinel");
            return false;
        }
        if buf.pool_id() != self.id {
            error!(
                pool = self.id,
                buffer_pool = buf.pool_id(),
                "attempt to free a buffer into a foreign pool"
            );
            return false;
        }

        let mut stack = self.free_stack.lock().unwrap();
        if stack.len() >= self.entry_count as usize {
            error!(pool = self.id, "free stack full, double free?");
            return false;
        }

        stack.push(buf);
        true
    }

    /// Number of buffers currently free.
    pub fn size(&self) -> usize {
        self.free_stack.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total number of buffer slots.
    pub fn capacity(&self) -> u32 {
        self.entry_count
    }

    pub fn entry_size(&self) -> u32 {
        self.entry_size
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bus address of the first slot.
    pub fn base_phys(&self) -> u64 {
        self.region.phys() as u64
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        POOLS.lock().unwrap().pools.remove(&self.id);
    }
}
