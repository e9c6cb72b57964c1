//! # Buffer Pool
//!
//! Lock-free free list of page-sized direct memory buffers.
//!
//! Released buffers are kept and handed out again instead of being freed.
//! Fresh buffers are either standalone backend allocations or, when
//! preallocation is configured, slices carved out of large areas. Areas are
//! allocated on first use and kept alive by the buffers cut from them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::backend::{Address, MemoryBackend};
use crate::config::DirectMemoryConfig;
use crate::error::{MemoryError, Result};
use crate::profiling::metrics::{bytes_to_gb, MB};

/// Direct memory currently held by a pool and the buffers it handed out
#[derive(Default)]
struct PoolLedger {
    standalone_pages: AtomicU64,
    area_bytes: AtomicU64,
}

/// Large allocation pages are carved from
struct PreallocatedArea {
    address: Address,
    size: usize,
    backend: Arc<dyn MemoryBackend>,
    ledger: Arc<PoolLedger>,
}

impl Drop for PreallocatedArea {
    fn drop(&mut self) {
        log::debug!("Releasing preallocated area of {} bytes", self.size);
        unsafe { self.backend.free(self.address, self.size) };
        self.ledger
            .area_bytes
            .fetch_sub(self.size as u64, Ordering::SeqCst);
    }
}

type AreaSlot = Arc<OnceCell<Arc<PreallocatedArea>>>;

enum Storage {
    Standalone {
        backend: Arc<dyn MemoryBackend>,
        ledger: Arc<PoolLedger>,
    },
    Area(Arc<PreallocatedArea>),
}

/// One pool page
///
/// Not leak-tracked. Dropping a buffer instead of releasing it returns a
/// standalone buffer to the backend; an area slice goes away with its area.
pub struct PageBuffer {
    address: Address,
    size: usize,
    storage: Storage,
}

impl PageBuffer {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the page lives inside a preallocated area
    pub fn is_preallocated(&self) -> bool {
        matches!(self.storage, Storage::Area(_))
    }

    /// Start of the underlying storage; stable across pool round trips
    pub fn as_ptr(&self) -> *const u8 {
        self.address.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.address.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.address.as_ptr(), self.size) }
    }

    fn backend(&self) -> &dyn MemoryBackend {
        match &self.storage {
            Storage::Standalone { backend, .. } => backend.as_ref(),
            Storage::Area(area) => area.backend.as_ref(),
        }
    }

    /// Zero the page
    pub fn zero(&mut self) {
        unsafe { self.backend().fill(self.address, self.size, 0) };
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        if let Storage::Standalone { backend, ledger } = &self.storage {
            unsafe { backend.free(self.address, self.size) };
            ledger.standalone_pages.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("preallocated", &self.is_preallocated())
            .finish()
    }
}

/// Pool of same-sized page buffers
pub struct BufferPool {
    backend: Arc<dyn MemoryBackend>,
    page_size: usize,
    pool: SegQueue<PageBuffer>,
    pool_limit: usize,
    /// Pages which may be carved from areas
    pre_allocation_limit: u64,
    max_pages_per_area: usize,
    /// Areas by index, filled on first use
    areas: Mutex<HashMap<usize, AreaSlot>>,
    next_allocation_position: AtomicU64,
    preallocated_buffers: AtomicU64,
    overflow_buffers: AtomicU64,
    ledger: Arc<PoolLedger>,
}

impl BufferPool {
    /// Pool without preallocation
    pub fn new(backend: Arc<dyn MemoryBackend>, page_size: usize) -> Self {
        Self::with_preallocation(backend, page_size, 0, 0, usize::MAX)
    }

    pub fn from_config(backend: Arc<dyn MemoryBackend>, config: &DirectMemoryConfig) -> Self {
        let (chunk_size, limit) = if config.preallocate {
            (config.memory_chunk_size, config.pre_allocation_limit)
        } else {
            (0, 0)
        };
        Self::with_preallocation(backend, config.page_size(), chunk_size, limit, config.pool_limit)
    }

    /// Pool carving up to `pre_allocation_limit` bytes of pages from areas of
    /// less than `max_chunk_size` bytes
    pub fn with_preallocation(
        backend: Arc<dyn MemoryBackend>,
        page_size: usize,
        max_chunk_size: usize,
        pre_allocation_limit: u64,
        pool_limit: usize,
    ) -> Self {
        assert!(page_size > 0, "page size must be positive");

        let max_pages_per_area = pages_per_area(page_size, max_chunk_size);
        let limit_pages = if max_pages_per_area > 1 {
            pre_allocation_limit / page_size as u64
        } else {
            0
        };

        log::debug!(
            "Buffer pool: page {} bytes, {} pages per area, {} preallocated pages",
            page_size,
            max_pages_per_area,
            limit_pages
        );

        Self {
            backend,
            page_size,
            pool: SegQueue::new(),
            pool_limit: pool_limit.max(1),
            pre_allocation_limit: limit_pages,
            max_pages_per_area,
            areas: Mutex::new(HashMap::new()),
            next_allocation_position: AtomicU64::new(0),
            preallocated_buffers: AtomicU64::new(0),
            overflow_buffers: AtomicU64::new(0),
            ledger: Arc::new(PoolLedger::default()),
        }
    }

    /// Take a buffer from the pool, or create one if the pool is empty
    ///
    /// Fresh buffers are always zeroed; `clear` zeroes reused ones too.
    pub fn acquire(&self, clear: bool) -> Result<PageBuffer> {
        if let Some(mut buffer) = self.pool.pop() {
            if clear {
                buffer.zero();
            }
            return Ok(buffer);
        }

        let position = self.next_allocation_position.fetch_add(1, Ordering::SeqCst);
        if position < self.pre_allocation_limit {
            return self.carve(position);
        }

        self.allocate_standalone()
    }

    fn carve(&self, position: u64) -> Result<PageBuffer> {
        let pages_per_area = self.max_pages_per_area as u64;
        let area_index = (position / pages_per_area) as usize;
        let slot = (position % pages_per_area) as usize;

        let cell = Arc::clone(self.areas.lock().entry(area_index).or_default());
        let area = cell.get_or_try_init(|| {
            let remaining = self.pre_allocation_limit - area_index as u64 * pages_per_area;
            let size = remaining.min(pages_per_area) as usize * self.page_size;

            let address = self.backend.allocate(size)?;
            unsafe { self.backend.fill(address, size, 0) };
            self.ledger
                .area_bytes
                .fetch_add(size as u64, Ordering::SeqCst);
            log::debug!("Preallocated area #{} of {} bytes", area_index, size);

            Ok::<_, MemoryError>(Arc::new(PreallocatedArea {
                address,
                size,
                backend: Arc::clone(&self.backend),
                ledger: Arc::clone(&self.ledger),
            }))
        })?;

        self.preallocated_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(PageBuffer {
            address: area.address.add(slot * self.page_size),
            size: self.page_size,
            storage: Storage::Area(Arc::clone(area)),
        })
    }

    fn allocate_standalone(&self) -> Result<PageBuffer> {
        let address = self.backend.allocate(self.page_size)?;
        unsafe { self.backend.fill(address, self.page_size, 0) };
        self.overflow_buffers.fetch_add(1, Ordering::SeqCst);
        self.ledger.standalone_pages.fetch_add(1, Ordering::SeqCst);

        Ok(PageBuffer {
            address,
            size: self.page_size,
            storage: Storage::Standalone {
                backend: Arc::clone(&self.backend),
                ledger: Arc::clone(&self.ledger),
            },
        })
    }

    /// Put a buffer back for reuse; contents are left as they are
    ///
    /// Buffers beyond the pool limit are dropped.
    pub fn release(&self, buffer: PageBuffer) {
        if buffer.len() != self.page_size {
            log::warn!(
                "Buffer of {} bytes released to pool of {} byte pages, dropping it",
                buffer.len(),
                self.page_size
            );
            return;
        }

        if self.pool.len() >= self.pool_limit {
            return;
        }

        self.pool.push(buffer);
    }

    /// Drop every pooled buffer and every area no handed-out page lives in,
    /// returning how many buffers were dropped
    ///
    /// The allocation position is not rewound: slots of a released area are
    /// carved again from a fresh area.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.pool.pop().is_some() {
            dropped += 1;
        }

        // an idle slot is referenced only by the map, its area only by the slot
        let mut areas = self.areas.lock();
        areas.retain(|_, slot| {
            let idle = Arc::strong_count(slot) == 1
                && slot.get().map_or(true, |area| Arc::strong_count(area) == 1);
            !idle
        });

        dropped
    }

    pub fn buffer_size(&self) -> usize {
        self.page_size
    }

    /// Buffers currently waiting in the pool
    pub fn buffers_in_pool(&self) -> usize {
        self.pool.len()
    }

    /// Fresh buffers created so far: the allocation position
    pub fn allocated_buffer_count(&self) -> u64 {
        self.next_allocation_position.load(Ordering::SeqCst)
    }

    /// Pages carved from preallocated areas so far
    pub fn preallocated_buffer_count(&self) -> u64 {
        self.preallocated_buffers.load(Ordering::SeqCst)
    }

    /// Standalone pages created so far
    pub fn overflow_buffer_count(&self) -> u64 {
        self.overflow_buffers.load(Ordering::SeqCst)
    }

    /// Pages which may be carved from preallocated areas
    pub fn pre_allocation_limit(&self) -> u64 {
        self.pre_allocation_limit
    }

    pub fn max_pages_per_area(&self) -> usize {
        self.max_pages_per_area
    }

    /// Direct memory currently held by the pool and its handed-out buffers
    pub fn allocated_memory(&self) -> u64 {
        self.ledger.area_bytes.load(Ordering::SeqCst)
            + self.ledger.standalone_pages.load(Ordering::SeqCst) * self.page_size as u64
    }

    pub fn allocated_memory_mb(&self) -> u64 {
        self.allocated_memory() / MB
    }

    pub fn allocated_memory_gb(&self) -> f64 {
        bytes_to_gb(self.allocated_memory())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("page_size", &self.page_size)
            .field("buffers_in_pool", &self.buffers_in_pool())
            .field("max_pages_per_area", &self.max_pages_per_area)
            .field("allocated_memory", &self.allocated_memory())
            .finish()
    }
}

/// Largest power of two `p` with `p * page_size < max_chunk_size`, or 1
fn pages_per_area(page_size: usize, max_chunk_size: usize) -> usize {
    let pages = max_chunk_size / page_size;
    if pages <= 1 {
        return 1;
    }

    let mut pages = pages.next_power_of_two().min(1 << 30);
    while pages as u128 * page_size as u128 >= max_chunk_size as u128 {
        pages >>= 1;
    }
    pages.max(1)
}
