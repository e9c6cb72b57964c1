//! # Pointer Allocator
//!
//! Single owner of backend allocate/free calls. Keeps the global counter of
//! outstanding direct memory and, in tracking mode, the leak registry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::backend::{Address, MemoryBackend};
use super::tracker::{AllocationRecord, AllocationSite, BlockId, LeakTracker};
use crate::error::{MemoryError, Result};

/// Logical purpose of an allocation, used for consumption breakdowns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intention {
    Unspecified,
    PageCache,
    WriteAheadLog,
    Index,
    Temporary,
}

impl Intention {
    pub const COUNT: usize = 5;

    pub const ALL: [Intention; Intention::COUNT] = [
        Intention::Unspecified,
        Intention::PageCache,
        Intention::WriteAheadLog,
        Intention::Index,
        Intention::Temporary,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for Intention {
    fn default() -> Self {
        Intention::Unspecified
    }
}

/// Contiguous direct memory range owned by exactly one handle
///
/// Not `Clone`: a block is handed back to [`PointerAllocator::free`] by
/// value, so the same allocation cannot be released twice through copies.
pub struct MemoryBlock {
    address: Address,
    size: usize,
    intention: Intention,
    site: Option<Arc<AllocationSite>>,
}

impl MemoryBlock {
    /// Block identity: (address, size)
    pub fn id(&self) -> BlockId {
        BlockId {
            address: self.address,
            size: self.size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn intention(&self) -> Intention {
        self.intention
    }

    /// Allocation site, present for tracked blocks
    pub fn site(&self) -> Option<&Arc<AllocationSite>> {
        self.site.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.address.is_null()
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    /// Swap this block out for a released placeholder of the same size
    pub(crate) fn take(&mut self) -> MemoryBlock {
        std::mem::replace(
            self,
            MemoryBlock {
                address: Address::NULL,
                size: self.size,
                intention: self.intention,
                site: self.site.clone(),
            },
        )
    }
}

impl PartialEq for MemoryBlock {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.size == other.size
    }
}

impl Eq for MemoryBlock {}

impl Hash for MemoryBlock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.size.hash(state);
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("intention", &self.intention)
            .field("tracked", &self.site.is_some())
            .finish()
    }
}

/// Allocator of direct memory blocks
pub struct PointerAllocator {
    backend: Arc<dyn MemoryBackend>,
    consumption: AtomicU64,
    blocks: AtomicU64,
    tracker: Option<LeakTracker>,
    strict: bool,
}

impl PointerAllocator {
    /// Create an allocator; `track` enables the leak registry
    ///
    /// `strict` only applies while tracking.
    pub fn new(backend: Arc<dyn MemoryBackend>, track: bool, strict: bool) -> Self {
        if track {
            log::info!("DIRECT-TRACK: direct memory leak tracking enabled");
        }

        Self {
            backend,
            consumption: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            tracker: track.then(LeakTracker::new),
            strict: strict && track,
        }
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker.is_some()
    }

    /// Allocate `size` bytes
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<MemoryBlock> {
        self.allocate_for(size, Intention::Unspecified)
    }

    /// Allocate `size` bytes tagged with an intention
    #[track_caller]
    pub fn allocate_for(&self, size: usize, intention: Intention) -> Result<MemoryBlock> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { size });
        }

        let address = self.backend.allocate(size)?;
        self.consumption.fetch_add(size as u64, Ordering::SeqCst);
        self.blocks.fetch_add(1, Ordering::SeqCst);

        let site = match &self.tracker {
            Some(tracker) => {
                let site = Arc::new(AllocationSite::capture());
                tracker.register(AllocationRecord {
                    id: BlockId { address, size },
                    intention,
                    site: site.clone(),
                });
                Some(site)
            }
            None => None,
        };

        log::trace!("Allocated {} bytes at {:?}", size, address);

        Ok(MemoryBlock {
            address,
            size,
            intention,
            site,
        })
    }

    /// Return a block to the backend
    #[track_caller]
    pub fn free(&self, block: MemoryBlock) -> Result<()> {
        if block.is_released() {
            return Err(self.double_free(block.id(), None));
        }

        if let Some(tracker) = &self.tracker {
            let release = Arc::new(AllocationSite::capture());
            if let Err(unregistered) = tracker.unregister(block.id(), release) {
                return Err(self.double_free(unregistered.id, unregistered.last_release));
            }
        }

        unsafe {
            self.backend.free(block.address, block.size);
        }
        self.consumption.fetch_sub(block.size as u64, Ordering::SeqCst);
        self.blocks.fetch_sub(1, Ordering::SeqCst);

        log::trace!("Freed {} bytes at {:?}", block.size, block.address);
        Ok(())
    }

    fn double_free(&self, id: BlockId, last_release: Option<Arc<AllocationSite>>) -> MemoryError {
        match &last_release {
            Some(site) => log::error!(
                "DIRECT-TRACK: double free of block {:?}, last released from {}",
                id,
                site
            ),
            None => log::error!(
                "DIRECT-TRACK: free of released or unregistered block {:?}",
                id
            ),
        }

        if self.strict {
            panic!("double free of direct memory block {:?}", id);
        }

        MemoryError::DoubleFree { size: id.size }
    }

    /// Called when an owning handle is dropped without free
    pub fn report_unreachable(&self, id: BlockId) {
        if let Some(tracker) = &self.tracker {
            tracker.mark_unreachable(id);
        }
    }

    /// Drain dropped handles and return the blocks that were never freed
    ///
    /// Counters are left untouched: a leaked block is still outstanding.
    pub fn check_for_leaks(&self) -> Vec<AllocationRecord> {
        let Some(tracker) = &self.tracker else {
            return Vec::new();
        };

        let leaks = tracker.drain_leaks();
        for leak in &leaks {
            log::error!(
                "DIRECT-TRACK: unreleased direct memory block {:?} ({} bytes) detected, allocated from {}",
                leak.id.address,
                leak.id.size,
                leak.site
            );
        }
        leaks
    }

    /// Bytes currently allocated and not freed
    pub fn memory_consumption(&self) -> u64 {
        self.consumption.load(Ordering::SeqCst)
    }

    /// Blocks currently allocated and not freed
    pub fn outstanding_blocks(&self) -> u64 {
        self.blocks.load(Ordering::SeqCst)
    }

    /// Still-registered tracked blocks
    pub fn tracked_records(&self) -> Vec<AllocationRecord> {
        self.tracker
            .as_ref()
            .map(LeakTracker::outstanding)
            .unwrap_or_default()
    }

    /// Leaks confirmed by previous leak checks
    pub fn leaked_count(&self) -> u64 {
        self.tracker.as_ref().map_or(0, LeakTracker::leaked_count)
    }
}

impl fmt::Debug for PointerAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerAllocator")
            .field("backend", &self.backend.kind())
            .field("consumption", &self.memory_consumption())
            .field("tracking", &self.is_tracking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::{AccessPolicy, FastBackend, PortableBackend};

    fn allocator(track: bool) -> PointerAllocator {
        PointerAllocator::new(Arc::new(FastBackend::new(AccessPolicy::default())), track, false)
    }

    #[test]
    fn test_allocate_free_restores_counter() {
        for track in [false, true] {
            let allocator = allocator(track);
            let before = allocator.memory_consumption();

            let block = allocator.allocate(1024).unwrap();
            assert_eq!(allocator.memory_consumption(), before + 1024);
            assert_eq!(allocator.outstanding_blocks(), 1);

            allocator.free(block).unwrap();
            assert_eq!(allocator.memory_consumption(), before);
            assert_eq!(allocator.outstanding_blocks(), 0);
        }
    }

    #[test]
    fn test_zero_size_rejected_before_backend() {
        let allocator = allocator(false);
        assert_eq!(
            allocator.allocate(0).unwrap_err(),
            MemoryError::InvalidSize { size: 0 }
        );
        assert_eq!(allocator.memory_consumption(), 0);
    }

    #[test]
    fn test_released_block_is_double_free() {
        let allocator = allocator(true);
        let mut block = allocator.allocate(32).unwrap();
        let live = block.take();
        allocator.free(live).unwrap();

        assert_eq!(
            allocator.free(block).unwrap_err(),
            MemoryError::DoubleFree { size: 32 }
        );
        assert_eq!(allocator.memory_consumption(), 0);
    }

    #[test]
    fn test_strict_ignored_without_tracking() {
        let allocator =
            PointerAllocator::new(Arc::new(FastBackend::new(AccessPolicy::default())), false, true);
        let mut block = allocator.allocate(16).unwrap();
        let live = block.take();
        allocator.free(live).unwrap();

        assert_eq!(
            allocator.free(block).unwrap_err(),
            MemoryError::DoubleFree { size: 16 }
        );
    }

    #[test]
    fn test_tracked_block_carries_site() {
        let allocator = allocator(true);
        let block = allocator.allocate_for(8, Intention::Index).unwrap();

        assert!(block.site().is_some());
        assert_eq!(block.intention(), Intention::Index);
        assert_eq!(allocator.tracked_records().len(), 1);

        allocator.free(block).unwrap();
        assert!(allocator.tracked_records().is_empty());
    }

    #[test]
    fn test_untracked_block_has_no_site() {
        let allocator = allocator(false);
        let block = allocator.allocate(8).unwrap();
        assert!(block.site().is_none());
        allocator.free(block).unwrap();
    }

    #[test]
    fn test_leak_check_keeps_counter() {
        let allocator = allocator(true);
        let block = allocator.allocate(128).unwrap();
        let id = block.id();

        allocator.report_unreachable(id);
        let leaks = allocator.check_for_leaks();

        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].id, id);
        assert_eq!(allocator.memory_consumption(), 128);
        assert!(allocator.check_for_leaks().is_empty());

        // the block was never actually dropped here, so release the memory
        unsafe { allocator.backend().free(block.address(), block.size()) };
    }

    #[test]
    fn test_portable_backend_allocation() {
        let allocator =
            PointerAllocator::new(Arc::new(PortableBackend::new(AccessPolicy::default())), false, false);
        let block = allocator.allocate(4096).unwrap();
        assert_eq!(block.size(), 4096);
        allocator.free(block).unwrap();
    }

    #[test]
    fn test_block_identity() {
        let allocator = allocator(false);
        let a = allocator.allocate(16).unwrap();
        let b = allocator.allocate(16).unwrap();

        assert_ne!(a, b);
        assert_eq!(a.id(), a.id());

        allocator.free(a).unwrap();
        allocator.free(b).unwrap();
    }
}
