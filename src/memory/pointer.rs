//! # Pointer
//!
//! Handle over a `(address, size)` block through which every byte-level
//! access happens.
//!
//! In safe mode each access is checked against the block capacity before
//! the backend is touched. A freed pointer keeps its size but its address
//! becomes the null sentinel, so later accesses fail with
//! [`MemoryError::UseAfterFree`] and a second free with
//! [`MemoryError::DoubleFree`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::allocator::{Intention, MemoryBlock};
use super::backend::{Address, MemoryBackend};
use super::factory::PointerFactory;
use super::tracker::AllocationSite;
use crate::error::{MemoryError, Result};

/// Pointer variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// Registered with the leak registry and the factory size counter
    Tracked,
    /// No registration, lifetime discipline is up to the caller
    Untracked,
}

/// Handle to a direct memory block
///
/// # Safety
///
/// With safe mode off the accessors skip the capacity check. These methods
/// are safe to call, yet an offset or length past the block end reads or
/// writes outside the allocation, which is undefined behaviour. Only the
/// use-after-free check still applies. Turn safe mode off only for callers
/// that already validate their offsets.
pub struct Pointer {
    block: MemoryBlock,
    factory: Arc<PointerFactory>,
    kind: PointerKind,
    safe_mode: bool,
    session: Option<u64>,
}

impl Pointer {
    pub(crate) fn new(
        block: MemoryBlock,
        factory: Arc<PointerFactory>,
        tracked: bool,
        session: Option<u64>,
    ) -> Self {
        let safe_mode = factory.safe_mode();
        Self {
            block,
            factory,
            kind: if tracked {
                PointerKind::Tracked
            } else {
                PointerKind::Untracked
            },
            safe_mode,
            session,
        }
    }

    /// Capacity in bytes
    pub fn size(&self) -> usize {
        self.block.size()
    }

    pub fn kind(&self) -> PointerKind {
        self.kind
    }

    pub fn is_tracked(&self) -> bool {
        self.kind == PointerKind::Tracked
    }

    pub fn is_freed(&self) -> bool {
        self.block.is_released()
    }

    pub fn intention(&self) -> Intention {
        self.block.intention()
    }

    /// Where a tracked pointer was allocated
    pub fn allocation_site(&self) -> Option<&AllocationSite> {
        self.block.site().map(|site| site.as_ref())
    }

    fn backend(&self) -> &dyn MemoryBackend {
        self.factory.allocator().backend().as_ref()
    }

    /// Resolve `offset` for an access of `length` bytes
    #[inline]
    fn checked(&self, offset: usize, length: usize) -> Result<Address> {
        let address = self.block.address();
        if address.is_null() {
            return Err(MemoryError::UseAfterFree);
        }

        if self.safe_mode {
            let capacity = self.block.size();
            let in_bounds = offset <= capacity
                && offset.checked_add(length).map_or(false, |end| end <= capacity);
            if !in_bounds {
                return Err(MemoryError::BoundsViolation {
                    offset,
                    length,
                    capacity,
                });
            }
        }

        Ok(address.add(offset))
    }

    pub fn get_byte(&self, offset: usize) -> Result<u8> {
        let address = self.checked(offset, 1)?;
        Ok(unsafe { self.backend().get_byte(address) })
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        let address = self.checked(offset, 1)?;
        unsafe { self.backend().set_byte(address, value) };
        Ok(())
    }

    pub fn get_short(&self, offset: usize) -> Result<i16> {
        let address = self.checked(offset, 2)?;
        Ok(unsafe { self.backend().get_short(address) })
    }

    pub fn set_short(&mut self, offset: usize, value: i16) -> Result<()> {
        let address = self.checked(offset, 2)?;
        unsafe { self.backend().set_short(address, value) };
        Ok(())
    }

    /// UTF-16 code unit
    pub fn get_char(&self, offset: usize) -> Result<u16> {
        let address = self.checked(offset, 2)?;
        Ok(unsafe { self.backend().get_char(address) })
    }

    pub fn set_char(&mut self, offset: usize, value: u16) -> Result<()> {
        let address = self.checked(offset, 2)?;
        unsafe { self.backend().set_char(address, value) };
        Ok(())
    }

    pub fn get_int(&self, offset: usize) -> Result<i32> {
        let address = self.checked(offset, 4)?;
        Ok(unsafe { self.backend().get_int(address) })
    }

    pub fn set_int(&mut self, offset: usize, value: i32) -> Result<()> {
        let address = self.checked(offset, 4)?;
        unsafe { self.backend().set_int(address, value) };
        Ok(())
    }

    pub fn get_long(&self, offset: usize) -> Result<i64> {
        let address = self.checked(offset, 8)?;
        Ok(unsafe { self.backend().get_long(address) })
    }

    pub fn set_long(&mut self, offset: usize, value: i64) -> Result<()> {
        let address = self.checked(offset, 8)?;
        unsafe { self.backend().set_long(address, value) };
        Ok(())
    }

    /// Copy `length` bytes starting at `offset`
    pub fn get_bytes(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let address = self.checked(offset, length)?;
        Ok(unsafe { self.backend().get_bytes(address, length) })
    }

    /// Fill `dst` with the bytes starting at `offset`
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let address = self.checked(offset, dst.len())?;
        unsafe { self.backend().read_into(address, dst) };
        Ok(())
    }

    /// Write `content[content_offset..content_offset + length]` at `offset`
    pub fn set_bytes(
        &mut self,
        offset: usize,
        content: &[u8],
        content_offset: usize,
        length: usize,
    ) -> Result<()> {
        let source_ok = content_offset
            .checked_add(length)
            .map_or(false, |end| end <= content.len());
        if !source_ok {
            return Err(MemoryError::BoundsViolation {
                offset: content_offset,
                length,
                capacity: content.len(),
            });
        }

        let address = self.checked(offset, length)?;
        unsafe {
            self.backend()
                .set_bytes(address, content, content_offset, length)
        };
        Ok(())
    }

    /// Set `length` bytes at `offset` to `value`
    pub fn fill(&mut self, offset: usize, length: usize, value: u8) -> Result<()> {
        let address = self.checked(offset, length)?;
        unsafe { self.backend().fill(address, length, value) };
        Ok(())
    }

    /// Zero the whole block
    pub fn clear(&mut self) -> Result<()> {
        self.fill(0, self.size(), 0)
    }

    /// Copy `length` bytes from this block into `dest`
    pub fn move_data(
        &self,
        src_offset: usize,
        dest: &mut Pointer,
        dest_offset: usize,
        length: usize,
    ) -> Result<()> {
        let src = self.checked(src_offset, length)?;
        let dst = dest.checked(dest_offset, length)?;
        unsafe { self.backend().move_data(src, dst, length) };
        Ok(())
    }

    /// Copy `length` bytes between two ranges of this block; ranges may overlap
    pub fn move_within(&mut self, src_offset: usize, dest_offset: usize, length: usize) -> Result<()> {
        let src = self.checked(src_offset, length)?;
        let dst = self.checked(dest_offset, length)?;
        unsafe { self.backend().move_data(src, dst, length) };
        Ok(())
    }

    /// Release the block; the pointer is unusable afterwards
    #[track_caller]
    pub fn free(&mut self) -> Result<()> {
        // a released block is rejected by the allocator without touching counters
        let block = self.block.take();
        let size = block.size();
        let intention = block.intention();
        self.factory.allocator().free(block)?;

        if self.is_tracked() {
            self.factory.on_memory_freed(size);
        }
        self.factory.sampler_release(size, intention, self.session);
        Ok(())
    }
}

impl Drop for Pointer {
    fn drop(&mut self) {
        if self.is_freed() {
            return;
        }

        if self.is_tracked() {
            log::debug!(
                "DIRECT-TRACK: pointer of {} bytes dropped without free",
                self.block.size()
            );
            self.factory.allocator().report_unreachable(self.block.id());
        }
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl Eq for Pointer {}

impl Hash for Pointer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.block.hash(state);
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("block", &self.block)
            .field("kind", &self.kind)
            .field("safe_mode", &self.safe_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteOrder, TraceLevel};
    use crate::memory::allocator::PointerAllocator;
    use crate::memory::backend::{AccessPolicy, FastBackend, PortableBackend};

    fn factory(safe_mode: bool, track: bool) -> Arc<PointerFactory> {
        let backend = Arc::new(FastBackend::new(AccessPolicy::default()));
        let allocator = Arc::new(PointerAllocator::new(backend, track, false));
        PointerFactory::new(allocator, safe_mode, false, TraceLevel::Total)
    }

    #[test]
    fn test_typed_access() {
        let factory = factory(true, false);
        let mut pointer = factory.create_pointer(32).unwrap();

        pointer.set_byte(0, 0x7F).unwrap();
        pointer.set_short(1, -2).unwrap();
        pointer.set_char(3, 'Z' as u16).unwrap();
        pointer.set_int(5, i32::MIN).unwrap();
        pointer.set_long(9, i64::MAX).unwrap();

        assert_eq!(pointer.get_byte(0).unwrap(), 0x7F);
        assert_eq!(pointer.get_short(1).unwrap(), -2);
        assert_eq!(pointer.get_char(3).unwrap(), 'Z' as u16);
        assert_eq!(pointer.get_int(5).unwrap(), i32::MIN);
        assert_eq!(pointer.get_long(9).unwrap(), i64::MAX);

        pointer.free().unwrap();
    }

    #[test]
    fn test_bounds_violation_names_offending_access() {
        let factory = factory(true, false);
        let mut pointer = factory.create_pointer(8).unwrap();

        assert_eq!(
            pointer.get_long(1).unwrap_err(),
            MemoryError::BoundsViolation {
                offset: 1,
                length: 8,
                capacity: 8
            }
        );
        assert!(pointer.get_byte(8).is_err());
        assert!(pointer.get_bytes(9, 0).is_err());
        assert!(pointer.get_bytes(8, 0).unwrap().is_empty());
        assert!(pointer.get_bytes(usize::MAX, 2).is_err());
        assert!(pointer.set_int(6, 1).is_err());

        pointer.free().unwrap();
    }

    #[test]
    fn test_set_bytes_checks_source_range() {
        let factory = factory(true, false);
        let mut pointer = factory.create_pointer(8).unwrap();

        assert_eq!(
            pointer.set_bytes(0, &[1, 2, 3], 2, 2).unwrap_err(),
            MemoryError::BoundsViolation {
                offset: 2,
                length: 2,
                capacity: 3
            }
        );

        pointer.set_bytes(6, &[1, 2, 3], 1, 2).unwrap();
        assert_eq!(pointer.get_bytes(6, 2).unwrap(), vec![2, 3]);
        pointer.free().unwrap();
    }

    #[test]
    fn test_use_after_free_and_double_free() {
        let factory = factory(true, false);
        let mut pointer = factory.create_pointer(16).unwrap();
        pointer.free().unwrap();

        assert!(pointer.is_freed());
        assert_eq!(pointer.get_int(0).unwrap_err(), MemoryError::UseAfterFree);
        assert_eq!(pointer.set_byte(0, 1).unwrap_err(), MemoryError::UseAfterFree);
        assert_eq!(
            pointer.free().unwrap_err(),
            MemoryError::DoubleFree { size: 16 }
        );
        assert_eq!(factory.allocator().memory_consumption(), 0);
    }

    #[test]
    fn test_use_after_free_detected_without_safe_mode() {
        let factory = factory(false, false);
        let mut pointer = factory.create_pointer(16).unwrap();
        pointer.free().unwrap();
        assert_eq!(pointer.get_long(0).unwrap_err(), MemoryError::UseAfterFree);
    }

    #[test]
    fn test_unsafe_mode_skips_bounds_check() {
        let factory = factory(false, false);
        let mut pointer = factory.create_pointer(64).unwrap();

        // still inside the block, but the check itself is not performed
        pointer.set_int(60, 42).unwrap();
        assert_eq!(pointer.get_int(60).unwrap(), 42);
        pointer.free().unwrap();
    }

    #[test]
    fn test_move_data_between_pointers() {
        let factory = factory(true, false);
        let source = factory.create_pointer_from(&[1, 2, 3, 4, 5, 6]).unwrap();
        let mut dest = factory.create_pointer(8).unwrap();
        dest.clear().unwrap();

        source.move_data(2, &mut dest, 4, 4).unwrap();
        assert_eq!(dest.get_bytes(0, 8).unwrap(), vec![0, 0, 0, 0, 3, 4, 5, 6]);

        assert!(source.move_data(4, &mut dest, 0, 3).is_err());
        assert!(source.move_data(0, &mut dest, 6, 3).is_err());

        let mut source = source;
        source.free().unwrap();
        dest.free().unwrap();
    }

    #[test]
    fn test_move_within_overlapping() {
        let factory = factory(true, false);
        let mut pointer = factory.create_pointer_from(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        pointer.move_within(0, 2, 6).unwrap();
        assert_eq!(pointer.get_bytes(0, 8).unwrap(), vec![1, 2, 1, 2, 3, 4, 5, 6]);
        pointer.free().unwrap();
    }

    #[test]
    fn test_equality_by_address_and_size() {
        let factory = factory(true, false);
        let mut a = factory.create_pointer(8).unwrap();
        let mut b = factory.create_pointer(8).unwrap();

        assert_eq!(a, a);
        assert_ne!(a, b);

        a.free().unwrap();
        b.free().unwrap();
    }

    #[test]
    fn test_tracked_pointer_keeps_site() {
        let factory = factory(true, true);
        let mut pointer = factory.create_pointer(8).unwrap();

        let site = pointer.allocation_site().unwrap();
        assert_eq!(site.location().file(), file!());
        pointer.free().unwrap();
    }

    #[test]
    fn test_big_endian_pointer_on_portable_backend() {
        let backend = Arc::new(PortableBackend::new(AccessPolicy::new(ByteOrder::BigEndian, false)));
        let allocator = Arc::new(PointerAllocator::new(backend, false, false));
        let factory = PointerFactory::new(allocator, true, false, TraceLevel::Total);

        let mut pointer = factory.create_pointer(4).unwrap();
        pointer.set_int(0, 0x0A0B_0C0D).unwrap();
        assert_eq!(pointer.get_bytes(0, 4).unwrap(), vec![0x0A, 0x0B, 0x0C, 0x0D]);
        pointer.free().unwrap();
    }
}
