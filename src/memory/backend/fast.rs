//! In-process backend over the Rust global allocator.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

use super::{AccessPolicy, Address, BackendKind, MemoryBackend};
use crate::error::{MemoryError, Result};

/// Alignment of every block handed out by the fast backend
pub const BLOCK_ALIGNMENT: usize = 16;

/// Direct process-memory backend
#[derive(Debug, Default)]
pub struct FastBackend {
    policy: AccessPolicy,
}

impl FastBackend {
    pub fn new(policy: AccessPolicy) -> Self {
        Self { policy }
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, BLOCK_ALIGNMENT).ok()
    }
}

impl MemoryBackend for FastBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fast
    }

    fn access(&self) -> &AccessPolicy {
        &self.policy
    }

    fn allocate(&self, size: usize) -> Result<Address> {
        let failed = MemoryError::AllocationFailed {
            size,
            backend: BackendKind::Fast,
        };

        if size == 0 {
            return Err(MemoryError::InvalidSize { size });
        }

        let layout = Self::layout(size).ok_or_else(|| failed.clone())?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(failed);
        }

        Ok(Address::from_ptr(ptr))
    }

    unsafe fn free(&self, address: Address, size: usize) {
        if address.is_null() {
            return;
        }

        if let Some(layout) = Self::layout(size) {
            dealloc(address.as_ptr(), layout);
        }
    }

    unsafe fn get_byte(&self, address: Address) -> u8 {
        ptr::read(address.as_ptr())
    }

    unsafe fn set_byte(&self, address: Address, value: u8) {
        ptr::write(address.as_ptr(), value);
    }

    unsafe fn read_into(&self, address: Address, dst: &mut [u8]) {
        ptr::copy_nonoverlapping(address.as_ptr() as *const u8, dst.as_mut_ptr(), dst.len());
    }

    unsafe fn write_from(&self, address: Address, src: &[u8]) {
        ptr::copy_nonoverlapping(src.as_ptr(), address.as_ptr(), src.len());
    }

    unsafe fn copy_chunk(&self, src: Address, dst: Address, length: usize) {
        ptr::copy(src.as_ptr() as *const u8, dst.as_ptr(), length);
    }

    unsafe fn fill(&self, address: Address, length: usize, value: u8) {
        ptr::write_bytes(address.as_ptr(), value, length);
    }
}
