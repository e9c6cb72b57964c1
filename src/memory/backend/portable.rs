//! Native backend over the C runtime allocator.

use super::{AccessPolicy, Address, BackendKind, MemoryBackend};
use crate::error::{MemoryError, Result};

/// Backend going through `malloc`/`free` and the libc copy routines
#[derive(Debug, Default)]
pub struct PortableBackend {
    policy: AccessPolicy,
}

impl PortableBackend {
    pub fn new(policy: AccessPolicy) -> Self {
        Self { policy }
    }
}

impl MemoryBackend for PortableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn access(&self) -> &AccessPolicy {
        &self.policy
    }

    fn allocate(&self, size: usize) -> Result<Address> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { size });
        }

        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        if ptr.is_null() {
            return Err(MemoryError::AllocationFailed {
                size,
                backend: BackendKind::Portable,
            });
        }

        Ok(Address::from_ptr(ptr))
    }

    unsafe fn free(&self, address: Address, _size: usize) {
        if !address.is_null() {
            libc::free(address.as_ptr() as *mut libc::c_void);
        }
    }

    unsafe fn get_byte(&self, address: Address) -> u8 {
        let mut byte = 0u8;
        libc::memcpy(
            &mut byte as *mut u8 as *mut libc::c_void,
            address.as_ptr() as *const libc::c_void,
            1,
        );
        byte
    }

    unsafe fn set_byte(&self, address: Address, value: u8) {
        libc::memset(address.as_ptr() as *mut libc::c_void, value as libc::c_int, 1);
    }

    unsafe fn read_into(&self, address: Address, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        libc::memcpy(
            dst.as_mut_ptr() as *mut libc::c_void,
            address.as_ptr() as *const libc::c_void,
            dst.len(),
        );
    }

    unsafe fn write_from(&self, address: Address, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        libc::memcpy(
            address.as_ptr() as *mut libc::c_void,
            src.as_ptr() as *const libc::c_void,
            src.len(),
        );
    }

    unsafe fn copy_chunk(&self, src: Address, dst: Address, length: usize) {
        libc::memmove(
            dst.as_ptr() as *mut libc::c_void,
            src.as_ptr() as *const libc::c_void,
            length,
        );
    }

    unsafe fn fill(&self, address: Address, length: usize, value: u8) {
        libc::memset(
            address.as_ptr() as *mut libc::c_void,
            value as libc::c_int,
            length,
        );
    }
}
