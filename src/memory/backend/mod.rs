//! # Memory Backend
//!
//! Stateless byte-level primitives over raw direct memory addresses.
//!
//! Two implementations exist and exactly one is selected at startup:
//! - [`FastBackend`]: in-process memory from the Rust global allocator, words
//!   are loaded straight from process addresses
//! - [`PortableBackend`]: memory obtained from the C runtime allocator, every
//!   access goes through `memcpy`/`memmove`/`memset`
//!
//! Multi-byte values are stored in the configured byte order. The aligned
//! path copies native words and swaps when the order differs, the fallback
//! assembles every value byte by byte. Both produce identical results.

pub mod endian;
pub mod fast;
pub mod portable;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{BackendSelection, ByteOrder, DirectMemoryConfig};
use crate::error::Result;

pub use fast::FastBackend;
pub use portable::PortableBackend;

/// Largest amount of bytes handed to a single native copy call
pub const MAX_MOVE_CHUNK: usize = 1 << 20;

/// Address inside direct memory
///
/// Never exposed to callers as an integer; `Address::NULL` is the sentinel
/// of released handles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(usize);

impl Address {
    /// Sentinel of released handles
    pub const NULL: Address = Address(0);

    pub(crate) fn from_ptr(ptr: *mut u8) -> Self {
        Address(ptr as usize)
    }

    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Check for the released-handle sentinel
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn add(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }

    fn distance_to(self, other: Address) -> usize {
        other.0 - self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

/// Backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendKind {
    Fast,
    Portable,
}

/// How multi-byte values are laid out and accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    byte_order: ByteOrder,
    aligned_only: bool,
}

impl AccessPolicy {
    pub fn new(byte_order: ByteOrder, aligned_only: bool) -> Self {
        Self {
            byte_order: byte_order.resolve(),
            aligned_only,
        }
    }

    pub fn from_config(config: &DirectMemoryConfig) -> Self {
        Self::new(
            config.byte_order,
            config.only_aligned_access || !unaligned_access_supported(),
        )
    }

    /// Resolved byte order (never `Native`)
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Whether the byte-by-byte fallback is in use
    pub fn aligned_only(&self) -> bool {
        self.aligned_only
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::new(ByteOrder::Native, false)
    }
}

/// Architectures which load unaligned words without faulting or trapping
pub fn unaligned_access_supported() -> bool {
    cfg!(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "s390x"
    ))
}

/// Word-level access to process addresses is only trusted where the
/// hardware tolerates unaligned loads.
pub fn fast_backend_supported() -> bool {
    unaligned_access_supported()
}

macro_rules! typed_access {
    ($(#[$meta:meta])* $get:ident, $set:ident, $ty:ty, $unsigned:ty) => {
        $(#[$meta])*
        unsafe fn $get(&self, address: Address) -> $ty {
            let policy = *self.access();
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            if policy.aligned_only() {
                for (i, byte) in raw.iter_mut().enumerate() {
                    *byte = self.get_byte(address.add(i));
                }
                endian::assemble(&raw, policy.byte_order()) as $unsigned as $ty
            } else {
                self.read_into(address, &mut raw);
                let value = <$ty>::from_ne_bytes(raw);
                if policy.byte_order().is_native() {
                    value
                } else {
                    value.swap_bytes()
                }
            }
        }

        $(#[$meta])*
        unsafe fn $set(&self, address: Address, value: $ty) {
            let policy = *self.access();
            if policy.aligned_only() {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                endian::disassemble(value as $unsigned as u64, &mut raw, policy.byte_order());
                for (i, byte) in raw.iter().enumerate() {
                    self.set_byte(address.add(i), *byte);
                }
            } else {
                let value = if policy.byte_order().is_native() {
                    value
                } else {
                    value.swap_bytes()
                };
                self.write_from(address, &value.to_ne_bytes());
            }
        }
    };
}

/// Byte-level primitives over raw direct memory
///
/// All accessors are `unsafe`: callers guarantee the address range lies
/// inside a live allocation of this backend. Bounds and lifetime checks
/// belong to [`Pointer`](crate::memory::Pointer).
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Implementation identity
    fn kind(&self) -> BackendKind;

    /// Byte order and access path
    fn access(&self) -> &AccessPolicy;

    /// Allocate `size` bytes
    fn allocate(&self, size: usize) -> Result<Address>;

    /// Release memory returned by [`allocate`](Self::allocate)
    ///
    /// # Safety
    /// `address` must come from `allocate(size)` on this backend and must
    /// not have been freed yet.
    unsafe fn free(&self, address: Address, size: usize);

    /// # Safety
    /// `address` must lie inside a live allocation.
    unsafe fn get_byte(&self, address: Address) -> u8;

    /// # Safety
    /// `address` must lie inside a live allocation.
    unsafe fn set_byte(&self, address: Address, value: u8);

    /// Copy `dst.len()` bytes out of direct memory
    ///
    /// # Safety
    /// The source range must lie inside a live allocation.
    unsafe fn read_into(&self, address: Address, dst: &mut [u8]);

    /// Copy `src` into direct memory
    ///
    /// # Safety
    /// The destination range must lie inside a live allocation.
    unsafe fn write_from(&self, address: Address, src: &[u8]);

    /// Single bounded copy, ranges may overlap
    ///
    /// # Safety
    /// Both ranges must lie inside live allocations.
    unsafe fn copy_chunk(&self, src: Address, dst: Address, length: usize);

    /// Set `length` bytes to `value`
    ///
    /// # Safety
    /// The range must lie inside a live allocation.
    unsafe fn fill(&self, address: Address, length: usize, value: u8);

    typed_access!(
        /// # Safety
        /// The value range must lie inside a live allocation.
        get_short, set_short, i16, u16
    );

    typed_access!(
        /// # Safety
        /// The value range must lie inside a live allocation.
        get_char, set_char, u16, u16
    );

    typed_access!(
        /// # Safety
        /// The value range must lie inside a live allocation.
        get_int, set_int, i32, u32
    );

    typed_access!(
        /// # Safety
        /// The value range must lie inside a live allocation.
        get_long, set_long, i64, u64
    );

    /// # Safety
    /// The range must lie inside a live allocation.
    unsafe fn get_bytes(&self, address: Address, length: usize) -> Vec<u8> {
        let mut data = vec![0u8; length];
        self.read_into(address, &mut data);
        data
    }

    /// Write `length` bytes of `content` starting at `offset` of `content`
    ///
    /// # Safety
    /// The destination range must lie inside a live allocation.
    unsafe fn set_bytes(&self, address: Address, content: &[u8], offset: usize, length: usize) {
        self.write_from(address, &content[offset..offset + length]);
    }

    /// Bulk copy, split into chunks of at most [`MAX_MOVE_CHUNK`] bytes
    ///
    /// Overlapping ranges are handled: chunks are copied back to front when
    /// the destination starts inside the source range.
    ///
    /// # Safety
    /// Both ranges must lie inside live allocations.
    unsafe fn move_data(&self, src: Address, dst: Address, length: usize) {
        if length == 0 || src == dst {
            return;
        }

        let backward = dst > src && src.distance_to(dst) < length;
        if backward {
            let mut remaining = length;
            while remaining > 0 {
                let chunk = remaining.min(MAX_MOVE_CHUNK);
                remaining -= chunk;
                self.copy_chunk(src.add(remaining), dst.add(remaining), chunk);
            }
        } else {
            let mut copied = 0;
            while copied < length {
                let chunk = (length - copied).min(MAX_MOVE_CHUNK);
                self.copy_chunk(src.add(copied), dst.add(copied), chunk);
                copied += chunk;
            }
        }
    }
}

/// Construct the backend requested by the configuration
pub fn select_backend(config: &DirectMemoryConfig) -> Arc<dyn MemoryBackend> {
    let policy = AccessPolicy::from_config(config);

    let kind = match config.backend {
        BackendSelection::Portable => BackendKind::Portable,
        BackendSelection::Fast if fast_backend_supported() => BackendKind::Fast,
        BackendSelection::Fast => {
            log::warn!(
                "Fast memory backend is not supported on {}, using portable backend",
                std::env::consts::ARCH
            );
            BackendKind::Portable
        }
        BackendSelection::Auto if fast_backend_supported() => BackendKind::Fast,
        BackendSelection::Auto => BackendKind::Portable,
    };

    log::info!(
        "Direct memory backend: {:?} (byte order {:?}, aligned only: {})",
        kind,
        policy.byte_order(),
        policy.aligned_only()
    );

    match kind {
        BackendKind::Fast => Arc::new(FastBackend::new(policy)),
        BackendKind::Portable => Arc::new(PortableBackend::new(policy)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(policy: AccessPolicy) -> Vec<Box<dyn MemoryBackend>> {
        vec![
            Box::new(FastBackend::new(policy)),
            Box::new(PortableBackend::new(policy)),
        ]
    }

    #[test]
    fn test_typed_round_trip_all_paths() {
        for order in [ByteOrder::BigEndian, ByteOrder::LittleEndian, ByteOrder::Native] {
            for aligned_only in [false, true] {
                for backend in backends(AccessPolicy::new(order, aligned_only)) {
                    let address = backend.allocate(32).unwrap();
                    unsafe {
                        backend.set_short(address, -12345);
                        backend.set_char(address.add(2), 0xBEEF);
                        backend.set_int(address.add(4), -19_088_744);
                        backend.set_long(address.add(9), 0x0123_4567_89AB_CDEF);

                        assert_eq!(backend.get_short(address), -12345);
                        assert_eq!(backend.get_char(address.add(2)), 0xBEEF);
                        assert_eq!(backend.get_int(address.add(4)), -19_088_744);
                        assert_eq!(backend.get_long(address.add(9)), 0x0123_4567_89AB_CDEF);

                        backend.free(address, 32);
                    }
                }
            }
        }
    }

    #[test]
    fn test_big_endian_layout() {
        for aligned_only in [false, true] {
            for backend in backends(AccessPolicy::new(ByteOrder::BigEndian, aligned_only)) {
                let address = backend.allocate(4).unwrap();
                unsafe {
                    backend.set_int(address, 0x0102_0304);
                    assert_eq!(backend.get_bytes(address, 4), vec![1, 2, 3, 4]);
                    backend.free(address, 4);
                }
            }
        }
    }

    #[test]
    fn test_little_endian_layout() {
        for aligned_only in [false, true] {
            for backend in backends(AccessPolicy::new(ByteOrder::LittleEndian, aligned_only)) {
                let address = backend.allocate(2).unwrap();
                unsafe {
                    backend.set_short(address, 0x0A0B);
                    assert_eq!(backend.get_bytes(address, 2), vec![0x0B, 0x0A]);
                    backend.free(address, 2);
                }
            }
        }
    }

    #[test]
    fn test_move_data_overlapping_forward_and_backward() {
        for backend in backends(AccessPolicy::default()) {
            let address = backend.allocate(16).unwrap();
            let pattern: Vec<u8> = (0..16).collect();
            unsafe {
                backend.set_bytes(address, &pattern, 0, 16);
                backend.move_data(address, address.add(4), 8);
                assert_eq!(
                    backend.get_bytes(address, 16),
                    vec![0, 1, 2, 3, 0, 1, 2, 3, 4, 5, 6, 7, 12, 13, 14, 15]
                );

                backend.set_bytes(address, &pattern, 0, 16);
                backend.move_data(address.add(4), address, 8);
                assert_eq!(
                    backend.get_bytes(address, 16),
                    vec![4, 5, 6, 7, 8, 9, 10, 11, 8, 9, 10, 11, 12, 13, 14, 15]
                );
                backend.free(address, 16);
            }
        }
    }

    #[test]
    fn test_move_data_larger_than_chunk() {
        let length = MAX_MOVE_CHUNK * 2 + 17;
        for backend in backends(AccessPolicy::default()) {
            let src = backend.allocate(length).unwrap();
            let dst = backend.allocate(length).unwrap();
            let content: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();
            unsafe {
                backend.set_bytes(src, &content, 0, length);
                backend.move_data(src, dst, length);
                assert_eq!(backend.get_bytes(dst, length), content);
                backend.free(src, length);
                backend.free(dst, length);
            }
        }
    }

    #[test]
    fn test_set_bytes_with_content_offset() {
        for backend in backends(AccessPolicy::default()) {
            let address = backend.allocate(4).unwrap();
            unsafe {
                backend.fill(address, 4, 0);
                backend.set_bytes(address, &[9, 8, 7, 6, 5], 2, 3);
                assert_eq!(backend.get_bytes(address, 4), vec![7, 6, 5, 0]);
                backend.free(address, 4);
            }
        }
    }

    #[test]
    fn test_select_backend_honours_portable_request() {
        let config = DirectMemoryConfig {
            backend: BackendSelection::Portable,
            ..Default::default()
        };
        assert_eq!(select_backend(&config).kind(), BackendKind::Portable);
    }

    #[test]
    fn test_select_backend_auto() {
        let backend = select_backend(&DirectMemoryConfig::default());
        if fast_backend_supported() {
            assert_eq!(backend.kind(), BackendKind::Fast);
        } else {
            assert_eq!(backend.kind(), BackendKind::Portable);
        }
    }

    #[test]
    fn test_forced_alignment_policy() {
        let config = DirectMemoryConfig {
            only_aligned_access: true,
            ..Default::default()
        };
        assert!(select_backend(&config).access().aligned_only());
    }
}
