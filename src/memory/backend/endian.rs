//! Byte-by-byte assembly of multi-byte values.
//!
//! Used when word access is disabled; must agree bit for bit with the
//! native-word path.

use crate::config::ByteOrder;

/// Build a value from up to eight bytes stored in `order`
pub fn assemble(bytes: &[u8], order: ByteOrder) -> u64 {
    debug_assert!(bytes.len() <= 8);

    let mut value = 0u64;
    match order.resolve() {
        ByteOrder::BigEndian => {
            for &byte in bytes {
                value = (value << 8) | byte as u64;
            }
        }
        _ => {
            for &byte in bytes.iter().rev() {
                value = (value << 8) | byte as u64;
            }
        }
    }
    value
}

/// Split the low `bytes.len()` bytes of `value` into `bytes` using `order`
pub fn disassemble(value: u64, bytes: &mut [u8], order: ByteOrder) {
    debug_assert!(bytes.len() <= 8);

    let width = bytes.len();
    match order.resolve() {
        ByteOrder::BigEndian => {
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (value >> (8 * (width - 1 - i))) as u8;
            }
        }
        _ => {
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (value >> (8 * i)) as u8;
            }
        }
    }
}
