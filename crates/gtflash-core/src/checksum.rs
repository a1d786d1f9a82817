//! Additive checksum helpers
//!
//! Every integrity check in the image format and the flash protocol is a
//! plain additive sum, in one of three widths:
//!
//! - [`sum8`]: byte-wise sum into a `u16` (legacy image payload, firmware
//!   info blocks),
//! - [`sum16_be`]: big-endian 16-bit word sum (flash package commits),
//! - [`sum16_le_u32`]: little-endian 16-bit word sum accumulated in `u32`
//!   (structured image header).
//!
//! The `append_*` helpers write the matching trailing field so that
//! verifying the whole buffer yields equality; they exist for building
//! images in tests and tools.

/// Byte-wise additive sum.
pub fn sum8(buf: &[u8]) -> u16 {
    buf.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

/// Sum of big-endian 16-bit words.
///
/// An odd trailing byte is treated as the high byte of a final word with a
/// zero low byte, matching the device-side accumulator.
pub fn sum16_be(buf: &[u8]) -> u16 {
    let mut acc = 0u16;
    let mut chunks = buf.chunks_exact(2);
    for w in &mut chunks {
        acc = acc.wrapping_add(u16::from_be_bytes([w[0], w[1]]));
    }
    if let [hi] = chunks.remainder() {
        acc = acc.wrapping_add((*hi as u16) << 8);
    }
    acc
}

/// Sum of little-endian 16-bit words, accumulated without truncation.
pub fn sum16_le_u32(buf: &[u8]) -> u32 {
    let mut acc = 0u32;
    let mut chunks = buf.chunks_exact(2);
    for w in &mut chunks {
        acc = acc.wrapping_add(u16::from_le_bytes([w[0], w[1]]) as u32);
    }
    if let [lo] = chunks.remainder() {
        acc = acc.wrapping_add(*lo as u32);
    }
    acc
}

/// Write `sum8` of `buf[..len-2]` into the trailing two bytes (BE) so that
/// a verifier comparing sum-against-tail sees a match.
pub fn append_sum8_be(buf: &mut [u8]) {
    let n = buf.len();
    assert!(n >= 2);
    let sum = sum8(&buf[..n - 2]);
    buf[n - 2..].copy_from_slice(&sum.to_be_bytes());
}
