#![forbid(unsafe_code)]
//! Shared types for the shallfs journal engine.
//!
//! Everything the on-disk format agrees on lives here: the device block
//! size, the superblock placement formula, the seeded CRC-32 used by both
//! the superblock and the log record codecs, and the little-endian field
//! readers the codecs are built from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed device block size; all device I/O is expressed in these units.
pub const DEV_BLOCK_SIZE: u64 = 4096;

/// Size of the on-disk superblock structure.
pub const SB_SIZE: usize = 1024;

/// Offset of the superblock within its device block (last 1,024 bytes,
/// leaving the front of block 0 to partition-table metadata).
pub const SB_BLOCK_OFFSET: u64 = DEV_BLOCK_SIZE - SB_SIZE as u64;

/// Magic string bracketing the superblock payload.
pub const SB_MAGIC: &[u8; 8] = b"SHALL 01";

/// Smallest device the format accepts.
pub const MIN_DEVICE_SIZE: u64 = 65_536;

/// Length of a content hash carried by HASH payloads.
pub const HASH_LENGTH: usize = 32;

/// CRC register seed: "SHAL" read little-endian.
pub const CRC_SEED: u32 = 0x4C41_4853;

/// Device block holding superblock `n`.
///
/// `L(n) = 16n^2 + 4n`; the quadratic spacing leaves progressively longer
/// contiguous data runs deeper into the device.
#[must_use]
pub fn superblock_location(n: u32) -> u64 {
    let n = u64::from(n);
    n * 4 * (4 * n + 1)
}

/// Byte offset of superblock `n` on the device.
#[must_use]
pub fn superblock_offset(n: u32) -> u64 {
    superblock_location(n) * DEV_BLOCK_SIZE + SB_BLOCK_OFFSET
}

/// Checksum used by every on-device artefact: reflected polynomial
/// `0xEDB88320`, register seeded with [`CRC_SEED`], no final XOR.
///
/// `crc32fast` keeps the complemented register between calls, so the seed
/// and the result are complemented at the boundary; the identity is anchored
/// by the test vectors below.
#[must_use]
pub fn shall_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!CRC_SEED);
    hasher.update(data);
    !hasher.finalize()
}

/// Physical device block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevBlock(pub u64);

impl fmt::Display for DevBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset on a byte-addressed device (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone commit counter stored in the superblock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a journal device, used to key the mount registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Build from a (major, minor) device number pair.
    #[must_use]
    pub fn from_dev(major: u32, minor: u32) -> Self {
        Self(u64::from(major) << 32 | u64::from(minor))
    }

    #[must_use]
    pub fn major(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub fn minor(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.major(), self.minor())
    }
}

/// Structural decode failure in a persistent artefact.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic at offset {offset}")]
    InvalidMagic { offset: usize },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    read_le_u32(data, offset).map(|v| v as i32)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Round `len` up to the next multiple of `alignment`.
#[inline]
#[must_use]
pub fn align_up(len: usize, alignment: u32) -> usize {
    let alignment = alignment as usize;
    debug_assert!(alignment > 0);
    len.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_empty_input_is_the_seed() {
        assert_eq!(shall_crc(b""), CRC_SEED);
    }

    #[test]
    fn crc_matches_bitwise_reference_for_one_zero_byte() {
        // Computed by hand from the reflected-0xEDB88320 register definition.
        assert_eq!(shall_crc(&[0x00]), 0xF22E_4106);
    }

    #[test]
    fn crc_matches_bitwise_reference_implementation() {
        fn reference(data: &[u8]) -> u32 {
            let mut crc = CRC_SEED;
            for &byte in data {
                crc ^= u32::from(byte);
                for _ in 0..8 {
                    crc = if crc & 1 != 0 {
                        (crc >> 1) ^ 0xEDB8_8320
                    } else {
                        crc >> 1
                    };
                }
            }
            crc
        }
        for data in [
            &b""[..],
            b"\0",
            b"SHALL 01",
            b"the quick brown fox",
            &[0xFF; 32],
        ] {
            assert_eq!(shall_crc(data), reference(data), "input {data:x?}");
        }
    }

    #[test]
    fn superblock_locations_are_quadratic() {
        assert_eq!(superblock_location(0), 0);
        assert_eq!(superblock_location(1), 20);
        assert_eq!(superblock_location(2), 72);
        assert_eq!(superblock_location(3), 156);
        assert_eq!(superblock_location(8), 1056);
    }

    #[test]
    fn superblock_offset_lands_in_the_last_kilobyte_of_its_block() {
        for n in 0..16 {
            let offset = superblock_offset(n);
            assert_eq!(offset % DEV_BLOCK_SIZE, SB_BLOCK_OFFSET);
            assert_eq!(offset / DEV_BLOCK_SIZE, superblock_location(n));
        }
    }

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(32, 8), 32);
        assert_eq!(align_up(33, 8), 40);
        assert_eq!(align_up(100, 64), 128);
    }

    #[test]
    fn device_id_round_trips_major_minor() {
        let id = DeviceId::from_dev(0x103, 0x7);
        assert_eq!(id.major(), 0x103);
        assert_eq!(id.minor(), 0x7);
        assert_eq!(id.to_string(), "103:7");
    }
}
