//! Superblock codec and validity checks.
//!
//! The superblock is a fixed 1,024-byte structure occupying the last
//! kilobyte of device block `L(n) = 16n² + 4n`, bracketed by two copies of
//! the magic string and protected by the seeded CRC-32 over everything
//! before the checksum field.

use serde::{Deserialize, Serialize};
use shall_types::{
    DEV_BLOCK_SIZE, MIN_DEVICE_SIZE, ParseError, SB_MAGIC, SB_SIZE, read_fixed, read_le_u32,
    read_le_u64, shall_crc, superblock_location, superblock_offset,
};
use std::fmt;

// Field offsets within the 1,024-byte structure.
const OFF_MAGIC1: usize = 0;
const OFF_DEVICE_SIZE: usize = 8;
const OFF_DATA_SPACE: usize = 16;
const OFF_DATA_START: usize = 24;
const OFF_DATA_LENGTH: usize = 32;
const OFF_MAX_LENGTH: usize = 40;
const OFF_VERSION: usize = 48;
const OFF_FLAGS: usize = 56;
const OFF_ALIGNMENT: usize = 60;
const OFF_NUM_SUPERBLOCKS: usize = 64;
const OFF_THIS_SUPERBLOCK: usize = 68;
const OFF_NEW_SIZE: usize = 768;
const OFF_NEW_ALIGNMENT: usize = 776;
const OFF_NEW_SUPERBLOCKS: usize = 780;
const OFF_MAGIC2: usize = 1012;
const OFF_CHECKSUM: usize = 1020;

/// Superblock flag: always set on a formatted device.
pub const SB_VALID: u32 = 0x0001;
/// Superblock flag: not cleanly unmounted.
pub const SB_DIRTY: u32 = 0x0002;
/// Superblock flag: an offline geometry update was interrupted.
pub const SB_UPDATE: u32 = 0x0004;
/// All flag bits this version understands.
pub const SB_KNOWN_FLAGS: u32 = SB_VALID | SB_DIRTY | SB_UPDATE;

/// Decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub device_size: u64,
    pub data_space: u64,
    pub data_start: u64,
    pub data_length: u64,
    pub max_length: u64,
    pub version: u64,
    pub flags: u32,
    pub alignment: u32,
    pub num_superblocks: u32,
    pub this_superblock: u32,
    /// Offline-update plan, owned by the resize tool; zero when no update
    /// is pending.
    pub new_size: u64,
    pub new_alignment: u32,
    pub new_superblocks: u32,
}

impl Superblock {
    /// Decode from a raw 1,024-byte region: magics and CRC only, no
    /// field-level consistency checks.
    pub fn decode(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SB_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SB_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        let stored = read_le_u32(region, OFF_CHECKSUM)?;
        let computed = shall_crc(&region[..OFF_CHECKSUM]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }
        if &read_fixed::<8>(region, OFF_MAGIC1)? != SB_MAGIC {
            return Err(ParseError::InvalidMagic { offset: OFF_MAGIC1 });
        }
        if &read_fixed::<8>(region, OFF_MAGIC2)? != SB_MAGIC {
            return Err(ParseError::InvalidMagic { offset: OFF_MAGIC2 });
        }
        Ok(Self {
            device_size: read_le_u64(region, OFF_DEVICE_SIZE)?,
            data_space: read_le_u64(region, OFF_DATA_SPACE)?,
            data_start: read_le_u64(region, OFF_DATA_START)?,
            data_length: read_le_u64(region, OFF_DATA_LENGTH)?,
            max_length: read_le_u64(region, OFF_MAX_LENGTH)?,
            version: read_le_u64(region, OFF_VERSION)?,
            flags: read_le_u32(region, OFF_FLAGS)?,
            alignment: read_le_u32(region, OFF_ALIGNMENT)?,
            num_superblocks: read_le_u32(region, OFF_NUM_SUPERBLOCKS)?,
            this_superblock: read_le_u32(region, OFF_THIS_SUPERBLOCK)?,
            new_size: read_le_u64(region, OFF_NEW_SIZE)?,
            new_alignment: read_le_u32(region, OFF_NEW_ALIGNMENT)?,
            new_superblocks: read_le_u32(region, OFF_NEW_SUPERBLOCKS)?,
        })
    }

    /// Encode for writing as superblock `n`; stamps `this_superblock` and
    /// recomputes the CRC. Reserved areas are zero.
    #[must_use]
    pub fn encode(&self, n: u32) -> [u8; SB_SIZE] {
        let mut out = [0_u8; SB_SIZE];
        out[OFF_MAGIC1..OFF_MAGIC1 + 8].copy_from_slice(SB_MAGIC);
        out[OFF_DEVICE_SIZE..OFF_DEVICE_SIZE + 8].copy_from_slice(&self.device_size.to_le_bytes());
        out[OFF_DATA_SPACE..OFF_DATA_SPACE + 8].copy_from_slice(&self.data_space.to_le_bytes());
        out[OFF_DATA_START..OFF_DATA_START + 8].copy_from_slice(&self.data_start.to_le_bytes());
        out[OFF_DATA_LENGTH..OFF_DATA_LENGTH + 8].copy_from_slice(&self.data_length.to_le_bytes());
        out[OFF_MAX_LENGTH..OFF_MAX_LENGTH + 8].copy_from_slice(&self.max_length.to_le_bytes());
        out[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(&self.version.to_le_bytes());
        out[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        out[OFF_ALIGNMENT..OFF_ALIGNMENT + 4].copy_from_slice(&self.alignment.to_le_bytes());
        out[OFF_NUM_SUPERBLOCKS..OFF_NUM_SUPERBLOCKS + 4]
            .copy_from_slice(&self.num_superblocks.to_le_bytes());
        out[OFF_THIS_SUPERBLOCK..OFF_THIS_SUPERBLOCK + 4].copy_from_slice(&n.to_le_bytes());
        out[OFF_NEW_SIZE..OFF_NEW_SIZE + 8].copy_from_slice(&self.new_size.to_le_bytes());
        out[OFF_NEW_ALIGNMENT..OFF_NEW_ALIGNMENT + 4]
            .copy_from_slice(&self.new_alignment.to_le_bytes());
        out[OFF_NEW_SUPERBLOCKS..OFF_NEW_SUPERBLOCKS + 4]
            .copy_from_slice(&self.new_superblocks.to_le_bytes());
        out[OFF_MAGIC2..OFF_MAGIC2 + 8].copy_from_slice(SB_MAGIC);
        let crc = shall_crc(&out[..OFF_CHECKSUM]);
        out[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Full consistency check, one bit per independently-signalled defect.
    ///
    /// `physical_size` is the size of the underlying device when known;
    /// `None` signals an I/O error prevented reading it.
    #[must_use]
    pub fn check(&self, physical_size: Option<u64>) -> CheckFlags {
        let mut result = CheckFlags::OK;
        match physical_size {
            Some(physical) => {
                if self.device_size > physical {
                    result |= CheckFlags::TOOBIG;
                }
            }
            None => result |= CheckFlags::IOERR,
        }
        if self.flags & SB_VALID == 0 {
            result |= CheckFlags::NOVALID;
        }
        if self.flags & !SB_KNOWN_FLAGS != 0 {
            result |= CheckFlags::FLAGS;
        }
        if self.device_size % DEV_BLOCK_SIZE != 0 {
            result |= CheckFlags::NONBLOCK;
        }
        if self.device_size < MIN_DEVICE_SIZE || self.num_superblocks <= 8 {
            result |= CheckFlags::TOOSMALL;
        }
        let dspace = self
            .device_size
            .saturating_sub(DEV_BLOCK_SIZE * u64::from(self.num_superblocks));
        if self.data_space != dspace {
            result |= CheckFlags::DATASPACE;
        }
        if self.data_start >= dspace {
            result |= CheckFlags::DATASTART;
        }
        if self.data_length > dspace {
            result |= CheckFlags::DATALENGTH;
        }
        if self.max_length < self.data_length || self.max_length > dspace {
            result |= CheckFlags::MAXLENGTH;
        }
        if self.alignment < 8
            || self.alignment % 8 != 0
            || u64::from(self.alignment) > DEV_BLOCK_SIZE
        {
            result |= CheckFlags::ALIGNMENT;
        }
        let last = self.num_superblocks.saturating_sub(1);
        if self.num_superblocks == 0
            || superblock_location(last) * DEV_BLOCK_SIZE + SB_SIZE as u64 >= self.device_size
        {
            result |= CheckFlags::LASTSB;
        }
        result
    }

    /// Byte offset of this superblock's canonical copy.
    #[must_use]
    pub fn canonical_offset(&self) -> u64 {
        superblock_offset(self.this_superblock)
    }
}

/// Bitmask of superblock defects; see [`Superblock::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckFlags(pub u32);

impl CheckFlags {
    pub const OK: Self = Self(0);
    /// VALID bit missing.
    pub const NOVALID: Self = Self(0x0001);
    /// I/O error prevented some checks.
    pub const IOERR: Self = Self(0x0002);
    /// `device_size` larger than the physical device.
    pub const TOOBIG: Self = Self(0x0004);
    /// Device below the minimum size, or fewer than nine superblocks.
    pub const TOOSMALL: Self = Self(0x0008);
    /// `device_size` not a multiple of the device block.
    pub const NONBLOCK: Self = Self(0x0010);
    /// `data_space` inconsistent with `device_size` and the superblock count.
    pub const DATASPACE: Self = Self(0x0020);
    /// `data_start` out of range.
    pub const DATASTART: Self = Self(0x0040);
    /// `data_length` out of range.
    pub const DATALENGTH: Self = Self(0x0080);
    /// `max_length` out of range.
    pub const MAXLENGTH: Self = Self(0x0100);
    /// Alignment not a multiple of 8 in 8..=4096.
    pub const ALIGNMENT: Self = Self(0x0200);
    /// The last superblock would sit past the end of the device.
    pub const LASTSB: Self = Self(0x0400);
    /// Unknown flag bits set.
    pub const FLAGS: Self = Self(0x0800);

    /// Defects a repair tool can correct in place.
    pub const FIXABLE: Self = Self(
        Self::NOVALID.0
            | Self::DATASPACE.0
            | Self::MAXLENGTH.0
            | Self::ALIGNMENT.0
            | Self::LASTSB.0
            | Self::FLAGS.0,
    );

    /// Defects tolerated at mount. The quadratic layout puts superblock 8
    /// at block 1,056, so enforcing the nine-superblock floor would make
    /// every device under ~4.3 MiB unmountable; the small-device floor is
    /// reported but does not stop the engine.
    pub const ADVISORY: Self = Self(Self::TOOSMALL.0);

    #[must_use]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn is_fixable(self) -> bool {
        self.0 & !Self::FIXABLE.0 == 0
    }

    /// True when nothing beyond advisory findings was detected.
    #[must_use]
    pub fn is_mountable(self) -> bool {
        self.0 & !Self::ADVISORY.0 == 0
    }
}

impl std::ops::BitOr for CheckFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CheckFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CheckFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "ok");
        }
        const NAMES: [(CheckFlags, &str); 12] = [
            (CheckFlags::NOVALID, "novalid"),
            (CheckFlags::IOERR, "ioerr"),
            (CheckFlags::TOOBIG, "toobig"),
            (CheckFlags::TOOSMALL, "toosmall"),
            (CheckFlags::NONBLOCK, "nonblock"),
            (CheckFlags::DATASPACE, "dataspace"),
            (CheckFlags::DATASTART, "datastart"),
            (CheckFlags::DATALENGTH, "datalength"),
            (CheckFlags::MAXLENGTH, "maxlength"),
            (CheckFlags::ALIGNMENT, "alignment"),
            (CheckFlags::LASTSB, "lastsb"),
            (CheckFlags::FLAGS, "flags"),
        ];
        let mut sep = "";
        for (flag, name) in NAMES {
            if self.contains(flag) {
                write!(f, "{sep}{name}")?;
                sep = ", ";
            }
        }
        Ok(())
    }
}

/// Consistent superblock for a freshly formatted device.
#[must_use]
pub fn initial_superblock(device_size: u64, num_superblocks: u32, alignment: u32) -> Superblock {
    Superblock {
        device_size,
        data_space: device_size - DEV_BLOCK_SIZE * u64::from(num_superblocks),
        data_start: 0,
        data_length: 0,
        max_length: 0,
        version: 0,
        flags: SB_VALID,
        alignment,
        num_superblocks,
        this_superblock: 0,
        new_size: 0,
        new_alignment: 0,
        new_superblocks: 0,
    }
}

const _: () = assert!(OFF_CHECKSUM + 4 == SB_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        // Smallest fully consistent geometry: 21 blocks, two superblocks.
        Superblock {
            device_size: 21 * DEV_BLOCK_SIZE,
            data_space: 19 * DEV_BLOCK_SIZE,
            data_start: 100,
            data_length: 2048,
            max_length: 4096,
            version: 7,
            flags: SB_VALID | SB_DIRTY,
            alignment: 8,
            num_superblocks: 2,
            this_superblock: 0,
            new_size: 0,
            new_alignment: 0,
            new_superblocks: 0,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let sb = sample();
        let bytes = sb.encode(1);
        let decoded = Superblock::decode(&bytes).expect("decode");
        let mut expected = sb;
        expected.this_superblock = 1;
        assert_eq!(decoded, expected);
    }

    #[test]
    fn decode_rejects_corrupt_checksum() {
        let mut bytes = sample().encode(0);
        bytes[100] ^= 0xFF;
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample().encode(0);
        bytes[0] = b'X';
        // The CRC covers the magic, so recompute it to isolate the magic check.
        let crc = shall_crc(&bytes[..OFF_CHECKSUM]);
        bytes[OFF_CHECKSUM..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(ParseError::InvalidMagic { offset: 0 })
        ));
    }

    #[test]
    fn checksum_covers_first_1020_bytes() {
        let bytes = sample().encode(3);
        let stored = u32::from_le_bytes([bytes[1020], bytes[1021], bytes[1022], bytes[1023]]);
        assert_eq!(stored, shall_crc(&bytes[..1020]));
    }

    #[test]
    fn check_accepts_consistent_geometry() {
        let sb = sample();
        let flags = sb.check(Some(sb.device_size));
        // Two superblocks is below the nine-superblock floor, which is
        // advisory; nothing structural may be flagged.
        assert_eq!(flags, CheckFlags::TOOSMALL);
        assert!(flags.is_mountable());
    }

    #[test]
    fn check_flags_each_defect_independently() {
        let mut sb = sample();
        sb.flags = SB_DIRTY | 0x80;
        sb.data_space += 1;
        sb.alignment = 12;
        let flags = sb.check(Some(sb.device_size));
        assert!(flags.contains(CheckFlags::NOVALID));
        assert!(flags.contains(CheckFlags::FLAGS));
        assert!(flags.contains(CheckFlags::DATASPACE));
        assert!(flags.contains(CheckFlags::ALIGNMENT));
        assert!(!flags.contains(CheckFlags::TOOBIG));
        assert!(!flags.is_mountable());
        // All of these are in the fixable set.
        assert!(CheckFlags(flags.0 & !CheckFlags::TOOSMALL.0).is_fixable());
    }

    #[test]
    fn check_flags_device_larger_than_physical() {
        let sb = sample();
        assert!(
            sb.check(Some(sb.device_size - DEV_BLOCK_SIZE))
                .contains(CheckFlags::TOOBIG)
        );
        assert!(sb.check(None).contains(CheckFlags::IOERR));
    }

    #[test]
    fn check_flags_last_superblock_past_end_of_device() {
        let mut sb = sample();
        sb.num_superblocks = 3;
        sb.data_space = sb.device_size - 3 * DEV_BLOCK_SIZE;
        // L(2) = 72 blocks, far past the 21-block device.
        assert!(
            sb.check(Some(sb.device_size))
                .contains(CheckFlags::LASTSB)
        );
    }

    #[test]
    fn check_flags_cursor_ranges() {
        let mut sb = sample();
        sb.data_start = sb.data_space;
        sb.data_length = sb.data_space + 1;
        sb.max_length = 0;
        let flags = sb.check(Some(sb.device_size));
        assert!(flags.contains(CheckFlags::DATASTART));
        assert!(flags.contains(CheckFlags::DATALENGTH));
        assert!(flags.contains(CheckFlags::MAXLENGTH));
    }

    #[test]
    fn display_lists_defect_names() {
        let flags = CheckFlags::NOVALID | CheckFlags::ALIGNMENT;
        assert_eq!(flags.to_string(), "novalid, alignment");
        assert_eq!(CheckFlags::OK.to_string(), "ok");
    }

    #[test]
    fn initial_superblock_is_structurally_clean() {
        let sb = initial_superblock(21 * DEV_BLOCK_SIZE, 2, 8);
        assert!(sb.check(Some(sb.device_size)).is_mountable());
        assert_eq!(sb.data_space, 19 * DEV_BLOCK_SIZE);
        assert_eq!(sb.flags, SB_VALID);
    }
}
