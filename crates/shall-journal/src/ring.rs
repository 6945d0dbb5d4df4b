//! Ring buffer addressing.
//!
//! The data space is logically contiguous but physically interleaved with
//! superblock blocks at `L(n) = 16n² + 4n`. This module owns the mapping
//! from a logical offset to a physical `(block, offset)` pair and the
//! pointer advance that skips superblocks and wraps at device end. Nothing
//! else in the engine knows the ring topology.

use shall_types::{DEV_BLOCK_SIZE, superblock_location};

/// Physical position in the ring: device block, offset within it, the
/// block holding the next superblock ahead of this position, and how many
/// superblocks precede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevPtr {
    pub block: u64,
    pub offset: u32,
    pub next_super: u64,
    pub n_super: u32,
}

impl DevPtr {
    /// Byte offset of this position on the device.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        self.block * DEV_BLOCK_SIZE + u64::from(self.offset)
    }

    /// Advance by one device block, skipping the next superblock block and
    /// wrapping to block 1 at device end. `max` is the sentinel from
    /// [`max_ptr`].
    pub fn advance_block(&mut self, max: &DevPtr) {
        self.block += 1;
        if self.block >= max.block {
            self.block = 1;
            self.n_super = 1;
        }
        if self.n_super < max.n_super && self.block == self.next_super {
            self.block += 1;
            self.n_super += 1;
            if self.block >= max.block {
                self.block = 1;
                self.n_super = 1;
            }
        }
        self.next_super = if self.n_super < max.n_super {
            superblock_location(self.n_super)
        } else {
            0
        };
    }
}

/// Sentinel carrying the wrap threshold (total device blocks) and the
/// superblock count; cached once per mount.
#[must_use]
pub fn max_ptr(device_size: u64, num_superblocks: u32) -> DevPtr {
    DevPtr {
        block: device_size / DEV_BLOCK_SIZE,
        offset: DEV_BLOCK_SIZE as u32,
        next_super: 0,
        n_super: num_superblocks,
    }
}

/// Map a logical data offset `p ∈ [0, data_space)` to its physical
/// position, walking the quadratic superblock spacing.
///
/// This does not need to be fast: it runs twice per mount.
#[must_use]
pub fn locate(p: u64, num_superblocks: u32) -> DevPtr {
    let mut remain = p / DEV_BLOCK_SIZE;
    let mut prev = 0_u64;
    let mut result = 1_u64;
    let mut nsb = 1_u32;
    let offset = (p % DEV_BLOCK_SIZE) as u32;
    while nsb < num_superblocks && remain > 0 {
        let this = superblock_location(nsb);
        let diff = this - prev - 1;
        // There are `diff` data blocks between this superblock and the
        // previous one; if remain fits, this is the interval we need.
        if remain < diff {
            break;
        }
        remain -= diff;
        prev = this;
        result += diff + 1;
        nsb += 1;
    }
    DevPtr {
        block: result + remain,
        offset,
        next_super: if nsb < num_superblocks {
            superblock_location(nsb)
        } else {
            0
        },
        n_super: nsb,
    }
}
