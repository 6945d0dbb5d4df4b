//! Superblock I/O: read, write, mount-time selection, spread updates, and
//! device formatting.

use shall_block::ByteDevice;
use shall_error::{Result, ShallError};
use shall_ondisk::superblock::{SB_UPDATE, SB_VALID};
use shall_ondisk::{CheckFlags, Superblock, initial_superblock};
use shall_types::{
    ByteOffset, DEV_BLOCK_SIZE, MIN_DEVICE_SIZE, ParseError, SB_SIZE, superblock_offset,
};
use tracing::{debug, info, warn};

/// How many superblocks a clean unmount (or format repair) refreshes,
/// spread evenly across the device to maximise crash survivability.
const SPREAD_COPIES: u32 = 7;

/// Read superblock `n`: magics and CRC only.
pub fn read_superblock_raw(dev: &dyn ByteDevice, n: u32) -> Result<Superblock> {
    let offset = superblock_offset(n);
    if offset + SB_SIZE as u64 > dev.len_bytes() {
        return Err(ShallError::Invalid(ParseError::InsufficientData {
            needed: SB_SIZE,
            offset: usize::try_from(offset).unwrap_or(usize::MAX),
            actual: 0,
        }));
    }
    let mut region = [0_u8; SB_SIZE];
    dev.read_exact_at(ByteOffset(offset), &mut region)?;
    Ok(Superblock::decode(&region)?)
}

/// Read superblock `n` with the full consistency check, including that the
/// copy claims its own index.
pub fn read_superblock(dev: &dyn ByteDevice, n: u32) -> Result<(Superblock, CheckFlags)> {
    let sb = read_superblock_raw(dev, n)?;
    if sb.this_superblock != n {
        return Err(ShallError::Invalid(ParseError::InvalidField {
            field: "this_superblock",
            reason: "copy claims a different index",
        }));
    }
    let flags = sb.check(Some(dev.len_bytes()));
    Ok((sb, flags))
}

/// Write superblock `n` at its canonical location, optionally syncing.
pub fn write_superblock(dev: &dyn ByteDevice, sb: &Superblock, n: u32, sync: bool) -> Result<()> {
    let encoded = sb.encode(n);
    dev.write_all_at(ByteOffset(superblock_offset(n)), &encoded)?;
    if sync {
        dev.sync()?;
    }
    debug!(
        target: "shall::sbio",
        n,
        version = sb.version,
        flags = sb.flags,
        sync,
        "superblock_written"
    );
    Ok(())
}

/// Scan forward from superblock 1 for any mountable copy; used when copy 0
/// is damaged. The superblock count is unknown at this point, but no copy
/// can sit past the end of the device.
fn search_superblock(dev: &dyn ByteDevice) -> Result<Superblock> {
    info!(target: "shall::sbio", "searching for an alternative superblock");
    let mut n = 1_u32;
    loop {
        if superblock_offset(n) + SB_SIZE as u64 > dev.len_bytes() {
            return Err(ShallError::NotMounted(
                "no valid superblock found on device".into(),
            ));
        }
        if let Ok((sb, flags)) = read_superblock(dev, n) {
            if flags.is_mountable() {
                return Ok(sb);
            }
        }
        n += 1;
    }
}

/// Read all copies and keep the one with the greatest version.
fn scan_all_superblocks(dev: &dyn ByteDevice, mut best: Superblock) -> Superblock {
    for n in 0..best.num_superblocks {
        let Ok((sb, flags)) = read_superblock(dev, n) else {
            continue;
        };
        if flags.is_mountable() && sb.version > best.version {
            best = sb;
        }
    }
    best
}

/// Mount-time superblock selection.
///
/// Copy 0 is used when clean; an interrupted geometry update refuses the
/// mount; a dirty device is recovered by taking the greatest version over
/// all copies. Defects beyond the advisory small-device floor disqualify a
/// copy.
pub fn select_superblock(dev: &dyn ByteDevice) -> Result<Superblock> {
    let sb = match read_superblock(dev, 0) {
        Ok((sb, flags)) if flags.is_mountable() => {
            if !flags.is_ok() {
                warn!(
                    target: "shall::sbio",
                    defects = %flags,
                    "superblock 0 is usable but below the nine-superblock floor"
                );
            }
            sb
        }
        _ => search_superblock(dev)?,
    };
    if sb.flags & SB_UPDATE != 0 {
        // The offline resize owns the device until its update plan is done.
        return Err(ShallError::Busy);
    }
    if sb.flags & shall_ondisk::superblock::SB_DIRTY != 0 {
        let best = scan_all_superblocks(dev, sb);
        info!(
            target: "shall::sbio",
            version = best.version,
            chosen = best.this_superblock,
            "dirty device, selected best superblock"
        );
        return Ok(best);
    }
    Ok(sb)
}

/// Write ≈7 copies of `sb` spread evenly over `[0, N)`, synced; returns
/// the index the rotation continues from. Used by clean unmount and by
/// mount marking the device dirty.
pub fn write_spread_superblocks(dev: &dyn ByteDevice, sb: &Superblock) -> Result<u32> {
    let total = sb.num_superblocks;
    let copies = SPREAD_COPIES.min(total);
    let step = total / copies;
    let mut which = 0_u32;
    for _ in 0..copies {
        write_superblock(dev, sb, which, true)?;
        which += step;
        if which >= total {
            which -= total;
        }
    }
    Ok(which)
}

/// Formatting parameters; unset fields are derived from the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatParams {
    /// Use only this many leading bytes of the device.
    pub device_size: Option<u64>,
    /// Record alignment; defaults to 8.
    pub alignment: Option<u32>,
    /// Superblock count; defaults to the first `n` whose location is past
    /// the end of the device.
    pub num_superblocks: Option<u32>,
}

/// Default superblock count for a device: superblocks are placed until the
/// next location would fall outside the device.
#[must_use]
pub fn default_superblock_count(device_size: u64) -> u32 {
    let mut n = 0_u32;
    while superblock_offset(n) + SB_SIZE as u64 <= device_size {
        n += 1;
    }
    n
}

/// Format a device: write every superblock of a fresh, empty journal.
/// Returns the superblock image that was written.
pub fn format_device(dev: &dyn ByteDevice, params: FormatParams) -> Result<Superblock> {
    let physical = dev.len_bytes() - dev.len_bytes() % DEV_BLOCK_SIZE;
    let device_size = match params.device_size {
        Some(size) => {
            if size % DEV_BLOCK_SIZE != 0 || size > physical {
                return Err(ShallError::Format(format!(
                    "invalid device size {size} (physical {physical})"
                )));
            }
            size
        }
        None => physical,
    };
    if device_size < MIN_DEVICE_SIZE {
        return Err(ShallError::Format(format!(
            "device too small: {device_size} bytes, need at least {MIN_DEVICE_SIZE}"
        )));
    }
    let alignment = params.alignment.unwrap_or(8);
    if alignment < 8 || alignment % 8 != 0 || u64::from(alignment) > DEV_BLOCK_SIZE {
        return Err(ShallError::Format(format!(
            "invalid alignment {alignment}: must be a multiple of 8 in 8..=4096"
        )));
    }
    let num_superblocks = match params.num_superblocks {
        Some(n) => {
            if n == 0 || superblock_offset(n - 1) + SB_SIZE as u64 > device_size {
                return Err(ShallError::Format(format!(
                    "{n} superblocks do not fit in {device_size} bytes"
                )));
            }
            n
        }
        None => default_superblock_count(device_size),
    };
    if num_superblocks == 0 {
        return Err(ShallError::Format("device too small for a superblock".into()));
    }
    if u64::from(num_superblocks) * DEV_BLOCK_SIZE >= device_size {
        return Err(ShallError::Format(
            "superblocks would leave no data space".into(),
        ));
    }

    let sb = initial_superblock(device_size, num_superblocks, alignment);
    debug_assert!(sb.flags == SB_VALID);
    for n in 0..num_superblocks {
        write_superblock(dev, &sb, n, false)?;
    }
    dev.sync()?;
    info!(
        target: "shall::sbio",
        device_size,
        num_superblocks,
        alignment,
        data_space = sb.data_space,
        "device_formatted"
    );
    Ok(sb)
}
