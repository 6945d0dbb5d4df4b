#![forbid(unsafe_code)]
//! Offline check and repair (fsck) for shallfs journal devices.
//!
//! Two passes: pass 1 brings every superblock copy to a consistent
//! `VALID,!DIRTY` image, fixing the fixable defects; pass 2 optionally
//! streams the whole data region, verifying record checksums and blanking
//! corrupt stretches with a synthetic overflow-class marker.

pub mod offline;

use offline::OfflineReader;
use shall_block::ByteDevice;
use shall_error::{Result, ShallError};
use shall_journal::sbio;
use shall_ondisk::record::{OpCode, Payload, RECORD_HEADER_SIZE, RecordSpec, Timestamp};
use shall_ondisk::superblock::{SB_DIRTY, SB_KNOWN_FLAGS, SB_UPDATE, SB_VALID};
use shall_ondisk::{CheckFlags, Superblock, encode_record, parse_header};
use shall_types::{DEV_BLOCK_SIZE, SB_SIZE, align_up, superblock_offset};
use serde::Serialize;
use tracing::{info, warn};

/// fsck exit-code bits.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CORRECTED: i32 = 1;
    pub const NEED_REBOOT: i32 = 2;
    pub const UNCORRECTED: i32 = 4;
    pub const OPERATIONAL: i32 = 8;
    pub const USAGE: i32 = 16;
    pub const CANCELLED: i32 = 32;
}

/// How far fsck may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Report only, change nothing (`-n`).
    Check,
    /// Automatically repair simple problems, skip the data pass (`-p`).
    Preen,
    /// Full repair; blanking corrupt records additionally requires
    /// `assume_yes` (`-y`), the non-interactive stand-in for asking.
    Repair { assume_yes: bool },
}

impl RepairMode {
    fn may_write(self) -> bool {
        !matches!(self, Self::Check)
    }
}

/// fsck options.
#[derive(Debug, Clone, Copy)]
pub struct FsckOptions {
    pub mode: RepairMode,
    /// Check even when superblock 0 is valid and clean.
    pub force: bool,
    /// Start from this superblock instead of searching.
    pub use_superblock: Option<u32>,
}

impl Default for FsckOptions {
    fn default() -> Self {
        Self {
            mode: RepairMode::Repair { assume_yes: false },
            force: false,
            use_superblock: None,
        }
    }
}

/// Outcome of an fsck run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FsckReport {
    /// Superblock copies rewritten in pass 1.
    pub superblocks_corrected: u32,
    /// Superblock copies that could not be fixed.
    pub superblocks_uncorrected: Vec<u32>,
    /// Advisory findings (geometry below the nine-superblock floor).
    pub advisory: Vec<String>,
    /// Whole records that validated in pass 2.
    pub records_valid: u64,
    /// Corrupt stretches replaced by synthetic markers.
    pub records_blanked: u64,
    /// Corrupt stretches found but left in place.
    pub records_unrepaired: u64,
    /// The journal was truncated at an unrecoverable position.
    pub truncated: bool,
    /// An interrupted geometry update blocks any repair.
    pub update_pending: bool,
    pub data_length: u64,
    pub data_space: u64,
}

impl FsckReport {
    /// Fold the findings into the conventional fsck exit bitmask.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let mut code = exit_code::OK;
        if self.update_pending {
            code |= exit_code::OPERATIONAL;
        }
        if self.superblocks_corrected > 0 || self.records_blanked > 0 || self.truncated {
            code |= exit_code::CORRECTED;
        }
        if !self.superblocks_uncorrected.is_empty() || self.records_unrepaired > 0 {
            code |= exit_code::UNCORRECTED;
        }
        code
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.exit_code() == exit_code::OK
    }
}

/// Correct the fixable defects in a decoded superblock, in place.
pub fn fix_superblock(sb: &mut Superblock, defects: CheckFlags) -> Vec<&'static str> {
    let mut fixed = Vec::new();
    if defects.contains(CheckFlags::FLAGS) {
        sb.flags &= SB_KNOWN_FLAGS;
        fixed.push("flags");
    }
    if defects.contains(CheckFlags::NOVALID) {
        sb.flags |= SB_VALID;
        fixed.push("novalid");
    }
    if defects.contains(CheckFlags::LASTSB) {
        sb.num_superblocks = 0;
        while superblock_offset(sb.num_superblocks) + SB_SIZE as u64 <= sb.device_size {
            sb.num_superblocks += 1;
        }
        fixed.push("lastsb");
    }
    if defects.contains(CheckFlags::DATASPACE) {
        sb.data_space = sb
            .device_size
            .saturating_sub(DEV_BLOCK_SIZE * u64::from(sb.num_superblocks));
        fixed.push("dataspace");
    }
    if defects.contains(CheckFlags::MAXLENGTH) {
        sb.max_length = sb.data_length;
        fixed.push("maxlength");
    }
    if defects.contains(CheckFlags::ALIGNMENT) {
        let mut alignment = sb.alignment / 8;
        if alignment < 1 {
            alignment = 1;
        }
        alignment *= 8;
        if u64::from(alignment) > DEV_BLOCK_SIZE {
            alignment = DEV_BLOCK_SIZE as u32;
        }
        sb.alignment = alignment;
        fixed.push("alignment");
    }
    fixed
}

/// Open a device for repair: superblock 0, alternates, fixable rescue,
/// best-version scan when dirty. The flag is true when the superblock had
/// to be rescued from a partially valid copy.
fn open_for_repair(
    dev: &dyn ByteDevice,
    options: &FsckOptions,
    report: &mut FsckReport,
) -> Result<(Superblock, bool)> {
    if let Some(n) = options.use_superblock {
        let (sb, flags) = sbio::read_superblock(dev, n)?;
        if !flags.is_mountable() {
            return Err(ShallError::Invalid(shall_types::ParseError::InvalidField {
                field: "superblock",
                reason: "requested copy fails consistency checks",
            }));
        }
        return Ok((sb, false));
    }

    let mut rescued = None;
    let mut n = 0_u32;
    let found = loop {
        if superblock_offset(n) + SB_SIZE as u64 > dev.len_bytes() {
            break None;
        }
        match sbio::read_superblock_raw(dev, n) {
            Ok(sb) => {
                let defects = sb.check(Some(dev.len_bytes()));
                if defects.is_mountable() {
                    if !defects.is_ok() {
                        report
                            .advisory
                            .push(format!("superblock {n}: {defects}"));
                    }
                    break Some(sb);
                }
                if rescued.is_none() && CheckFlags(defects.0 & !CheckFlags::ADVISORY.0).is_fixable()
                {
                    let mut candidate = sb;
                    let fixed = fix_superblock(&mut candidate, defects);
                    info!(
                        target: "shall::fsck",
                        n,
                        fixed = ?fixed,
                        "rescued partially valid superblock"
                    );
                    rescued = Some(candidate);
                }
            }
            Err(_) => {}
        }
        n += 1;
    };

    let was_rescued = found.is_none() && rescued.is_some();
    let sb = match found.or(rescued) {
        Some(sb) => sb,
        None => {
            return Err(ShallError::NotMounted(
                "no usable superblock found on device".into(),
            ));
        }
    };
    if sb.flags & SB_DIRTY != 0 {
        // Take the greatest version over every copy that decodes.
        let mut best = sb;
        for n in 0..best.num_superblocks {
            if let Ok((other, flags)) = sbio::read_superblock(dev, n) {
                if flags.is_mountable() && other.version > best.version {
                    best = other;
                }
            }
        }
        return Ok((best, was_rescued));
    }
    Ok((sb, was_rescued))
}

/// Pass 1: compare every superblock copy against the selected image and
/// rewrite a consistent `VALID,!DIRTY` version everywhere.
fn pass1_superblocks(
    dev: &dyn ByteDevice,
    target: &Superblock,
    mode: RepairMode,
    report: &mut FsckReport,
) {
    info!(target: "shall::fsck", "pass 1: scan superblocks");
    for n in 0..target.num_superblocks {
        let ok = match sbio::read_superblock(dev, n) {
            Ok((sb, flags)) => {
                flags.is_mountable() && sb_matches(&sb, target) && sb.flags == target.flags
            }
            Err(_) => false,
        };
        if ok {
            continue;
        }
        if mode.may_write() && sbio::write_superblock(dev, target, n, false).is_ok() {
            report.superblocks_corrected += 1;
        } else {
            report.superblocks_uncorrected.push(n);
        }
    }
    if mode.may_write() {
        let _ = dev.sync();
    }
}

fn sb_matches(a: &Superblock, b: &Superblock) -> bool {
    a.device_size == b.device_size
        && a.data_space == b.data_space
        && a.data_start == b.data_start
        && a.data_length == b.data_length
        && a.max_length == b.max_length
        && a.version == b.version
        && a.alignment == b.alignment
        && a.num_superblocks == b.num_superblocks
}

/// Pass 2: stream the data region validating record headers; corrupt
/// stretches are blanked with a synthetic OVERFLOW-class marker when the
/// mode allows it.
fn pass2_records(
    dev: &dyn ByteDevice,
    sb: &Superblock,
    mode: RepairMode,
    report: &mut FsckReport,
) -> Result<()> {
    info!(target: "shall::fsck", "pass 2: scan data for validity");
    let alignment = sb.alignment;
    let mut cursor = OfflineReader::new(sb);
    let mut header = [0_u8; RECORD_HEADER_SIZE];

    while cursor.data_length >= RECORD_HEADER_SIZE as u64 {
        let got = cursor.peek(dev, &mut header)?;
        debug_assert_eq!(got, RECORD_HEADER_SIZE);
        match parse_header(&header) {
            Ok(parsed) if u64::from(parsed.next_header) <= cursor.data_length => {
                report.records_valid += 1;
                cursor.advance(u64::from(parsed.next_header));
            }
            _ => {
                let gap = find_next_valid_header(dev, &cursor, alignment)?;
                warn!(
                    target: "shall::fsck",
                    position = cursor.data_start,
                    gap,
                    "corrupt record"
                );
                match gap {
                    Some(gap) => {
                        if blank_allowed(mode) {
                            blank_stretch(dev, &cursor, gap, alignment)?;
                            report.records_blanked += 1;
                        } else {
                            report.records_unrepaired += 1;
                        }
                        cursor.advance(gap);
                    }
                    None => {
                        // No valid record follows; everything from here is
                        // garbage and the journal ends at this point.
                        if blank_allowed(mode) {
                            report.truncated = true;
                        } else {
                            report.records_unrepaired += 1;
                        }
                        break;
                    }
                }
            }
        }
    }
    // A tail shorter than a header is structural garbage as well.
    if cursor.data_length > 0 && cursor.data_length < RECORD_HEADER_SIZE as u64 {
        report.truncated = blank_allowed(mode) || report.truncated;
    }
    Ok(())
}

fn blank_allowed(mode: RepairMode) -> bool {
    matches!(mode, RepairMode::Repair { assume_yes: true })
}

/// Scan forward from a corrupt position for the next valid header at an
/// alignment boundary; returns the gap size, which always has room for a
/// bare marker header.
fn find_next_valid_header(
    dev: &dyn ByteDevice,
    cursor: &OfflineReader,
    alignment: u32,
) -> Result<Option<u64>> {
    let step = u64::from(alignment);
    let mut probe = cursor.clone();
    let mut gap = 0_u64;
    let mut header = [0_u8; RECORD_HEADER_SIZE];
    loop {
        let hop = step.min(probe.data_length);
        if hop == 0 {
            return Ok(None);
        }
        probe.advance(hop);
        gap += hop;
        if gap < RECORD_HEADER_SIZE as u64 {
            // Too narrow to hold the marker; keep looking.
            continue;
        }
        if probe.data_length < RECORD_HEADER_SIZE as u64 {
            return Ok(None);
        }
        probe.peek(dev, &mut header)?;
        if let Ok(parsed) = parse_header(&header) {
            if u64::from(parsed.next_header) <= probe.data_length {
                return Ok(Some(gap));
            }
        }
    }
}

/// Overwrite a corrupt stretch with one synthetic OVERFLOW-class marker
/// spanning it, zero-padded.
fn blank_stretch(
    dev: &dyn ByteDevice,
    cursor: &OfflineReader,
    gap: u64,
    alignment: u32,
) -> Result<()> {
    let spec = RecordSpec {
        operation: OpCode::Overflow.after(),
        result: 0,
        timestamp: Timestamp::now(),
        creds: None,
        file1: None,
        file2: None,
        payload: &Payload::None,
    };
    let mut marker = encode_record(&spec, alignment).map_err(ShallError::Invalid)?;
    debug_assert_eq!(marker.len(), align_up(RECORD_HEADER_SIZE, alignment));
    // Stretch the marker over the whole gap.
    let gap = usize::try_from(gap).map_err(|_| ShallError::Format("gap overflows usize".into()))?;
    marker[0..4].copy_from_slice(&(gap as u32).to_le_bytes());
    let crc = shall_types::shall_crc(&marker[..28]);
    marker[28..32].copy_from_slice(&crc.to_le_bytes());
    marker.resize(gap, 0);
    cursor.overwrite(dev, &marker)
}

/// Run fsck over a device.
pub fn run_fsck(dev: &dyn ByteDevice, options: &FsckOptions) -> Result<FsckReport> {
    let mut report = FsckReport::default();
    let (sb, rescued) = open_for_repair(dev, options, &mut report)?;
    report.data_length = sb.data_length;
    report.data_space = sb.data_space;

    if sb.flags & SB_UPDATE != 0 {
        // The resize tool owns the device; direct the operator there.
        report.update_pending = true;
        if sb.this_superblock != 0 || sb.flags & SB_DIRTY != 0 {
            report.superblocks_uncorrected.push(sb.this_superblock);
        }
        return Ok(report);
    }

    // A clean first superblock means there is nothing to do unless the
    // selection had to rescue it or the caller forces a check.
    if sb.this_superblock == 0 && sb.flags & SB_DIRTY == 0 && !rescued && !options.force {
        return Ok(report);
    }

    let mut target = sb.clone();
    target.flags &= !SB_DIRTY;
    target.flags |= SB_VALID;
    pass1_superblocks(dev, &target, options.mode, &mut report);

    let full_scan = !matches!(options.mode, RepairMode::Preen);
    if full_scan && report.superblocks_uncorrected.is_empty() {
        pass2_records(dev, &target, options.mode, &mut report)?;
        if report.truncated && blank_allowed(options.mode) {
            // Shrink the journal to the last valid record and republish.
            let mut truncated = target.clone();
            truncated.data_length = valid_prefix_bytes(dev, &target)?;
            pass1_superblocks(dev, &truncated, options.mode, &mut report);
        }
    }

    info!(
        target: "shall::fsck",
        corrected = report.superblocks_corrected,
        uncorrected = report.superblocks_uncorrected.len(),
        records_valid = report.records_valid,
        records_blanked = report.records_blanked,
        exit = report.exit_code(),
        "fsck_complete"
    );
    Ok(report)
}

/// Length of the valid record prefix, used when truncating the journal.
fn valid_prefix_bytes(dev: &dyn ByteDevice, sb: &Superblock) -> Result<u64> {
    let mut cursor = OfflineReader::new(sb);
    let mut header = [0_u8; RECORD_HEADER_SIZE];
    let mut total = 0_u64;
    while cursor.data_length >= RECORD_HEADER_SIZE as u64 {
        if cursor.peek(dev, &mut header)? < RECORD_HEADER_SIZE {
            break;
        }
        let Ok(parsed) = parse_header(&header) else {
            break;
        };
        let len = u64::from(parsed.next_header);
        if len > cursor.data_length {
            break;
        }
        total += len;
        cursor.advance(len);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shall_block::MemByteDevice;
    use shall_journal::sbio::{FormatParams, format_device};
    use shall_journal::{Interrupt, Journal, MountOptions};
    use shall_ondisk::record::OpCode;
    use shall_types::ByteOffset;
    use std::sync::Arc;

    fn dirty_device_with_records(records: u32) -> Arc<MemByteDevice> {
        let dev = Arc::new(MemByteDevice::new(1 << 20).expect("mem device"));
        format_device(&*dev, FormatParams::default()).expect("format");
        let intr = Interrupt::new();
        let journal = Journal::open(dev.clone(), MountOptions::default()).expect("open");
        for seq in 0..records {
            journal
                .log_name(&intr, OpCode::Create.after(), format!("n{seq}").as_bytes(), 0)
                .expect("append");
        }
        journal.commit(&intr).expect("commit");
        // Drop without unmount: the device stays dirty.
        drop(journal);
        dev
    }

    #[test]
    fn clean_device_needs_no_repair() {
        let dev = MemByteDevice::new(1 << 20).expect("mem device");
        format_device(&dev, FormatParams::default()).expect("format");
        let report = run_fsck(&dev, &FsckOptions::default()).expect("fsck");
        assert!(report.is_clean());
        assert_eq!(report.exit_code(), exit_code::OK);
    }

    #[test]
    fn dirty_device_is_cleaned() {
        let dev = dirty_device_with_records(20);
        let report = run_fsck(
            &*dev,
            &FsckOptions {
                mode: RepairMode::Repair { assume_yes: true },
                ..FsckOptions::default()
            },
        )
        .expect("fsck");
        assert!(report.superblocks_corrected > 0);
        assert_eq!(report.records_valid, 20);
        assert_eq!(report.records_blanked, 0);
        assert_eq!(report.exit_code(), exit_code::CORRECTED);

        // All superblocks are now clean and identical.
        for n in 0..4 {
            let (sb, flags) = sbio::read_superblock(&*dev, n).expect("read");
            assert!(flags.is_mountable());
            assert_eq!(sb.flags & SB_DIRTY, 0);
        }
        // And fsck has nothing left to do.
        let again = run_fsck(&*dev, &FsckOptions::default()).expect("fsck again");
        assert!(again.is_clean());
    }

    #[test]
    fn check_mode_reports_without_writing() {
        let dev = dirty_device_with_records(5);
        let before = dev.snapshot();
        let report = run_fsck(
            &*dev,
            &FsckOptions {
                mode: RepairMode::Check,
                ..FsckOptions::default()
            },
        )
        .expect("fsck");
        assert!(!report.superblocks_uncorrected.is_empty());
        assert_eq!(report.exit_code() & exit_code::UNCORRECTED, exit_code::UNCORRECTED);
        assert_eq!(dev.snapshot(), before, "check mode must not write");
    }

    #[test]
    fn corrupt_record_is_blanked_with_a_marker() {
        let dev = dirty_device_with_records(10);
        // Records are 88 bytes (32+48+4+2..4, aligned); flip a byte in the
        // middle of the stream. Record 5 of a fresh device starts at
        // block 1 + 5*88 bytes.
        let sb = sbio::select_superblock(&*dev).expect("select");
        let record_len = sb.data_length / 10;
        dev.write_all_at(
            ByteOffset(DEV_BLOCK_SIZE + 5 * record_len + 4),
            &[0x5A; 2],
        )
        .expect("corrupt");

        let report = run_fsck(
            &*dev,
            &FsckOptions {
                mode: RepairMode::Repair { assume_yes: true },
                force: true,
                ..FsckOptions::default()
            },
        )
        .expect("fsck");
        assert_eq!(report.records_blanked, 1);
        assert_eq!(report.records_valid, 9);
        assert!(report.exit_code() & exit_code::CORRECTED != 0);

        // The stream now parses end to end, with one OVERFLOW marker where
        // the corrupt record used to be.
        let sb = sbio::select_superblock(&*dev).expect("select");
        let mut cursor = OfflineReader::new(&sb);
        let mut buf = vec![0_u8; 8192];
        let mut overflow_markers = 0;
        loop {
            let n = cursor.read_records(&*dev, &mut buf).expect("read");
            if n == 0 {
                break;
            }
            let mut offset = 0;
            while offset < n {
                let record = shall_ondisk::parse_record(&buf[offset..]).expect("parse");
                if record.header.op() == Some(OpCode::Overflow) {
                    overflow_markers += 1;
                }
                offset += record.header.next_header as usize;
            }
        }
        assert_eq!(overflow_markers, 1);
    }

    #[test]
    fn without_assume_yes_corruption_is_left_in_place() {
        let dev = dirty_device_with_records(10);
        let sb = sbio::select_superblock(&*dev).expect("select");
        let record_len = sb.data_length / 10;
        dev.write_all_at(ByteOffset(DEV_BLOCK_SIZE + 3 * record_len), &[0xEE; 8])
            .expect("corrupt");

        let report = run_fsck(
            &*dev,
            &FsckOptions {
                mode: RepairMode::Repair { assume_yes: false },
                force: true,
                ..FsckOptions::default()
            },
        )
        .expect("fsck");
        assert_eq!(report.records_blanked, 0);
        assert_eq!(report.records_unrepaired, 1);
        assert!(report.exit_code() & exit_code::UNCORRECTED != 0);
    }

    #[test]
    fn interrupted_update_is_operational_error() {
        let dev = MemByteDevice::new(1 << 20).expect("mem device");
        let mut sb = format_device(&dev, FormatParams::default()).expect("format");
        sb.flags |= SB_UPDATE;
        sbio::write_superblock(&dev, &sb, 0, false).expect("write");
        let report = run_fsck(&dev, &FsckOptions::default()).expect("fsck");
        assert!(report.update_pending);
        assert!(report.exit_code() & exit_code::OPERATIONAL != 0);
    }

    #[test]
    fn fixable_defects_are_repaired_in_rescue() {
        let dev = MemByteDevice::new(1 << 20).expect("mem device");
        let mut sb = format_device(&dev, FormatParams::default()).expect("format");
        // Break every copy with a fixable defect: wrong max_length and a
        // stray flag bit.
        sb.max_length = sb.data_space + 999;
        sb.flags |= 0x40;
        for n in 0..sb.num_superblocks {
            sbio::write_superblock(&dev, &sb, n, false).expect("write");
        }
        let report = run_fsck(
            &dev,
            &FsckOptions {
                mode: RepairMode::Repair { assume_yes: true },
                ..FsckOptions::default()
            },
        )
        .expect("fsck");
        assert!(report.superblocks_corrected >= 1);
        let (fixed, flags) = sbio::read_superblock(&dev, 0).expect("read");
        assert!(flags.is_mountable());
        assert_eq!(fixed.flags & !SB_KNOWN_FLAGS, 0);
        assert_eq!(fixed.max_length, fixed.data_length);
    }

    #[test]
    fn fix_superblock_corrects_each_fixable_field() {
        let dev_size = 1 << 20;
        let mut sb = Superblock {
            device_size: dev_size,
            data_space: 0,
            data_start: 0,
            data_length: 100,
            max_length: 0,
            version: 1,
            flags: 0x80,
            alignment: 12,
            num_superblocks: 40,
            this_superblock: 0,
            new_size: 0,
            new_alignment: 0,
            new_superblocks: 0,
        };
        let defects = sb.check(Some(dev_size));
        let fixed = fix_superblock(&mut sb, defects);
        assert!(fixed.contains(&"novalid"));
        assert!(fixed.contains(&"lastsb"));
        assert!(fixed.contains(&"dataspace"));
        assert!(fixed.contains(&"maxlength"));
        assert!(fixed.contains(&"alignment"));
        assert_eq!(sb.num_superblocks, 4);
        assert_eq!(sb.data_space, dev_size - 4 * DEV_BLOCK_SIZE);
        assert_eq!(sb.alignment, 8);
        assert_eq!(sb.max_length, sb.data_length);
        assert!(sb.flags & SB_VALID != 0);
    }
}
