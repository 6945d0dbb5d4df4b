#![forbid(unsafe_code)]
//! `shallfs`: offline tools for shallfs journal devices. Format a device
//! or image, check and repair it, dump its records, show its geometry.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use shall_block::{ByteDevice, FileByteDevice};
use shall_journal::sbio::{self, FormatParams};
use shall_ondisk::parse_record;
use shall_repair::offline::OfflineReader;
use shall_repair::{FsckOptions, RepairMode, exit_code, run_fsck};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "shallfs", about = "shallfs journal device tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prepare a device (or image file) as a shallfs journal.
    Format {
        /// The block device or image file to initialise.
        device: PathBuf,
        /// Device size to use; accepts k/b/m/g suffixes. Required with
        /// --create, optional otherwise.
        size: Option<String>,
        /// Record alignment, a multiple of 8 up to 4096.
        #[arg(short, long, default_value_t = 8)]
        alignment: u32,
        /// Superblock count; derived from the device size by default.
        #[arg(short = 'b', long)]
        superblocks: Option<u32>,
        /// Create a regular file suitable for loop mounting.
        #[arg(short, long)]
        create: bool,
        /// Show what would be done without writing.
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Silence progress messages.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Check and repair an unmounted journal device.
    Fsck {
        /// The device to check.
        device: PathBuf,
        /// Automatically repair simple problems; suitable for boot.
        #[arg(short = 'p', long)]
        preen: bool,
        /// Report without changing anything.
        #[arg(short = 'n', long)]
        no_write: bool,
        /// Answer yes to every repair question.
        #[arg(short = 'y', long)]
        yes: bool,
        /// Check even when the device looks clean.
        #[arg(short, long)]
        force: bool,
        /// Use this superblock instead of searching.
        #[arg(short = 'l', long)]
        superblock: Option<u32>,
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the records of an unmounted journal device.
    Dump {
        /// The device to read.
        device: PathBuf,
    },
    /// Show the decoded superblock of a device.
    Info {
        /// The device to inspect.
        device: PathBuf,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("shallfs: {error:#}");
            exit_code::OPERATIONAL
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Format {
            device,
            size,
            alignment,
            superblocks,
            create,
            dry_run,
            quiet,
        } => format(
            &device,
            size.as_deref(),
            alignment,
            superblocks,
            create,
            dry_run,
            quiet,
        ),
        Command::Fsck {
            device,
            preen,
            no_write,
            yes,
            force,
            superblock,
            json,
        } => fsck(&device, preen, no_write, yes, force, superblock, json),
        Command::Dump { device } => dump(&device),
        Command::Info { device, json } => info(&device, json),
    }
}

/// Parse a size with an optional unit suffix: k (KiB), b (device blocks),
/// m (MiB), g (GiB).
fn parse_size(text: &str) -> Result<u64> {
    let (digits, factor) = match text.as_bytes().last() {
        Some(b'k') => (&text[..text.len() - 1], 1024),
        Some(b'b') => (&text[..text.len() - 1], shall_types::DEV_BLOCK_SIZE),
        Some(b'm') => (&text[..text.len() - 1], 1 << 20),
        Some(b'g') => (&text[..text.len() - 1], 1 << 30),
        _ => (text, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size \"{text}\""))?;
    Ok(value * factor)
}

#[allow(clippy::fn_params_excessive_bools)]
fn format(
    device: &Path,
    size: Option<&str>,
    alignment: u32,
    superblocks: Option<u32>,
    create: bool,
    dry_run: bool,
    quiet: bool,
) -> Result<i32> {
    let size = size.map(parse_size).transpose()?;
    if create && size.is_none() {
        bail!("--create requires an explicit size");
    }
    if create && dry_run {
        bail!("--create and --dry-run do not mix");
    }

    let dev = if create {
        FileByteDevice::create(device, size.expect("checked above"))
            .with_context(|| format!("cannot create {}", device.display()))?
    } else {
        FileByteDevice::open(device).with_context(|| format!("cannot open {}", device.display()))?
    };
    let params = FormatParams {
        device_size: size,
        alignment: Some(alignment),
        num_superblocks: superblocks,
    };

    if dry_run {
        let device_size = size.unwrap_or(dev.len_bytes() - dev.len_bytes() % shall_types::DEV_BLOCK_SIZE);
        let count = superblocks.unwrap_or_else(|| sbio::default_superblock_count(device_size));
        println!(
            "{}: would format {device_size} bytes with {count} superblocks, alignment {alignment}",
            device.display()
        );
        return Ok(exit_code::OK);
    }

    let sb = sbio::format_device(&dev, params)
        .with_context(|| format!("formatting {}", device.display()))?;
    if !quiet {
        println!(
            "{}: device size {} bytes, journal size {} bytes, {} superblocks, alignment {}",
            device.display(),
            sb.device_size,
            sb.data_space,
            sb.num_superblocks,
            sb.alignment
        );
        println!("{}: device set up successfully", device.display());
    }
    Ok(exit_code::OK)
}

#[allow(clippy::fn_params_excessive_bools)]
fn fsck(
    device: &Path,
    preen: bool,
    no_write: bool,
    yes: bool,
    force: bool,
    superblock: Option<u32>,
    json: bool,
) -> Result<i32> {
    if preen && (no_write || yes || force) {
        eprintln!("shallfs: --preen does not mix with -n, -y or -f");
        return Ok(exit_code::USAGE);
    }
    if no_write && yes {
        eprintln!("shallfs: -n and -y contradict each other");
        return Ok(exit_code::USAGE);
    }
    let mode = if no_write {
        RepairMode::Check
    } else if preen {
        RepairMode::Preen
    } else {
        RepairMode::Repair { assume_yes: yes }
    };

    let dev =
        FileByteDevice::open(device).with_context(|| format!("cannot open {}", device.display()))?;
    let report = run_fsck(
        &dev,
        &FsckOptions {
            mode,
            force,
            use_superblock: superblock,
        },
    )
    .with_context(|| format!("checking {}", device.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if report.update_pending {
            eprintln!(
                "{}: an update was interrupted, please complete it",
                device.display()
            );
        }
        let status = if report.is_clean() {
            "clean"
        } else if report.exit_code() & exit_code::UNCORRECTED != 0 {
            "has errors"
        } else {
            "cleaned"
        };
        println!(
            "{}: {status}, {}/{} bytes used",
            device.display(),
            report.data_length,
            report.data_space
        );
        if report.superblocks_corrected > 0 {
            println!(
                "pass 1 corrected {} superblock(s)",
                report.superblocks_corrected
            );
        }
        if !report.superblocks_uncorrected.is_empty() {
            println!(
                "superblocks left with errors: {:?}",
                report.superblocks_uncorrected
            );
        }
        if report.records_blanked > 0 || report.records_unrepaired > 0 {
            println!(
                "pass 2: {} records valid, {} blanked, {} left corrupt",
                report.records_valid, report.records_blanked, report.records_unrepaired
            );
        }
    }
    Ok(report.exit_code())
}

fn dump(device: &Path) -> Result<i32> {
    let dev =
        FileByteDevice::open(device).with_context(|| format!("cannot open {}", device.display()))?;
    let sb = sbio::select_superblock(&dev)
        .with_context(|| format!("no usable superblock on {}", device.display()))?;
    let mut reader = OfflineReader::new(&sb);
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = reader
            .read_records(&dev, &mut buf)
            .with_context(|| format!("reading records from {}", device.display()))?;
        if n == 0 {
            break;
        }
        let mut offset = 0;
        while offset < n {
            let record = parse_record(&buf[offset..]).context("decoding record")?;
            offset += record.header.next_header as usize;
            println!("{record}");
        }
    }
    Ok(exit_code::OK)
}

fn info(device: &Path, json: bool) -> Result<i32> {
    let dev =
        FileByteDevice::open(device).with_context(|| format!("cannot open {}", device.display()))?;
    let sb = sbio::select_superblock(&dev)
        .with_context(|| format!("no usable superblock on {}", device.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sb)?);
        return Ok(exit_code::OK);
    }
    println!("devsize: {}", sb.device_size);
    println!("space: {}", sb.data_space);
    println!("start: {}", sb.data_start);
    println!("size: {}", sb.data_length);
    println!("maxsize: {}", sb.max_length);
    println!("version: {}", sb.version);
    println!("flags: {}", sb.flags);
    println!("nsuper: {}", sb.num_superblocks);
    println!("align: {}", sb.alignment);
    println!("superblock: {}", sb.this_superblock);
    Ok(exit_code::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes_scale_correctly() {
        assert_eq!(parse_size("1048576").expect("plain"), 1 << 20);
        assert_eq!(parse_size("4k").expect("k"), 4096);
        assert_eq!(parse_size("2b").expect("b"), 8192);
        assert_eq!(parse_size("1m").expect("m"), 1 << 20);
        assert_eq!(parse_size("1g").expect("g"), 1 << 30);
        assert!(parse_size("nonsense").is_err());
    }

    #[test]
    fn format_and_fsck_an_image_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("journal.img");
        let code = format(&image, Some("1m"), 8, None, true, false, true).expect("format");
        assert_eq!(code, exit_code::OK);

        let code = fsck(&image, false, false, true, false, None, false).expect("fsck");
        assert_eq!(code, exit_code::OK);

        let code = info(&image, false).expect("info");
        assert_eq!(code, exit_code::OK);
        let code = dump(&image).expect("dump");
        assert_eq!(code, exit_code::OK);
    }
}
