//! End-to-end engine scenarios: format, append/commit/drain cycles,
//! size-triggered commits, overflow and recovery, crash selection of the
//! best superblock, and concurrent producers against a draining consumer.

use shall_block::MemByteDevice;
use shall_journal::sbio::{self, FormatParams};
use shall_journal::{Interrupt, Journal, MountOptions};
use shall_ondisk::record::{LOG_CREDS, LOG_FILE1, OpCode, Payload, Region};
use shall_ondisk::{Record, parse_record};
use shall_types::DEV_BLOCK_SIZE;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn formatted_device(size: u64) -> Arc<MemByteDevice> {
    let dev = Arc::new(MemByteDevice::new(size).expect("mem device"));
    sbio::format_device(&*dev, FormatParams::default()).expect("format");
    dev
}

fn options(s: &str) -> MountOptions {
    s.parse().expect("options")
}

/// Split a drained byte stream into records, validating each.
fn parse_stream(bytes: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let record = parse_record(&bytes[offset..]).expect("valid record in stream");
        offset += record.header.next_header as usize;
        records.push(record);
    }
    records
}

/// Drain everything currently in the journal.
fn drain_all(journal: &Journal) -> Vec<Record> {
    let mut out = Vec::new();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = journal.read_records(&mut buf).expect("read_records");
        if n == 0 {
            return out;
        }
        out.extend(parse_stream(&buf[..n]));
    }
}

#[test]
fn format_one_mebibyte_device() {
    let dev = Arc::new(MemByteDevice::new(1 << 20).expect("mem device"));
    let sb = sbio::format_device(
        &*dev,
        FormatParams {
            alignment: Some(8),
            ..FormatParams::default()
        },
    )
    .expect("format");

    assert_eq!(sb.device_size, 1 << 20);
    // The default count places superblocks until the next location falls
    // outside the device, so the last one sits past the half-way point.
    assert!(
        shall_types::superblock_location(sb.num_superblocks) * DEV_BLOCK_SIZE > (1 << 20) / 2
    );
    let (sb0, _) = sbio::read_superblock(&*dev, 0).expect("read sb0");
    assert_eq!(sb0.flags, shall_ondisk::superblock::SB_VALID);
    assert_eq!(sb0.data_length, 0);
    assert_eq!(sb0.alignment, 8);
}

#[test]
fn append_commit_close_reopen_drain() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);

    let journal = Journal::open(dev.clone(), MountOptions::default()).expect("open");
    journal
        .log_name(&intr, OpCode::Mount.after(), b"/tmp/x", 0)
        .expect("append");
    journal.commit(&intr).expect("commit");
    journal.unmount(&intr).expect("unmount");
    drop(journal);

    let journal = Journal::open(dev, MountOptions::default()).expect("reopen");
    let records = drain_all(&journal);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.header.op(), Some(OpCode::Mount));
    assert_eq!(record.header.flags & (LOG_FILE1 | LOG_CREDS), LOG_FILE1 | LOG_CREDS);
    assert_eq!(record.file1.as_deref(), Some(&b"/tmp/x"[..]));
}

#[test]
fn size_triggered_commits_and_ordered_drain() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, options("commit=60:8192")).expect("open");

    // 384 encoded bytes per record: header + creds + length prefix + name.
    let name_len = 300;
    for seq in 0..100_u32 {
        let mut name = format!("{seq:06}").into_bytes();
        name.resize(name_len, b'x');
        journal
            .log_name(&intr, OpCode::Write.after(), &name, 0)
            .expect("append");
    }

    let info = journal.info();
    assert!(
        info.commit_size >= 3,
        "expected at least 3 size-triggered commits, saw {}",
        info.commit_size
    );

    let records = drain_all(&journal);
    assert_eq!(records.len(), 100);
    for (seq, record) in records.iter().enumerate() {
        let name = record.file1.as_deref().expect("name");
        assert_eq!(&name[..6], format!("{seq:06}").as_bytes());
    }
}

#[test]
fn overflow_drop_marks_and_recovers() {
    let intr = Interrupt::new();
    // 17 blocks: one superblock, data_space exactly 65,536 bytes.
    let dev = Arc::new(MemByteDevice::new(17 * DEV_BLOCK_SIZE).expect("mem device"));
    let sb = sbio::format_device(&*dev, FormatParams::default()).expect("format");
    assert_eq!(sb.num_superblocks, 1);
    assert_eq!(sb.data_space, 65_536);

    let journal = Journal::open(dev, options("overflow=drop,commit=60:4096")).expect("open");

    // 200 encoded bytes per record.
    let name_len = 200 - 32 - 48 - 4;
    for seq in 0..500_u32 {
        let mut name = format!("{seq:06}").into_bytes();
        name.resize(name_len, b'y');
        journal
            .log_name(&intr, OpCode::Write.after(), &name, 0)
            .expect("append never fails under overflow=drop");
    }

    let records = drain_all(&journal);
    let stored: Vec<_> = records
        .iter()
        .filter(|r| r.header.op() == Some(OpCode::Write))
        .collect();
    let overflows: Vec<_> = records
        .iter()
        .filter(|r| r.header.op() == Some(OpCode::Overflow))
        .collect();
    let recovers: Vec<_> = records
        .iter()
        .filter(|r| r.header.op() == Some(OpCode::Recover))
        .collect();

    assert!(stored.len() < 500, "some records must have been dropped");
    assert!(stored.len() <= 328);
    assert_eq!(overflows.len(), 1, "exactly one OVERFLOW marker");
    assert_eq!(recovers.len(), 1, "one RECOVER marker after the drain");

    let dropped = 500 - stored.len() as u64;
    let recover = recovers[0];
    assert_eq!(recover.header.result as u64, dropped);
    assert_eq!(recover.payload, Payload::Size(dropped * 200));

    // Stored records kept append order.
    for pair in stored.windows(2) {
        assert!(pair[0].file1 < pair[1].file1);
    }
}

#[test]
fn crash_recovery_selects_greatest_version() {
    let intr = Interrupt::new();
    let dev = formatted_device(8 << 20);

    let journal = Journal::open(dev.clone(), options("commit=60:4096")).expect("open");
    for seq in 0..10_u32 {
        journal
            .log_name(&intr, OpCode::Create.after(), format!("durable-{seq}").as_bytes(), 0)
            .expect("append");
    }
    journal.commit(&intr).expect("commit");
    let durable = journal.info();

    // More appends that never reach a commit, then the process "dies".
    for seq in 0..5_u32 {
        journal
            .log_name(&intr, OpCode::Create.after(), format!("lost-{seq}").as_bytes(), 0)
            .expect("append");
    }
    drop(journal);

    // Superblock 0 is dirty (mount wrote it), so reopening scans all
    // copies and takes the greatest version.
    let (sb0, _) = sbio::read_superblock(&*dev, 0).expect("read sb0");
    assert!(sb0.flags & shall_ondisk::superblock::SB_DIRTY != 0);

    let journal = Journal::open(dev, MountOptions::default()).expect("reopen");
    let info = journal.info();
    assert_eq!(info.size, durable.size, "data_length matches the durable state");
    assert!(info.version >= durable.version);

    let records = drain_all(&journal);
    assert_eq!(records.len(), 10);
    assert!(
        records
            .iter()
            .all(|r| r.file1.as_deref().expect("name").starts_with(b"durable-"))
    );
}

#[test]
fn concurrent_producers_and_consumer() {
    let dev = formatted_device(8 << 20);
    let journal = Journal::open(dev, options("commit=1:8192")).expect("open");

    const THREADS: u32 = 10;
    const PER_THREAD: u32 = 1000;
    let producing = Arc::new(AtomicBool::new(true));

    let collected = std::thread::scope(|scope| {
        let mut producers = Vec::new();
        for tid in 0..THREADS {
            let journal = journal.clone();
            producers.push(scope.spawn(move || {
                let intr = Interrupt::new();
                for seq in 0..PER_THREAD {
                    let name = format!("t{tid}:{seq}");
                    journal
                        .log_name(&intr, OpCode::Write.after(), name.as_bytes(), 0)
                        .expect("append");
                }
            }));
        }

        let consumer_journal = journal.clone();
        let consumer_flag = Arc::clone(&producing);
        let consumer = scope.spawn(move || {
            let mut out = Vec::new();
            let mut buf = vec![0_u8; 64 * 1024];
            loop {
                let n = consumer_journal.read_records(&mut buf).expect("read");
                if n > 0 {
                    out.extend(parse_stream(&buf[..n]));
                    continue;
                }
                if !consumer_flag.load(Ordering::Acquire) {
                    // Producers are done; drain whatever is left and stop.
                    loop {
                        let n = consumer_journal.read_records(&mut buf).expect("read");
                        if n == 0 {
                            return out;
                        }
                        out.extend(parse_stream(&buf[..n]));
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        for producer in producers {
            producer.join().expect("producer");
        }
        producing.store(false, Ordering::Release);
        consumer.join().expect("consumer")
    });

    assert_eq!(collected.len(), (THREADS * PER_THREAD) as usize);
    let mut names: Vec<Vec<u8>> = collected
        .into_iter()
        .map(|r| r.file1.expect("name"))
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), (THREADS * PER_THREAD) as usize, "no duplicates");
}

#[test]
fn repeated_commits_are_idempotent_apart_from_version() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, MountOptions::default()).expect("open");

    journal
        .log_name(&intr, OpCode::Mkdir.after(), b"once", 0)
        .expect("append");
    journal.commit(&intr).expect("commit 1");
    let first = journal.info();
    journal.commit(&intr).expect("commit 2");
    journal.commit(&intr).expect("commit 3");
    let third = journal.info();

    assert_eq!(third.size, first.size);
    assert_eq!(third.start, first.start);
    assert_eq!(third.version, first.version + 2);
    assert_eq!(third.commit_forced, first.commit_forced + 2);

    let records = drain_all(&journal);
    assert_eq!(records.len(), 1);
}

#[test]
fn record_exactly_commit_size_is_accepted() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, MountOptions::default()).expect("open");

    // Encoded length exactly 4,096: header + creds + prefix + name.
    let name = vec![b'z'; 4096 - 32 - 48 - 4];
    journal
        .log_name(&intr, OpCode::Write.after(), &name, 0)
        .expect("append");
    let records = drain_all(&journal);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header.next_header, 4096);
}

#[test]
fn oversized_record_becomes_too_big_marker_or_error() {
    let intr = Interrupt::new();
    let name = vec![b'q'; 5000];

    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, options("too_big=log")).expect("open");
    journal
        .log_name(&intr, OpCode::Write.after(), &name, 0)
        .expect("append is replaced by a marker");
    let records = drain_all(&journal);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header.op(), Some(OpCode::TooBig));
    let Payload::Size(required) = records[0].payload else {
        panic!("TOO_BIG marker must carry the required size");
    };
    assert!(required > 4096);

    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, options("too_big=error")).expect("open");
    assert!(matches!(
        journal.log_name(&intr, OpCode::Write.after(), &name, 0),
        Err(shall_error::ShallError::TooBig { .. })
    ));
}

#[test]
fn reader_handle_is_exclusive_and_control_commands_work() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, MountOptions::default()).expect("open");

    let reader = journal.open_reader().expect("first reader");
    assert!(matches!(
        journal.open_reader(),
        Err(shall_error::ShallError::Busy)
    ));

    let control = journal.open_control().expect("control");
    control
        .write(&intr, "userlog hello operator\ncommit\n")
        .expect("commands");

    let mut buf = vec![0_u8; 8192];
    let n = reader.read(&intr, &mut buf).expect("read");
    let records = parse_stream(&buf[..n]);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header.op(), Some(OpCode::UserLog));
    assert_eq!(records[0].file1.as_deref(), Some(&b"hello operator"[..]));

    // clear consumes whole records only.
    journal
        .log_name(&intr, OpCode::Write.after(), b"to-clear", 0)
        .expect("append");
    let record_len = journal.info().size;
    control
        .write(&intr, &format!("clear {record_len}\n"))
        .expect("clear");
    assert_eq!(journal.info().size, 0);

    assert!(control.write(&intr, "explode\n").is_err());
    assert!(control.write(&intr, "commit").is_err(), "missing newline");

    drop(reader);
    let _second = journal.open_reader().expect("reader slot freed");
}

#[test]
fn unmount_ends_the_reader_stream() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, MountOptions::default()).expect("open");

    let reader = journal.open_reader().expect("reader");
    let unmounter = journal.clone();
    std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let mut buf = vec![0_u8; 4096];
            reader.read(&Interrupt::new(), &mut buf)
        });
        // Give the reader a moment to block, then unmount under it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        unmounter.unmount(&intr).expect("unmount");
        let n = handle.join().expect("reader thread").expect("read");
        assert_eq!(n, 0, "end-of-stream after unmount");
    });
}

#[test]
fn interrupt_cancels_a_blocked_reader() {
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, MountOptions::default()).expect("open");
    let reader = journal.open_reader().expect("reader");

    let intr = Interrupt::new();
    let raiser = intr.clone();
    std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let mut buf = vec![0_u8; 4096];
            reader.read(&intr, &mut buf)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        raiser.raise();
        let result = handle.join().expect("reader thread");
        assert!(matches!(result, Err(shall_error::ShallError::Interrupted)));
    });
}

#[test]
fn overflow_wait_producer_is_released_by_a_drain() {
    // Single-superblock geometry again, tiny ring.
    let dev = Arc::new(MemByteDevice::new(17 * DEV_BLOCK_SIZE).expect("mem device"));
    sbio::format_device(&*dev, FormatParams::default()).expect("format");
    let journal = Journal::open(dev, options("overflow=wait,commit=60:4096")).expect("open");

    let intr = Interrupt::new();
    // Fill the ring.
    let name = vec![b'f'; 200 - 32 - 48 - 4];
    loop {
        let before = journal.info().size;
        // Stop just before the overflow gate would engage.
        if before + 432 > journal.data_space() {
            break;
        }
        journal
            .log_name(&intr, OpCode::Write.after(), &name, 0)
            .expect("fill");
    }

    let blocked = journal.clone();
    let mut records = std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let intr = Interrupt::new();
            // This append does not fit and must wait for the drain below.
            blocked.log_name(&intr, OpCode::Write.after(), &[b'w'; 300], 0)
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!handle.is_finished(), "producer should be waiting for space");

        let drained = drain_all(&journal);
        handle
            .join()
            .expect("producer")
            .expect("append succeeds after drain");
        drained
    });
    records.extend(drain_all(&journal));

    // The episode left one OVERFLOW/RECOVER pair and the delayed record.
    assert!(records.iter().any(|r| r.header.op() == Some(OpCode::Write)));
    assert_eq!(
        records
            .iter()
            .filter(|r| r.header.op() == Some(OpCode::Overflow))
            .count(),
        1
    );
    assert_eq!(
        records
            .iter()
            .filter(|r| r.header.op() == Some(OpCode::Recover))
            .count(),
        1
    );
}

#[test]
fn data_mode_full_slices_large_writes() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, options("data=data,commit=60:8192")).expect("open");

    let data = vec![0xAB_u8; 2500];
    journal
        .log_write(
            &intr,
            Region {
                start: 0,
                length: data.len() as u64,
                fileid: 7,
            },
            &data,
            0,
        )
        .expect("log_write");

    let records = drain_all(&journal);
    assert_eq!(records.len(), 3, "2500 bytes slice into 1024+1024+452");
    let mut reassembled = Vec::new();
    let mut expected_start = 0_u64;
    for record in &records {
        let Payload::Data { region, bytes } = &record.payload else {
            panic!("expected DATA payload");
        };
        assert_eq!(region.start, expected_start);
        assert_eq!(region.length as usize, bytes.len());
        expected_start += region.length;
        reassembled.extend_from_slice(bytes);
    }
    assert_eq!(reassembled, data);
}

#[test]
fn remount_swaps_policies_and_buffer() {
    let intr = Interrupt::new();
    let dev = formatted_device(1 << 20);
    let journal = Journal::open(dev, MountOptions::default()).expect("open");

    journal
        .log_name(&intr, OpCode::Write.after(), b"before-remount", 0)
        .expect("append");
    journal
        .remount(&intr, options("overflow=drop,commit=9:16384"))
        .expect("remount");
    assert_eq!(journal.options().commit_size, 16384);
    journal
        .log_name(&intr, OpCode::Write.after(), b"after-remount", 0)
        .expect("append");

    let records = drain_all(&journal);
    assert_eq!(records.len(), 2);
}
