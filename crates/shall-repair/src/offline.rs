//! Offline record streaming.
//!
//! Reads the journal of an unmounted device directly, walking the data
//! region byte-wise and hopping over superblock blocks. Used by the dump
//! tool and by the fsck data pass; unlike the mounted reader there is no
//! commit buffer to merge, so this is a plain forward walk.

use shall_block::ByteDevice;
use shall_error::{Result, ShallError};
use shall_ondisk::record::RECORD_HEADER_SIZE;
use shall_ondisk::{Superblock, parse_header};
use shall_types::{ByteOffset, DEV_BLOCK_SIZE, ParseError, superblock_location};

/// Walking cursor over the on-device data region.
#[derive(Debug, Clone)]
pub struct OfflineReader {
    device_size: u64,
    data_space: u64,
    num_superblocks: u32,
    /// Logical ring offset of the next unread byte.
    pub data_start: u64,
    /// Bytes not yet consumed.
    pub data_length: u64,
    /// Absolute device byte offset of `data_start`.
    real_start: u64,
    /// Index of the next superblock block at or after `real_start`.
    next_superblock: u32,
}

impl OfflineReader {
    /// Position a cursor at the superblock's `data_start`.
    #[must_use]
    pub fn new(sb: &Superblock) -> Self {
        let mut real_start = sb.data_start;
        let mut next = 0_u32;
        while next < sb.num_superblocks && superblock_location(next) * DEV_BLOCK_SIZE <= real_start
        {
            next += 1;
            real_start += DEV_BLOCK_SIZE;
        }
        Self {
            device_size: sb.device_size,
            data_space: sb.data_space,
            num_superblocks: sb.num_superblocks,
            data_start: sb.data_start,
            data_length: sb.data_length,
            real_start,
            next_superblock: next,
        }
    }

    /// Absolute device byte offset of the boundary ending the current run
    /// of data blocks (the next superblock block, or end of device).
    fn run_end(&self) -> u64 {
        if self.next_superblock < self.num_superblocks {
            superblock_location(self.next_superblock) * DEV_BLOCK_SIZE
        } else {
            self.device_size
        }
    }

    /// Advance the cursor by `len` bytes without reading.
    pub fn advance(&mut self, mut len: u64) {
        while len > 0 {
            let todo = (self.run_end() - self.real_start)
                .min(len)
                .min(self.data_length);
            if todo == 0 {
                return;
            }
            len -= todo;
            self.real_start += todo;
            self.data_length -= todo;
            self.data_start += todo;
            if self.data_start >= self.data_space {
                self.data_start -= self.data_space;
            }
            self.hop_if_at_boundary();
        }
    }

    fn hop_if_at_boundary(&mut self) {
        if self.real_start < self.run_end() {
            return;
        }
        self.next_superblock += 1;
        self.real_start += DEV_BLOCK_SIZE;
        if self.real_start >= self.device_size {
            self.next_superblock = 1;
            self.real_start = DEV_BLOCK_SIZE;
        }
    }

    /// Raw read without advancing: fill `dest` from the cursor, stopping
    /// at end of data. Returns the bytes produced.
    pub fn peek(&self, dev: &dyn ByteDevice, dest: &mut [u8]) -> Result<usize> {
        let mut probe = self.clone();
        let mut done = 0_usize;
        while done < dest.len() && probe.data_length > 0 {
            let todo = (probe.run_end() - probe.real_start)
                .min((dest.len() - done) as u64)
                .min(probe.data_length) as usize;
            dev.read_exact_at(ByteOffset(probe.real_start), &mut dest[done..done + todo])?;
            done += todo;
            probe.advance(todo as u64);
        }
        Ok(done)
    }

    /// Read whole, CRC-valid records into `dest` and advance past them.
    ///
    /// A corrupt header at the cursor is a hard error; one later in the
    /// batch truncates the stream at the last good record. Returns 0 at
    /// end of data.
    pub fn read_records(&mut self, dev: &dyn ByteDevice, dest: &mut [u8]) -> Result<usize> {
        let raw = self.peek(dev, dest)?;
        if raw == 0 {
            return Ok(0);
        }
        let mut accepted = 0_usize;
        while raw - accepted >= RECORD_HEADER_SIZE {
            let header = match parse_header(&dest[accepted..]) {
                Ok(header) => header,
                Err(err) => {
                    if accepted == 0 {
                        return Err(ShallError::Invalid(err));
                    }
                    break;
                }
            };
            let next_header = header.next_header as usize;
            if next_header as u64 > self.data_length - accepted as u64 {
                if accepted == 0 {
                    return Err(ShallError::Invalid(ParseError::InvalidField {
                        field: "next_header",
                        reason: "record runs past the end of the journal",
                    }));
                }
                break;
            }
            if raw - accepted < next_header {
                // Truncated by the buffer; deliver what we have.
                break;
            }
            accepted += next_header;
        }
        self.advance(accepted as u64);
        Ok(accepted)
    }

    /// Write `bytes` at the cursor's current position (data pass repair);
    /// the cursor itself does not move.
    pub fn overwrite(&self, dev: &dyn ByteDevice, bytes: &[u8]) -> Result<()> {
        let mut probe = self.clone();
        let mut done = 0_usize;
        while done < bytes.len() {
            let todo = (probe.run_end() - probe.real_start).min((bytes.len() - done) as u64)
                as usize;
            if todo == 0 {
                return Err(ShallError::Format(
                    "overwrite runs past the end of the journal".into(),
                ));
            }
            dev.write_all_at(ByteOffset(probe.real_start), &bytes[done..done + todo])?;
            done += todo;
            // Move the probe without draining data_length accounting.
            probe.real_start += todo as u64;
            probe.hop_if_at_boundary();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shall_block::MemByteDevice;
    use shall_journal::sbio::{self, FormatParams};
    use shall_journal::{Interrupt, Journal, MountOptions};
    use shall_ondisk::record::OpCode;
    use shall_ondisk::parse_record;
    use std::sync::Arc;

    fn populated_device(records: u32) -> Arc<MemByteDevice> {
        let dev = Arc::new(MemByteDevice::new(1 << 20).expect("mem device"));
        sbio::format_device(&*dev, FormatParams::default()).expect("format");
        let intr = Interrupt::new();
        let journal = Journal::open(dev.clone(), MountOptions::default()).expect("open");
        for seq in 0..records {
            journal
                .log_name(
                    &intr,
                    OpCode::Create.after(),
                    format!("file-{seq}").as_bytes(),
                    0,
                )
                .expect("append");
        }
        journal.commit(&intr).expect("commit");
        journal.unmount(&intr).expect("unmount");
        dev
    }

    #[test]
    fn offline_reader_streams_committed_records() {
        let dev = populated_device(25);
        let sb = sbio::select_superblock(&*dev).expect("select");
        let mut reader = OfflineReader::new(&sb);

        let mut names = Vec::new();
        let mut buf = vec![0_u8; 4096];
        loop {
            let n = reader.read_records(&*dev, &mut buf).expect("read");
            if n == 0 {
                break;
            }
            let mut offset = 0;
            while offset < n {
                let record = parse_record(&buf[offset..]).expect("parse");
                offset += record.header.next_header as usize;
                names.push(record.file1.expect("name"));
            }
        }
        assert_eq!(names.len(), 25);
        assert_eq!(names[0], b"file-0");
        assert_eq!(names[24], b"file-24");
        assert_eq!(reader.data_length, 0);
    }

    #[test]
    fn offline_reader_skips_superblock_blocks() {
        // Enough records that the stream crosses superblock 1 at block 20.
        let dev = populated_device(1200);
        let sb = sbio::select_superblock(&*dev).expect("select");
        assert!(
            sb.data_length > 21 * DEV_BLOCK_SIZE,
            "stream must span the second superblock"
        );
        let mut reader = OfflineReader::new(&sb);
        let mut total = 0_u64;
        let mut buf = vec![0_u8; 8192];
        loop {
            let n = reader.read_records(&*dev, &mut buf).expect("read");
            if n == 0 {
                break;
            }
            // Every delivered header still validates: the hop over the
            // superblock block was seamless.
            parse_header(&buf).expect("head of batch");
            total += n as u64;
        }
        assert_eq!(total, sb.data_length);
    }

    #[test]
    fn corrupt_head_is_a_hard_error() {
        let dev = populated_device(3);
        let sb = sbio::select_superblock(&*dev).expect("select");
        // First record starts at data_start = block 1 for a fresh device.
        let mut reader = OfflineReader::new(&sb);
        dev.write_all_at(ByteOffset(DEV_BLOCK_SIZE + sb.data_start), &[0xFF; 4])
            .expect("corrupt");
        let mut buf = vec![0_u8; 4096];
        assert!(matches!(
            reader.read_records(&*dev, &mut buf),
            Err(ShallError::Invalid(_))
        ));
    }
}
