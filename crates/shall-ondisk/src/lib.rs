#![forbid(unsafe_code)]
//! Bit-exact on-device codecs for the shallfs journal.
//!
//! Two artefacts live on the device: the 1,024-byte superblock (N copies at
//! quadratically spaced blocks) and the variable-length, self-delimiting log
//! record. Both are little-endian and protected by the seeded CRC-32 from
//! `shall-types`. This crate is pure codec: no I/O, no locking.

pub mod record;
mod render;
pub mod superblock;

pub use record::{
    Acl, AclEntry, Attr, Credentials, OpCode, Payload, Record, RecordHeader, RecordSpec, Region,
    Timestamp, Xattr, content_digest, encode_record, parse_header, parse_record,
    RECORD_HEADER_SIZE,
};
pub use superblock::{CheckFlags, Superblock, initial_superblock};
