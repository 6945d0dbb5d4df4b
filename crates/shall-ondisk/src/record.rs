//! Log record codec.
//!
//! A record is self-delimiting: a 32-byte header whose `next_header` field
//! is the aligned distance to the following record, then (per the `flags`
//! bitmap) optional credentials, up to two length-prefixed names, exactly
//! one typed payload, and zero padding up to `next_header`. The header CRC
//! covers the 28 bytes preceding it.

use serde::{Deserialize, Serialize};
use shall_types::{
    HASH_LENGTH, ParseError, align_up, ensure_slice, read_fixed, read_le_i32, read_le_u32,
    read_le_u64, shall_crc,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the on-device record header.
pub const RECORD_HEADER_SIZE: usize = 32;
/// Size of the on-device credentials blob.
pub const CREDS_SIZE: usize = 48;
/// Size of a name-length prefix.
pub const NAME_LEN_SIZE: usize = 4;
/// Producers slice DATA payloads to at most this many raw bytes per record.
pub const DATA_SLICE_MAX: usize = 1024;

const FILEID_SIZE: usize = 4;
const SIZE_SIZE: usize = 8;
const REGION_SIZE: usize = 20;
const ATTR_PAYLOAD_SIZE: usize = 48;
const HASH_PAYLOAD_SIZE: usize = REGION_SIZE + HASH_LENGTH;
const ACL_HEADER_SIZE: usize = 8;
const ACL_ENTRY_SIZE: usize = 8;
const XATTR_HEADER_SIZE: usize = 12;

const CRC_COVERED: usize = 28;

// Record flag bits; the high byte selects the payload type.
pub const LOG_FILE1: u32 = 0x0001;
pub const LOG_FILE2: u32 = 0x0002;
pub const LOG_CREDS: u32 = 0x0004;
pub const LOG_FILEID: u32 = 0x0100;
pub const LOG_ATTR: u32 = 0x0200;
pub const LOG_XATTR: u32 = 0x0400;
pub const LOG_REGION: u32 = 0x0800;
pub const LOG_SIZE: u32 = 0x1000;
pub const LOG_ACL: u32 = 0x2000;
pub const LOG_HASH: u32 = 0x4000;
pub const LOG_DATA: u32 = 0x8000;
pub const LOG_DMASK: u32 = 0xFF00;
const LOG_KNOWN: u32 = LOG_FILE1 | LOG_FILE2 | LOG_CREDS | LOG_DMASK;

// Attribute-change bits carried by ATTR payloads.
pub const ATTR_MODE: u32 = 0x0000_0001;
pub const ATTR_USER: u32 = 0x0000_0002;
pub const ATTR_GROUP: u32 = 0x0000_0004;
pub const ATTR_BLOCK: u32 = 0x0000_0008;
pub const ATTR_CHAR: u32 = 0x0000_0010;
pub const ATTR_SIZE: u32 = 0x0000_0020;
pub const ATTR_ATIME: u32 = 0x0000_0040;
pub const ATTR_MTIME: u32 = 0x0000_0080;
pub const ATTR_EXCL: u32 = 0x0000_0100;

// ACL permission bits; four seven-bit groups (user_obj, group_obj, other,
// mask) pack into `Acl::perm` together with the access/default bit 28.
pub const ACL_READ: u32 = 0x0001;
pub const ACL_WRITE: u32 = 0x0002;
pub const ACL_EXECUTE: u32 = 0x0004;
pub const ACL_ADD: u32 = 0x0008;
pub const ACL_DELETE: u32 = 0x0010;
pub const ACL_ACCESS_BIT: u32 = 1 << 28;

/// Logged operations; negative header values denote the before-op record,
/// positive the after-op record, zero is reserved for debug events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum OpCode {
    Mount = 0x01,
    Remount,
    Umount,
    Overflow,
    Recover,
    TooBig,
    Meta,
    Mknod,
    Mkdir,
    Link,
    Symlink,
    Create,
    Delete,
    Rmdir,
    Open,
    Write,
    Commit,
    Close,
    Move,
    Swap,
    SetAcl,
    SetXattr,
    DelXattr,
    UserLog,
}

impl OpCode {
    /// Decode the absolute value of a header `operation` field.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code.unsigned_abs() {
            0x01 => Self::Mount,
            0x02 => Self::Remount,
            0x03 => Self::Umount,
            0x04 => Self::Overflow,
            0x05 => Self::Recover,
            0x06 => Self::TooBig,
            0x07 => Self::Meta,
            0x08 => Self::Mknod,
            0x09 => Self::Mkdir,
            0x0A => Self::Link,
            0x0B => Self::Symlink,
            0x0C => Self::Create,
            0x0D => Self::Delete,
            0x0E => Self::Rmdir,
            0x0F => Self::Open,
            0x10 => Self::Write,
            0x11 => Self::Commit,
            0x12 => Self::Close,
            0x13 => Self::Move,
            0x14 => Self::Swap,
            0x15 => Self::SetAcl,
            0x16 => Self::SetXattr,
            0x17 => Self::DelXattr,
            0x18 => Self::UserLog,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Signed header value for an after-op record.
    #[must_use]
    pub fn after(self) -> i32 {
        self.code()
    }

    /// Signed header value for a before-op record.
    #[must_use]
    pub fn before(self) -> i32 {
        -self.code()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Mount => "MOUNT",
            Self::Remount => "REMOUNT",
            Self::Umount => "UMOUNT",
            Self::Overflow => "OVERFLOW",
            Self::Recover => "RECOVER",
            Self::TooBig => "TOO_BIG",
            Self::Meta => "META",
            Self::Mknod => "MKNOD",
            Self::Mkdir => "MKDIR",
            Self::Link => "LINK",
            Self::Symlink => "SYMLINK",
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
            Self::Rmdir => "RMDIR",
            Self::Open => "OPEN",
            Self::Write => "WRITE",
            Self::Commit => "COMMIT",
            Self::Close => "CLOSE",
            Self::Move => "MOVE",
            Self::Swap => "SWAP",
            Self::SetAcl => "SET_ACL",
            Self::SetXattr => "SET_XATTR",
            Self::DelXattr => "DEL_XATTR",
            Self::UserLog => "USER_LOG",
        }
    }
}

/// Request timestamp carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs(),
            nsec: elapsed.subsec_nanos(),
        }
    }
}

/// Credentials of the process that requested the logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u64,
    pub euid: u64,
    pub fsuid: u64,
    pub gid: u64,
    pub egid: u64,
    pub fsgid: u64,
}

impl Credentials {
    fn encode_into(&self, out: &mut Vec<u8>) {
        for value in [
            self.uid, self.euid, self.fsuid, self.gid, self.egid, self.fsgid,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            uid: read_le_u64(bytes, 0)?,
            euid: read_le_u64(bytes, 8)?,
            fsuid: read_le_u64(bytes, 16)?,
            gid: read_le_u64(bytes, 24)?,
            egid: read_le_u64(bytes, 32)?,
            fsgid: read_le_u64(bytes, 40)?,
        })
    }
}

/// A file region touched by a write-class operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    pub start: u64,
    pub length: u64,
    pub fileid: u32,
}

/// Attribute change description (META, MKNOD, MKDIR, SYMLINK, CREATE).
///
/// When `flags` includes [`ATTR_BLOCK`] or [`ATTR_CHAR`], `size_or_dev`
/// carries the device number as major in the upper and minor in the lower
/// 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attr {
    pub flags: u32,
    pub mode: u32,
    pub user: u32,
    pub group: u32,
    pub size_or_dev: u64,
    pub atime_sec: u64,
    pub mtime_sec: u64,
    pub atime_nsec: u32,
    pub mtime_nsec: u32,
}

impl Attr {
    #[must_use]
    pub fn device(major: u32, minor: u32) -> u64 {
        u64::from(major) << 32 | u64::from(minor)
    }
}

/// One named ACL entry (ACL_USER / ACL_GROUP class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// Permission bits, plus bit 28 set for group entries.
    pub kind: u32,
    /// User or group id.
    pub name: u32,
}

/// ACL payload: combined user/group/other/mask permissions plus the
/// variable entry list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    pub perm: u32,
    pub entries: Vec<AclEntry>,
}

/// Extended-attribute payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Xattr {
    pub flags: u32,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// The one optional typed payload a record carries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    None,
    FileId(u32),
    Size(u64),
    Region(Region),
    Attr(Attr),
    Acl(Acl),
    Xattr(Xattr),
    Hash {
        region: Region,
        digest: [u8; HASH_LENGTH],
    },
    Data {
        region: Region,
        bytes: Vec<u8>,
    },
}

impl Payload {
    /// The flag bit announcing this payload, zero for `None`.
    #[must_use]
    pub fn flag_bit(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::FileId(_) => LOG_FILEID,
            Self::Size(_) => LOG_SIZE,
            Self::Region(_) => LOG_REGION,
            Self::Attr(_) => LOG_ATTR,
            Self::Acl(_) => LOG_ACL,
            Self::Xattr(_) => LOG_XATTR,
            Self::Hash { .. } => LOG_HASH,
            Self::Data { .. } => LOG_DATA,
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::FileId(_) => FILEID_SIZE,
            Self::Size(_) => SIZE_SIZE,
            Self::Region(_) => REGION_SIZE,
            Self::Attr(_) => ATTR_PAYLOAD_SIZE,
            Self::Acl(acl) => ACL_HEADER_SIZE + acl.entries.len() * ACL_ENTRY_SIZE,
            Self::Xattr(xattr) => XATTR_HEADER_SIZE + xattr.name.len() + xattr.value.len(),
            Self::Hash { .. } => HASH_PAYLOAD_SIZE,
            Self::Data { bytes, .. } => REGION_SIZE + bytes.len(),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        fn region_into(region: &Region, out: &mut Vec<u8>) {
            out.extend_from_slice(&region.start.to_le_bytes());
            out.extend_from_slice(&region.length.to_le_bytes());
            out.extend_from_slice(&region.fileid.to_le_bytes());
        }
        match self {
            Self::None => {}
            Self::FileId(fileid) => out.extend_from_slice(&fileid.to_le_bytes()),
            Self::Size(size) => out.extend_from_slice(&size.to_le_bytes()),
            Self::Region(region) => region_into(region, out),
            Self::Attr(attr) => {
                out.extend_from_slice(&attr.flags.to_le_bytes());
                out.extend_from_slice(&attr.mode.to_le_bytes());
                out.extend_from_slice(&attr.user.to_le_bytes());
                out.extend_from_slice(&attr.group.to_le_bytes());
                out.extend_from_slice(&attr.size_or_dev.to_le_bytes());
                out.extend_from_slice(&attr.atime_sec.to_le_bytes());
                out.extend_from_slice(&attr.mtime_sec.to_le_bytes());
                out.extend_from_slice(&attr.atime_nsec.to_le_bytes());
                out.extend_from_slice(&attr.mtime_nsec.to_le_bytes());
            }
            Self::Acl(acl) => {
                out.extend_from_slice(&(acl.entries.len() as u32).to_le_bytes());
                out.extend_from_slice(&acl.perm.to_le_bytes());
                for entry in &acl.entries {
                    out.extend_from_slice(&entry.kind.to_le_bytes());
                    out.extend_from_slice(&entry.name.to_le_bytes());
                }
            }
            Self::Xattr(xattr) => {
                out.extend_from_slice(&xattr.flags.to_le_bytes());
                out.extend_from_slice(&(xattr.name.len() as u32).to_le_bytes());
                out.extend_from_slice(&(xattr.value.len() as u32).to_le_bytes());
                out.extend_from_slice(&xattr.name);
                out.extend_from_slice(&xattr.value);
            }
            Self::Hash { region, digest } => {
                region_into(region, out);
                out.extend_from_slice(digest);
            }
            Self::Data { region, bytes } => {
                region_into(region, out);
                out.extend_from_slice(bytes);
            }
        }
    }
}

/// BLAKE3 digest of a write region's content for HASH payloads.
#[must_use]
pub fn content_digest(data: &[u8]) -> [u8; HASH_LENGTH] {
    *blake3::hash(data).as_bytes()
}

/// Everything needed to encode one record.
#[derive(Debug, Clone, Copy)]
pub struct RecordSpec<'a> {
    pub operation: i32,
    pub result: i32,
    pub timestamp: Timestamp,
    pub creds: Option<&'a Credentials>,
    pub file1: Option<&'a [u8]>,
    pub file2: Option<&'a [u8]>,
    pub payload: &'a Payload,
}

impl RecordSpec<'_> {
    #[must_use]
    pub fn flags(&self) -> u32 {
        let mut flags = self.payload.flag_bit();
        if self.creds.is_some() {
            flags |= LOG_CREDS;
        }
        if self.file1.is_some() {
            flags |= LOG_FILE1;
        }
        if self.file2.is_some() {
            flags |= LOG_FILE2;
        }
        flags
    }

    #[must_use]
    pub fn unpadded_len(&self) -> usize {
        let mut len = RECORD_HEADER_SIZE;
        if self.creds.is_some() {
            len += CREDS_SIZE;
        }
        if let Some(name) = self.file1 {
            len += NAME_LEN_SIZE + name.len();
        }
        if let Some(name) = self.file2 {
            len += NAME_LEN_SIZE + name.len();
        }
        len + self.payload.encoded_len()
    }

    /// Total record length including alignment padding; this is the value
    /// stored in `next_header`.
    #[must_use]
    pub fn encoded_len(&self, alignment: u32) -> usize {
        align_up(self.unpadded_len(), alignment)
    }
}

/// Encode one complete record, padded to a multiple of `alignment`.
pub fn encode_record(spec: &RecordSpec<'_>, alignment: u32) -> Result<Vec<u8>, ParseError> {
    for name in [spec.file1, spec.file2].into_iter().flatten() {
        if u32::try_from(name.len()).is_err() {
            return Err(ParseError::InvalidField {
                field: "file name",
                reason: "length does not fit u32",
            });
        }
    }
    let next_header = spec.encoded_len(alignment);
    let next_header_u32 = u32::try_from(next_header).map_err(|_| ParseError::InvalidField {
        field: "next_header",
        reason: "record length does not fit u32",
    })?;

    let mut out = Vec::with_capacity(next_header);
    out.extend_from_slice(&next_header_u32.to_le_bytes());
    out.extend_from_slice(&spec.operation.to_le_bytes());
    out.extend_from_slice(&spec.timestamp.sec.to_le_bytes());
    out.extend_from_slice(&spec.timestamp.nsec.to_le_bytes());
    out.extend_from_slice(&spec.result.to_le_bytes());
    out.extend_from_slice(&spec.flags().to_le_bytes());
    let crc = shall_crc(&out[..CRC_COVERED]);
    out.extend_from_slice(&crc.to_le_bytes());
    debug_assert_eq!(out.len(), RECORD_HEADER_SIZE);

    if let Some(creds) = spec.creds {
        creds.encode_into(&mut out);
    }
    for name in [spec.file1, spec.file2].into_iter().flatten() {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
    }
    spec.payload.encode_into(&mut out);
    out.resize(next_header, 0);
    Ok(out)
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub next_header: u32,
    pub operation: i32,
    pub req_sec: u64,
    pub req_nsec: u32,
    pub result: i32,
    pub flags: u32,
}

impl RecordHeader {
    #[must_use]
    pub fn op(&self) -> Option<OpCode> {
        OpCode::from_code(self.operation)
    }

    /// True for before-op records (negative operation code).
    #[must_use]
    pub fn is_before(&self) -> bool {
        self.operation < 0
    }

    /// True for the reserved debug operation.
    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.operation == 0
    }
}

/// Parse and verify a record header from the head of `bytes`.
pub fn parse_header(bytes: &[u8]) -> Result<RecordHeader, ParseError> {
    let region = ensure_slice(bytes, 0, RECORD_HEADER_SIZE)?;
    let stored = read_le_u32(region, CRC_COVERED)?;
    let computed = shall_crc(&region[..CRC_COVERED]);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }
    let header = RecordHeader {
        next_header: read_le_u32(region, 0)?,
        operation: read_le_i32(region, 4)?,
        req_sec: read_le_u64(region, 8)?,
        req_nsec: read_le_u32(region, 16)?,
        result: read_le_i32(region, 20)?,
        flags: read_le_u32(region, 24)?,
    };
    if (header.next_header as usize) < RECORD_HEADER_SIZE {
        return Err(ParseError::InvalidField {
            field: "next_header",
            reason: "shorter than the record header",
        });
    }
    if header.flags & !LOG_KNOWN != 0 {
        return Err(ParseError::InvalidField {
            field: "flags",
            reason: "unknown flag bits",
        });
    }
    Ok(header)
}

/// Fully decoded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub header: RecordHeader,
    pub creds: Option<Credentials>,
    pub file1: Option<Vec<u8>>,
    pub file2: Option<Vec<u8>>,
    pub payload: Payload,
}

fn parse_region(bytes: &[u8], offset: usize) -> Result<Region, ParseError> {
    Ok(Region {
        start: read_le_u64(bytes, offset)?,
        length: read_le_u64(bytes, offset + 8)?,
        fileid: read_le_u32(bytes, offset + 16)?,
    })
}

fn parse_name(bytes: &[u8], offset: &mut usize) -> Result<Vec<u8>, ParseError> {
    let len = read_le_u32(bytes, *offset)? as usize;
    let name = ensure_slice(bytes, *offset + NAME_LEN_SIZE, len)?.to_vec();
    *offset += NAME_LEN_SIZE + len;
    Ok(name)
}

/// Parse one complete record. `bytes` must hold at least `next_header`
/// bytes; the record's own length is returned by the header.
pub fn parse_record(bytes: &[u8]) -> Result<Record, ParseError> {
    let header = parse_header(bytes)?;
    let total = header.next_header as usize;
    let body = ensure_slice(bytes, 0, total)?;
    let mut offset = RECORD_HEADER_SIZE;

    let creds = if header.flags & LOG_CREDS != 0 {
        let creds = Credentials::decode(ensure_slice(body, offset, CREDS_SIZE)?)?;
        offset += CREDS_SIZE;
        Some(creds)
    } else {
        None
    };
    let file1 = if header.flags & LOG_FILE1 != 0 {
        Some(parse_name(body, &mut offset)?)
    } else {
        None
    };
    let file2 = if header.flags & LOG_FILE2 != 0 {
        Some(parse_name(body, &mut offset)?)
    } else {
        None
    };

    let dataflag = header.flags & LOG_DMASK;
    if dataflag != 0 && !dataflag.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field: "flags",
            reason: "more than one payload type",
        });
    }
    let payload = match dataflag {
        0 => Payload::None,
        LOG_FILEID => Payload::FileId(read_le_u32(body, offset)?),
        LOG_SIZE => Payload::Size(read_le_u64(body, offset)?),
        LOG_REGION => Payload::Region(parse_region(body, offset)?),
        LOG_ATTR => Payload::Attr(Attr {
            flags: read_le_u32(body, offset)?,
            mode: read_le_u32(body, offset + 4)?,
            user: read_le_u32(body, offset + 8)?,
            group: read_le_u32(body, offset + 12)?,
            size_or_dev: read_le_u64(body, offset + 16)?,
            atime_sec: read_le_u64(body, offset + 24)?,
            mtime_sec: read_le_u64(body, offset + 32)?,
            atime_nsec: read_le_u32(body, offset + 40)?,
            mtime_nsec: read_le_u32(body, offset + 44)?,
        }),
        LOG_ACL => {
            let count = read_le_u32(body, offset)? as usize;
            let perm = read_le_u32(body, offset + 4)?;
            let mut entries = Vec::with_capacity(count.min(256));
            let mut entry_offset = offset + ACL_HEADER_SIZE;
            for _ in 0..count {
                entries.push(AclEntry {
                    kind: read_le_u32(body, entry_offset)?,
                    name: read_le_u32(body, entry_offset + 4)?,
                });
                entry_offset += ACL_ENTRY_SIZE;
            }
            Payload::Acl(Acl { perm, entries })
        }
        LOG_XATTR => {
            let flags = read_le_u32(body, offset)?;
            let namelen = read_le_u32(body, offset + 4)? as usize;
            let valuelen = read_le_u32(body, offset + 8)? as usize;
            let name = ensure_slice(body, offset + XATTR_HEADER_SIZE, namelen)?.to_vec();
            let value =
                ensure_slice(body, offset + XATTR_HEADER_SIZE + namelen, valuelen)?.to_vec();
            Payload::Xattr(Xattr { flags, name, value })
        }
        LOG_HASH => Payload::Hash {
            region: parse_region(body, offset)?,
            digest: read_fixed::<HASH_LENGTH>(body, offset + REGION_SIZE)?,
        },
        LOG_DATA => {
            let region = parse_region(body, offset)?;
            let len = usize::try_from(region.length).map_err(|_| ParseError::InvalidField {
                field: "region.length",
                reason: "does not fit usize",
            })?;
            let bytes = ensure_slice(body, offset + REGION_SIZE, len)?.to_vec();
            Payload::Data { region, bytes }
        }
        _ => {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "unknown payload type",
            });
        }
    };

    Ok(Record {
        header,
        creds,
        file1,
        file2,
        payload,
    })
}
