//! Human-readable rendering of decoded records, used by the dump tool.

use crate::record::{
    ACL_ACCESS_BIT, ACL_ADD, ACL_DELETE, ACL_EXECUTE, ACL_READ, ACL_WRITE, ATTR_ATIME, ATTR_BLOCK,
    ATTR_CHAR, ATTR_GROUP, ATTR_MODE, ATTR_MTIME, ATTR_SIZE, ATTR_USER, Acl, Attr, Payload,
    Record, Region,
};
use std::fmt;

fn write_escaped(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for &byte in bytes {
        if byte.is_ascii_graphic() && byte != b'%' {
            write!(f, "{}", byte as char)?;
        } else {
            write!(f, "%{byte:02x}")?;
        }
    }
    Ok(())
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

fn write_region(f: &mut fmt::Formatter<'_>, region: &Region) -> fmt::Result {
    write!(
        f,
        " id={} start={} length={}",
        region.fileid, region.start, region.length
    )
}

fn write_attr(f: &mut fmt::Formatter<'_>, attr: &Attr) -> fmt::Result {
    if attr.flags & ATTR_MODE != 0 {
        write!(f, " mode={:o}", attr.mode)?;
    }
    if attr.flags & ATTR_USER != 0 {
        write!(f, " uid={}", attr.user)?;
    }
    if attr.flags & ATTR_GROUP != 0 {
        write!(f, " gid={}", attr.group)?;
    }
    let major = attr.size_or_dev >> 32;
    let minor = attr.size_or_dev & 0xFFFF_FFFF;
    if attr.flags & ATTR_BLOCK != 0 {
        write!(f, " bdev={major:x}:{minor:x}")?;
    }
    if attr.flags & ATTR_CHAR != 0 {
        write!(f, " cdev={major:x}:{minor:x}")?;
    }
    if attr.flags & ATTR_SIZE != 0 {
        write!(f, " size={}", attr.size_or_dev)?;
    }
    if attr.flags & ATTR_ATIME != 0 {
        write!(f, " atime={}.{:09}", attr.atime_sec, attr.atime_nsec)?;
    }
    if attr.flags & ATTR_MTIME != 0 {
        write!(f, " mtime={}.{:09}", attr.mtime_sec, attr.mtime_nsec)?;
    }
    Ok(())
}

fn write_perms(
    f: &mut fmt::Formatter<'_>,
    sep: char,
    who: char,
    id: Option<u32>,
    perm: u32,
) -> fmt::Result {
    write!(f, "{sep}{who}:")?;
    if let Some(id) = id {
        write!(f, "{id}")?;
    }
    write!(
        f,
        ":{}{}{}",
        if perm & ACL_READ != 0 { 'r' } else { '-' },
        if perm & ACL_WRITE != 0 { 'w' } else { '-' },
        if perm & ACL_EXECUTE != 0 { 'x' } else { '-' },
    )?;
    if perm & ACL_ADD != 0 {
        write!(f, "a")?;
    }
    if perm & ACL_DELETE != 0 {
        write!(f, "d")?;
    }
    Ok(())
}

fn write_acl(f: &mut fmt::Formatter<'_>, acl: &Acl) -> fmt::Result {
    write!(
        f,
        "{}",
        if acl.perm & ACL_ACCESS_BIT != 0 {
            " access_acl"
        } else {
            " default_acl"
        }
    )?;
    write_perms(f, '=', 'u', None, acl.perm)?;
    write_perms(f, ',', 'g', None, acl.perm >> 7)?;
    write_perms(f, ',', 'o', None, acl.perm >> 14)?;
    write_perms(f, ',', 'm', None, acl.perm >> 21)?;
    for entry in &acl.entries {
        let who = if entry.kind & ACL_ACCESS_BIT != 0 {
            'g'
        } else {
            'u'
        };
        write_perms(f, ',', who, Some(entry.name), entry.kind)?;
    }
    Ok(())
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        write!(f, "@{}.{:09}", header.req_sec, header.req_nsec)?;
        if header.is_debug() {
            write!(f, " DEBUG")?;
        } else {
            write!(
                f,
                " {} ",
                if header.is_before() { "before" } else { "after" }
            )?;
            match header.op() {
                Some(op) => write!(f, "{}", op.name())?,
                None => write!(f, "op{}", header.operation.unsigned_abs())?,
            }
            if !header.is_before() {
                write!(f, " result={}", header.result)?;
            }
        }
        match &self.payload {
            Payload::None => {}
            Payload::FileId(fileid) => write!(f, " id={fileid}")?,
            Payload::Size(size) => write!(f, " size={size}")?,
            Payload::Region(region) => write_region(f, region)?,
            Payload::Attr(attr) => write_attr(f, attr)?,
            Payload::Acl(acl) => write_acl(f, acl)?,
            Payload::Xattr(xattr) => {
                write!(f, " xattr[")?;
                write_escaped(f, &xattr.name)?;
                write!(f, ",{:x}={}[", xattr.flags, xattr.value.len())?;
                write_escaped(f, &xattr.value)?;
                write!(f, "]")?;
            }
            Payload::Hash { region, digest } => {
                write_region(f, region)?;
                write!(f, " hash=")?;
                write_hex(f, digest)?;
            }
            Payload::Data { region, bytes } => {
                write_region(f, region)?;
                write!(f, " data=")?;
                write_hex(f, bytes)?;
            }
        }
        for name in [&self.file1, &self.file2].into_iter().flatten() {
            write!(f, " [")?;
            write_escaped(f, name)?;
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        Credentials, OpCode, RecordSpec, Timestamp, encode_record, parse_record,
    };

    fn render(spec: &RecordSpec<'_>) -> String {
        let bytes = encode_record(spec, 8).expect("encode");
        parse_record(&bytes).expect("parse").to_string()
    }

    #[test]
    fn renders_after_op_with_name() {
        let creds = Credentials::default();
        let payload = Payload::None;
        let spec = RecordSpec {
            operation: OpCode::Mkdir.after(),
            result: 0,
            timestamp: Timestamp { sec: 10, nsec: 20 },
            creds: Some(&creds),
            file1: Some(b"/tmp/dir"),
            file2: None,
            payload: &payload,
        };
        assert_eq!(
            render(&spec),
            "@10.000000020 after MKDIR result=0 [/tmp/dir]"
        );
    }

    #[test]
    fn renders_before_op_without_result() {
        let payload = Payload::None;
        let spec = RecordSpec {
            operation: OpCode::Delete.before(),
            result: 0,
            timestamp: Timestamp { sec: 1, nsec: 0 },
            creds: None,
            file1: Some(b"x"),
            file2: None,
            payload: &payload,
        };
        assert_eq!(render(&spec), "@1.000000000 before DELETE [x]");
    }

    #[test]
    fn renders_region_payload() {
        let payload = Payload::Region(Region {
            start: 512,
            length: 100,
            fileid: 4,
        });
        let spec = RecordSpec {
            operation: OpCode::Write.after(),
            result: 100,
            timestamp: Timestamp { sec: 5, nsec: 0 },
            creds: None,
            file1: None,
            file2: None,
            payload: &payload,
        };
        assert_eq!(
            render(&spec),
            "@5.000000000 after WRITE result=100 id=4 start=512 length=100"
        );
    }

    #[test]
    fn escapes_non_printable_name_bytes() {
        let payload = Payload::None;
        let spec = RecordSpec {
            operation: OpCode::Create.after(),
            result: 0,
            timestamp: Timestamp { sec: 0, nsec: 0 },
            creds: None,
            file1: Some(b"a b%c"),
            file2: None,
            payload: &payload,
        };
        assert_eq!(
            render(&spec),
            "@0.000000000 after CREATE result=0 [a%20b%25c]"
        );
    }

    #[test]
    fn renders_attr_mode_in_octal() {
        let payload = Payload::Attr(Attr {
            flags: ATTR_MODE | ATTR_USER,
            mode: 0o755,
            user: 1000,
            ..Attr::default()
        });
        let spec = RecordSpec {
            operation: OpCode::Meta.after(),
            result: 0,
            timestamp: Timestamp { sec: 0, nsec: 0 },
            creds: None,
            file1: None,
            file2: None,
            payload: &payload,
        };
        assert_eq!(
            render(&spec),
            "@0.000000000 after META result=0 mode=755 uid=1000"
        );
    }
}
