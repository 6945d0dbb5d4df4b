//! Credential capture for the producer path.
//!
//! Every record stamps the six-tuple of ids of the process requesting the
//! operation. The real/effective pairs come from `getresuid`/`getresgid`;
//! the fs ids have no getter syscall, so they are read with the
//! conventional probe: `setfsuid(-1)` is an invalid id, changes nothing,
//! and returns the current value.

use shall_ondisk::record::Credentials;

/// Credentials of the calling process, captured at append time.
///
/// The underlying syscalls cannot fail for a live process.
#[must_use]
pub fn current_credentials() -> Credentials {
    let (uid, euid) = sys::resuid();
    let (gid, egid) = sys::resgid();
    Credentials {
        uid: u64::from(uid),
        euid: u64::from(euid),
        fsuid: u64::from(sys::fsuid()),
        gid: u64::from(gid),
        egid: u64::from(egid),
        fsgid: u64::from(sys::fsgid()),
    }
}

/// The raw syscalls; the only unsafe in the workspace.
#[allow(unsafe_code)]
mod sys {
    /// Real and effective uid.
    pub fn resuid() -> (libc::uid_t, libc::uid_t) {
        let mut real = 0;
        let mut effective = 0;
        let mut saved = 0;
        // SAFETY: three valid out-pointers; getresuid cannot fail with them.
        unsafe { libc::getresuid(&mut real, &mut effective, &mut saved) };
        (real, effective)
    }

    /// Real and effective gid.
    pub fn resgid() -> (libc::gid_t, libc::gid_t) {
        let mut real = 0;
        let mut effective = 0;
        let mut saved = 0;
        // SAFETY: three valid out-pointers; getresgid cannot fail with them.
        unsafe { libc::getresgid(&mut real, &mut effective, &mut saved) };
        (real, effective)
    }

    /// Current fsuid, via the no-op probe.
    pub fn fsuid() -> libc::uid_t {
        // SAFETY: -1 is not a valid uid, so the fsuid is left unchanged
        // and the previous value is returned.
        (unsafe { libc::setfsuid(libc::uid_t::MAX) }) as libc::uid_t
    }

    /// Current fsgid, via the no-op probe.
    pub fn fsgid() -> libc::gid_t {
        // SAFETY: -1 is not a valid gid, so the fsgid is left unchanged
        // and the previous value is returned.
        (unsafe { libc::setfsgid(libc::gid_t::MAX) }) as libc::gid_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_stable() {
        let first = current_credentials();
        let second = current_credentials();
        assert_eq!(first, second);
    }

    #[test]
    fn fs_ids_track_the_effective_ids() {
        // A process that never called setfsuid/setfsgid has its fs ids
        // pinned to the effective ids by the kernel.
        let creds = current_credentials();
        assert_eq!(creds.fsuid, creds.euid);
        assert_eq!(creds.fsgid, creds.egid);
    }

    #[test]
    fn probe_does_not_disturb_the_fs_ids() {
        let before = current_credentials();
        for _ in 0..3 {
            let _ = current_credentials();
        }
        let after = current_credentials();
        assert_eq!(before.fsuid, after.fsuid);
        assert_eq!(before.fsgid, after.fsgid);
    }
}
