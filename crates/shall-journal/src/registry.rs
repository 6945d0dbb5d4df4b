//! Process-wide mount registry.
//!
//! Maps a device identifier to its mounted engine so admin tooling can
//! find the journal for a device.

use crate::engine::Journal;
use parking_lot::Mutex;
use shall_error::{Result, ShallError};
use shall_types::DeviceId;
use std::collections::HashMap;
use std::sync::OnceLock;

fn registry() -> &'static Mutex<HashMap<DeviceId, Journal>> {
    static REGISTRY: OnceLock<Mutex<HashMap<DeviceId, Journal>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a mounted journal; fails with `Busy` if the device is already
/// mounted.
pub fn register(id: DeviceId, journal: Journal) -> Result<()> {
    let mut map = registry().lock();
    if map.contains_key(&id) {
        return Err(ShallError::Busy);
    }
    map.insert(id, journal);
    Ok(())
}

/// The journal mounted for `id`, if any.
#[must_use]
pub fn lookup(id: DeviceId) -> Option<Journal> {
    registry().lock().get(&id).cloned()
}

/// Remove a device from the registry, returning its journal.
pub fn unregister(id: DeviceId) -> Option<Journal> {
    registry().lock().remove(&id)
}

/// Ids of every registered mount.
#[must_use]
pub fn mounted_devices() -> Vec<DeviceId> {
    let mut ids: Vec<_> = registry().lock().keys().copied().collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MountOptions;
    use crate::sbio::{FormatParams, format_device};
    use shall_block::MemByteDevice;
    use std::sync::Arc;

    #[test]
    fn register_lookup_unregister_cycle() {
        let dev = Arc::new(MemByteDevice::new(1 << 20).expect("mem device"));
        format_device(&*dev, FormatParams::default()).expect("format");
        let journal = Journal::open(dev, MountOptions::default()).expect("open");

        let id = DeviceId::from_dev(0xFE, 0x1);
        register(id, journal.clone()).expect("register");
        assert!(matches!(
            register(id, journal.clone()),
            Err(ShallError::Busy)
        ));
        assert!(lookup(id).is_some());
        assert_eq!(mounted_devices(), vec![id]);
        assert!(unregister(id).is_some());
        assert!(lookup(id).is_none());
    }
}
