//! MPD port allocation (spec §4.8): persisted choice if present and free,
//! otherwise the lowest free port in `[6600, 6609]`.

use crate::error::CoreError;
use crate::model::PersistedDevice;

/// Picks a port for `device`, given every other device's persisted port.
/// Enforces store Invariant 2 (port uniqueness) by construction: the caller
/// must hold the store's write lock for the duration of allocate-then-persist
/// (spec §8 property law 8).
pub fn allocate(device: &PersistedDevice, in_use: &[u16]) -> Result<u16, CoreError> {
    if let Some(port) = device.mpd_port
        && !in_use.contains(&port)
    {
        return Ok(port);
    }
    PersistedDevice::MPD_PORT_RANGE
        .clone()
        .find(|candidate| !in_use.contains(candidate))
        .ok_or(CoreError::NoFreeMpdPort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceAddress;

    fn device(addr: &str, persisted_port: Option<u16>) -> PersistedDevice {
        let mut d = PersistedDevice::new_default(DeviceAddress::parse(addr).unwrap(), "Speaker".into());
        d.mpd_port = persisted_port;
        d
    }

    #[test]
    fn keeps_persisted_port_when_free() {
        let d = device("AA:BB:CC:DD:EE:01", Some(6605));
        assert_eq!(allocate(&d, &[6600, 6601]).unwrap(), 6605);
    }

    #[test]
    fn falls_back_to_lowest_free_when_persisted_is_taken() {
        let d = device("AA:BB:CC:DD:EE:01", Some(6600));
        assert_eq!(allocate(&d, &[6600]).unwrap(), 6601);
    }

    #[test]
    fn falls_back_to_lowest_free_when_unset() {
        let d = device("AA:BB:CC:DD:EE:01", None);
        assert_eq!(allocate(&d, &[6600, 6601]).unwrap(), 6602);
    }

    #[test]
    fn exhausted_range_is_no_free_port() {
        let d = device("AA:BB:CC:DD:EE:01", None);
        let all: Vec<u16> = PersistedDevice::MPD_PORT_RANGE.clone().collect();
        assert!(matches!(allocate(&d, &all), Err(CoreError::NoFreeMpdPort)));
    }

    #[test]
    fn forgetting_a_device_frees_its_port_for_reassignment() {
        // S5: two devices hold 6600/6601; forgetting the first frees 6600
        // for a newly-enabled third device.
        let third = device("AA:BB:CC:DD:EE:03", None);
        assert_eq!(allocate(&third, &[6601]).unwrap(), 6600);
    }
}
