//! Bus/unit resolution: which physical unit backs a drive letter and at
//! which sector its partition starts.

use std::collections::BTreeMap;

use crate::drive::{DriveLetter, DriveTable, Placement};
use crate::error::FixError;

/// Maps drive letters to their unit and partition start.
///
/// `None` means the drive is not managed by the hard disk driver: a floppy,
/// a RAM disk or a network drive.
pub trait DriveLocator {
    fn locate(&self, letter: DriveLetter) -> Option<Placement>;
}

impl DriveLocator for BTreeMap<DriveLetter, Placement> {
    fn locate(&self, letter: DriveLetter) -> Option<Placement> {
        self.get(&letter).copied()
    }
}

/// Fill in the placement of every drive in the table; drives the locator
/// doesn't know are excluded as not managed.
pub fn locate_drives(locator: &impl DriveLocator, drives: &mut DriveTable) {
    for drive in drives.iter_mut().filter(|d| !d.is_excluded()) {
        match locator.locate(drive.letter) {
            Some(placement) => drive.placement = Some(placement),
            None => drive.exclude(FixError::NotManaged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Bus, DeviceId};

    fn letter(c: char) -> DriveLetter {
        DriveLetter::new(c).unwrap()
    }

    #[test]
    fn test_locate_drives_excludes_unmanaged() {
        let mut map = BTreeMap::new();
        map.insert(
            letter('C'),
            Placement {
                device: DeviceId::new(Bus::Acsi, 0),
                start: 2,
            },
        );

        let mut drives = DriveTable::from_args(&["C", "D"]).unwrap();
        locate_drives(&map, &mut drives);

        let c = drives.get(letter('C')).unwrap();
        assert_eq!(c.placement.map(|p| p.start), Some(2));
        assert!(!c.is_excluded());

        let d = drives.get(letter('D')).unwrap();
        assert!(matches!(d.exclusion, Some(FixError::NotManaged)));
    }

    #[test]
    fn test_map_locator() {
        let mut map = BTreeMap::new();
        let placement = Placement {
            device: DeviceId::new(Bus::Acsi, 3),
            start: 77,
        };
        map.insert(letter('F'), placement);
        assert_eq!(map.locate(letter('F')), Some(placement));
        assert_eq!(map.locate(letter('G')), None);
    }
}
