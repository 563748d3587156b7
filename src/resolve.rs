use log::debug;

use crate::device::{DeviceId, SectorIo, UnitIo};
use crate::drive::DriveTable;
use crate::error::FixError;
use crate::partition::RootTable;
use crate::sector::Sector;

/// Root sector of the unit read last. Consecutive drives on the same unit
/// reuse it instead of reading sector 0 again.
#[derive(Default)]
struct RootCache {
    current: Option<(DeviceId, Sector)>,
}

impl RootCache {
    fn root(&mut self, io: &mut impl SectorIo, device: DeviceId) -> Result<Sector, FixError> {
        if let Some((cached, sector)) = &self.current {
            if *cached == device {
                return Ok(sector.clone());
            }
        }
        let sector = io.read_sector(device, 0).map_err(FixError::RootSectorRead)?;
        debug!("read root sector of {device}: {}", sector.format());
        self.current = Some((device, sector.clone()));
        Ok(sector)
    }
}

/// Find the partition entry behind every placed drive.
///
/// Drives are visited in letter order. A drive whose unit can't be read,
/// whose table is corrupt or whose start sector isn't in any table is
/// excluded; the others carry on. Resolved drives start out skipped until
/// classified. Returns the number of drives resolved.
pub fn resolve_drives(io: &mut impl SectorIo, drives: &mut DriveTable) -> usize {
    let mut cache = RootCache::default();
    let mut resolved = 0;

    for drive in drives.iter_mut().filter(|d| !d.is_excluded()) {
        let Some(placement) = drive.placement else {
            continue;
        };

        let root = match cache.root(io, placement.device) {
            Ok(sector) => RootTable::decode(&sector),
            Err(e) => {
                drive.exclude(e);
                continue;
            }
        };

        let lookup = root.resolve(&mut UnitIo::new(io, placement.device), placement.start);
        match lookup.into_result() {
            Ok(located) => {
                debug!("{} -> {}", drive.letter, located.entry);
                drive.resolved = Some(located);
                drive.skipped = true;
                resolved += 1;
            }
            Err(e) => drive.exclude(e),
        }
    }

    resolved
}
