//! Inspect and repair the FAT16 partitions of MS-DOS disk images hosted on
//! Atari hard disk partitions.
//!
//! A run goes through the stages below, each working on a shared
//! [`drive::DriveTable`]:
//!
//! 1. [`locate::locate_drives`]: find the unit and start sector of every
//!    requested drive letter.
//! 2. [`resolve::resolve_drives`]: find the partition table entry (DOS MBR
//!    or AHDI root sector, extended chains included) behind each drive.
//! 3. [`classify::classify_drives`]: keep FAT partitions inside the
//!    address limit.
//! 4. [`shrink::scan_drive`] and [`shrink::apply_proposal`]: cut the
//!    image's partitions and volumes back under the limit.

pub mod classify;
pub mod config;
pub mod device;
pub mod drive;
pub mod error;
pub mod fs;
pub mod locate;
pub mod partition;
pub mod report;
pub mod resolve;
pub mod sector;
pub mod shrink;

use classify::AddressLimit;
use device::SectorIo;
use drive::DriveTable;
use locate::DriveLocator;

/// Run the locate, resolve and classify stages over `drives`. Returns the
/// number of drives that resolved to a partition.
pub fn prepare_drives(
    io: &mut impl SectorIo,
    locator: &impl DriveLocator,
    drives: &mut DriveTable,
    limit: &AddressLimit,
) -> usize {
    locate::locate_drives(locator, drives);
    let resolved = resolve::resolve_drives(io, drives);
    let eligible = classify::classify_drives(drives, limit);
    log::debug!("{resolved} drives resolved, {eligible} eligible under {limit}");
    resolved
}
