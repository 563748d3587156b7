use std::fmt;

use serde::{Deserialize, Serialize};

use crate::drive::DriveTable;
use crate::partition::{ahdi, mbr, PartitionEntry};
use crate::sector::SECTOR_SIZE;

/// The first gigabyte, in physical sectors.
pub const GIB_SECTORS: u32 = (1024 * 1024 * 1024 / SECTOR_SIZE) as u32;

/// How a partition's start is held against the address limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitPolicy {
    /// The partition must start below the limit.
    Fixed,
    /// The partition must start below the limit or below its own end.
    FixedOrDriveEnd,
}

/// Sector ceiling past which partitions are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressLimit {
    pub sectors: u32,
    pub policy: LimitPolicy,
}

impl Default for AddressLimit {
    fn default() -> Self {
        Self {
            sectors: GIB_SECTORS,
            policy: LimitPolicy::FixedOrDriveEnd,
        }
    }
}

impl AddressLimit {
    pub fn fixed(sectors: u32) -> Self {
        Self {
            sectors,
            policy: LimitPolicy::Fixed,
        }
    }

    /// Whether a partition spanning `start..end_exclusive` starts inside the limit.
    pub fn admits(&self, start: u32, end_exclusive: u64) -> bool {
        let below_limit = start < self.sectors;
        match self.policy {
            LimitPolicy::Fixed => below_limit,
            LimitPolicy::FixedOrDriveEnd => below_limit || (start as u64) < end_exclusive,
        }
    }
}

impl fmt::Display for AddressLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy = match self.policy {
            LimitPolicy::Fixed => "fixed",
            LimitPolicy::FixedOrDriveEnd => "fixed or drive end",
        };
        write!(f, "{} sectors ({policy})", self.sectors)
    }
}

/// Type or id on the FAT allow-list (and, for AHDI, marked valid).
pub fn is_fat_bearing(entry: &PartitionEntry) -> bool {
    match *entry {
        PartitionEntry::Dos { partition_type, .. } => mbr::FAT_TYPES.contains(&partition_type),
        PartitionEntry::Ahdi { flags, id, .. } => {
            flags & ahdi::FLAG_VALID != 0 && ahdi::FAT_IDS.contains(&id)
        }
    }
}

/// Decide whether a resolved partition sits out the shrink pass.
///
/// Returns `true` (skipped) unless the entry is FAT-bearing, non-empty and
/// admitted by the address limit.
pub fn classify(entry: &PartitionEntry, limit: &AddressLimit) -> bool {
    let eligible = is_fat_bearing(entry)
        && entry.size() != 0
        && limit.admits(entry.start(), entry.end_exclusive());
    !eligible
}

/// Classify every resolved drive in place. Returns the number eligible.
pub fn classify_drives(drives: &mut DriveTable, limit: &AddressLimit) -> usize {
    let mut eligible = 0;
    for drive in drives.iter_mut().filter(|d| d.is_resolved()) {
        if let Some(located) = drive.resolved {
            drive.skipped = classify(&located.entry, limit);
            if !drive.skipped {
                eligible += 1;
            }
        }
    }
    eligible
}
