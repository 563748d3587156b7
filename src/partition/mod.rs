pub mod ahdi;
pub mod mbr;

use std::fmt;

use serde::Serialize;

use crate::device::SectorSource;
use crate::error::FixError;
use crate::sector::{Sector, TableFormat};
use ahdi::{resolve_ahdi, AhdiRoot};
use mbr::{resolve_dos, DosTable};

/// Maximum number of extended links followed before a chain is declared
/// corrupt (it most likely loops back on itself).
pub const MAX_CHAIN_DEPTH: usize = 64;

/// A partition entry as found in either table format, with `start`
/// already rebased to an absolute sector on the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionEntry {
    Dos {
        partition_type: u8,
        start: u32,
        size: u32,
    },
    Ahdi {
        flags: u8,
        id: [u8; 3],
        start: u32,
        size: u32,
    },
}

impl PartitionEntry {
    pub fn start(&self) -> u32 {
        match *self {
            PartitionEntry::Dos { start, .. } | PartitionEntry::Ahdi { start, .. } => start,
        }
    }

    pub fn size(&self) -> u32 {
        match *self {
            PartitionEntry::Dos { size, .. } | PartitionEntry::Ahdi { size, .. } => size,
        }
    }

    /// First sector past the partition.
    pub fn end_exclusive(&self) -> u64 {
        self.start() as u64 + self.size() as u64
    }

    /// Last sector of the partition (equal to `start` for empty entries).
    pub fn last_sector(&self) -> u64 {
        self.end_exclusive().saturating_sub(1).max(self.start() as u64)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size() as u64 * crate::sector::SECTOR_SIZE as u64
    }

    pub fn format(&self) -> TableFormat {
        match self {
            PartitionEntry::Dos { .. } => TableFormat::Dos,
            PartitionEntry::Ahdi { .. } => TableFormat::Ahdi,
        }
    }

    /// Short type tag: two hex digits for DOS, the three-letter id for AHDI.
    pub fn type_label(&self) -> String {
        match self {
            PartitionEntry::Dos { partition_type, .. } => format!("{partition_type:02x}"),
            PartitionEntry::Ahdi { id, .. } => ahdi::id_label(id),
        }
    }
}

impl fmt::Display for PartitionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}-{}",
            self.format(),
            self.type_label(),
            self.start(),
            self.last_sector()
        )
    }
}

/// A matched entry plus where its slot lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Located {
    pub entry: PartitionEntry,
    /// Sector holding the table the entry was read from.
    pub table_sector: u32,
    pub slot: usize,
}

/// Outcome of searching a table chain for a start sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Located),
    NotFound,
    InvalidSignature,
    ChainTooDeep,
}

impl Lookup {
    pub fn into_result(self) -> Result<Located, FixError> {
        match self {
            Lookup::Found(located) => Ok(located),
            Lookup::NotFound => Err(FixError::PartitionNotFound),
            Lookup::InvalidSignature => Err(FixError::InvalidSignature),
            Lookup::ChainTooDeep => Err(FixError::ChainTooDeep {
                max: MAX_CHAIN_DEPTH,
            }),
        }
    }
}

/// A decoded root sector of either format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootTable {
    Dos(DosTable),
    Ahdi(AhdiRoot),
}

impl RootTable {
    /// Decode a root sector. Never fails: whatever lacks the DOS signature is
    /// taken to be an AHDI root sector.
    pub fn decode(sector: &Sector) -> Self {
        match sector.format() {
            TableFormat::Dos => RootTable::Dos(DosTable::parse(sector)),
            TableFormat::Ahdi => RootTable::Ahdi(AhdiRoot::parse(sector)),
        }
    }

    pub fn format(&self) -> TableFormat {
        match self {
            RootTable::Dos(_) => TableFormat::Dos,
            RootTable::Ahdi(_) => TableFormat::Ahdi,
        }
    }

    /// Search this root table (read from sector 0) and its extended chains.
    pub fn resolve(&self, source: &mut impl SectorSource, target_start: u32) -> Lookup {
        match self {
            RootTable::Dos(table) => resolve_dos(source, table, 0, 0, target_start),
            RootTable::Ahdi(root) => resolve_ahdi(source, root, target_start),
        }
    }
}
