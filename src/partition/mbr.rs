use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use serde::Serialize;

use super::{Located, Lookup, PartitionEntry, MAX_CHAIN_DEPTH};
use crate::device::SectorSource;
use crate::sector::{Sector, DOS_SIGNATURE};

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;

/// FAT12/FAT16 types this tool knows how to shrink.
///
/// - 0x01: FAT12 (first 32 MB as primary, anywhere as logical)
/// - 0x04: FAT16 with fewer than 65536 sectors
/// - 0x06: FAT16B, first 8 GB unless inside an 0x0F container
/// - 0x0E: FAT16B with LBA
pub const FAT_TYPES: [u8; 4] = [0x01, 0x04, 0x06, 0x0E];

/// A single DOS partition table entry.
///
/// Start and size are stored little-endian on disk regardless of the host,
/// so they are always decoded with an explicit byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DosEntry {
    pub status: u8,
    pub partition_type: u8,
    pub start_lba: u32,
    pub total_sectors: u32,
}

impl DosEntry {
    fn parse(data: &[u8]) -> Self {
        Self {
            status: data[0],
            partition_type: data[4],
            start_lba: LittleEndian::read_u32(&data[8..12]),
            total_sectors: LittleEndian::read_u32(&data[12..16]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partition_type == 0x00 && self.start_lba == 0 && self.total_sectors == 0
    }

    /// Extended container (CHS or LBA addressed) linking to another table.
    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, 0x05 | 0x0F)
    }

    pub fn is_fat_bearing(&self) -> bool {
        FAT_TYPES.contains(&self.partition_type)
    }

    pub fn partition_type_name(&self) -> &'static str {
        match self.partition_type {
            0x00 => "Empty",
            0x01 => "FAT12",
            0x04 => "FAT16 (<32MB)",
            0x05 => "Extended",
            0x06 => "FAT16 (>32MB)",
            0x0E => "FAT16 (LBA)",
            0x0F => "Extended (LBA)",
            _ => "Unknown",
        }
    }
}

/// The four-slot DOS table of an MBR or EBR sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DosTable {
    pub entries: [DosEntry; 4],
    pub signature: u16,
}

impl DosTable {
    /// Decode the table without judging it; see [`DosTable::has_valid_signature`].
    pub fn parse(sector: &Sector) -> Self {
        let data = sector.as_bytes();
        let entries = std::array::from_fn(|i| {
            let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            DosEntry::parse(&data[offset..offset + PARTITION_ENTRY_SIZE])
        });
        Self {
            entries,
            signature: sector.signature(),
        }
    }

    pub fn has_valid_signature(&self) -> bool {
        self.signature == DOS_SIGNATURE
    }

    /// Overwrite the size field of one slot in a raw table sector.
    pub fn write_total_sectors(sector: &mut Sector, slot: usize, total_sectors: u32) {
        let offset = PARTITION_TABLE_OFFSET + slot * PARTITION_ENTRY_SIZE + 12;
        LittleEndian::write_u32(&mut sector.as_bytes_mut()[offset..offset + 4], total_sectors);
    }
}

/// Address of the table an extended link points at.
///
/// The first link met (`ext_start == 0`) is relative to the current table
/// and fixes the chain base; every later link is relative to that base.
/// Returns `(link_sector, ext_start)` or `None` when the sum leaves the
/// 32-bit sector space.
pub(crate) fn follow_link(entry: &DosEntry, ext_start: u32, prim_start: u32) -> Option<(u32, u32)> {
    if ext_start == 0 {
        let link = prim_start.checked_add(entry.start_lba)?;
        Some((link, link))
    } else {
        let link = ext_start.checked_add(entry.start_lba)?;
        Some((link, ext_start))
    }
}

/// Find the data partition starting at `target_start` in a DOS table chain.
///
/// `prim_start` is the sector `table` was read from; `ext_start` is the
/// first extended root met so far (0 while still in the MBR). Data slots of
/// one level are all checked before any extended link is followed; each
/// link costs one sector read. A link that can't be read is treated as a
/// dead end, not an error.
pub fn resolve_dos(
    source: &mut impl SectorSource,
    table: &DosTable,
    prim_start: u32,
    ext_start: u32,
    target_start: u32,
) -> Lookup {
    walk(source, table, prim_start, ext_start, target_start, 0)
}

fn walk(
    source: &mut impl SectorSource,
    table: &DosTable,
    prim_start: u32,
    ext_start: u32,
    target_start: u32,
    depth: usize,
) -> Lookup {
    if !table.has_valid_signature() {
        return Lookup::InvalidSignature;
    }

    for (slot, entry) in table.entries.iter().enumerate() {
        if entry.is_extended() || entry.is_empty() {
            continue;
        }
        if prim_start as u64 + entry.start_lba as u64 == target_start as u64 {
            return Lookup::Found(Located {
                entry: PartitionEntry::Dos {
                    partition_type: entry.partition_type,
                    start: target_start,
                    size: entry.total_sectors,
                },
                table_sector: prim_start,
                slot,
            });
        }
    }

    for entry in table.entries.iter().filter(|e| e.is_extended()) {
        if depth >= MAX_CHAIN_DEPTH {
            return Lookup::ChainTooDeep;
        }
        let Some((link, chain_base)) = follow_link(entry, ext_start, prim_start) else {
            debug!("extended link at sector {prim_start} points past 2^32 sectors");
            continue;
        };
        let sector = match source.read_sector(link) {
            Ok(sector) => sector,
            Err(e) => {
                debug!("cannot read extended table at sector {link}: {e}");
                continue;
            }
        };
        let nested = DosTable::parse(&sector);
        match walk(source, &nested, link, chain_base, target_start, depth + 1) {
            Lookup::NotFound => {}
            other => return other,
        }
    }

    Lookup::NotFound
}
