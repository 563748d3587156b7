use byteorder::{BigEndian, ByteOrder};
use log::debug;
use serde::Serialize;

use super::{Located, Lookup, PartitionEntry, MAX_CHAIN_DEPTH};
use crate::device::SectorSource;
use crate::sector::Sector;

// The four primary slots follow the disk size field; ICD slots, the bad
// sector list and the checksum are never read.
const PARTITION_TABLE_OFFSET: usize = 0x1C6;
const PARTITION_ENTRY_SIZE: usize = 12;

pub const FLAG_VALID: u8 = 0x01;

/// Id of an extended chain link. Never a data partition.
pub const CHAIN_LINK_ID: [u8; 3] = *b"XGM";

/// GEM (< 32 MB) and BGM (big GEM) partitions carry a FAT-style filesystem.
pub const FAT_IDS: [[u8; 3]; 2] = [*b"GEM", *b"BGM"];

/// One AHDI/ICD partition slot. Fields are big-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AhdiEntry {
    pub flags: u8,
    pub id: [u8; 3],
    pub start: u32,
    pub size: u32,
}

impl AhdiEntry {
    fn parse(data: &[u8]) -> Self {
        Self {
            flags: data[0],
            id: [data[1], data[2], data[3]],
            start: BigEndian::read_u32(&data[4..8]),
            size: BigEndian::read_u32(&data[8..12]),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    pub fn is_chain_link(&self) -> bool {
        self.id == CHAIN_LINK_ID
    }

}

/// Printable form of a partition id, `.` standing in for anything else.
pub fn id_label(id: &[u8; 3]) -> String {
    id.iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}

/// Decoded AHDI root sector (also the layout of every XGM extended sector).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AhdiRoot {
    pub entries: [AhdiEntry; 4],
}

impl AhdiRoot {
    pub fn parse(sector: &Sector) -> Self {
        let data = sector.as_bytes();
        Self {
            entries: std::array::from_fn(|i| {
                let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
                AhdiEntry::parse(&data[offset..offset + PARTITION_ENTRY_SIZE])
            }),
        }
    }
}

fn matches_target(entry: &AhdiEntry, target_start: u32) -> bool {
    !entry.is_chain_link() && entry.start == target_start
}

fn located(entry: &AhdiEntry, table_sector: u32, slot: usize) -> Lookup {
    Lookup::Found(Located {
        entry: PartitionEntry::Ahdi {
            flags: entry.flags,
            id: entry.id,
            start: entry.start,
            size: entry.size,
        },
        table_sector,
        slot,
    })
}

/// Find the partition starting at `target_start` in an AHDI root sector,
/// following XGM chains hop by hop.
///
/// Each XGM sector uses two slots: slot 0 describes a partition relative to
/// the XGM sector itself, slot 1 links to the next XGM sector relative to
/// the first one of the chain.
pub fn resolve_ahdi(source: &mut impl SectorSource, root: &AhdiRoot, target_start: u32) -> Lookup {
    for (slot, primary) in root.entries.iter().enumerate() {
        if matches_target(primary, target_start) {
            return located(primary, 0, slot);
        }

        let chain_base = primary.start;
        let mut link = *primary;
        let mut link_sector = primary.start;
        let mut hops = 0;

        while link.is_valid() && link.is_chain_link() {
            if hops >= MAX_CHAIN_DEPTH {
                return Lookup::ChainTooDeep;
            }
            hops += 1;

            let sector = match source.read_sector(link_sector) {
                Ok(sector) => sector,
                Err(e) => {
                    debug!("cannot read XGM sector {link_sector}: {e}");
                    break;
                }
            };
            let extended = AhdiRoot::parse(&sector);

            let mut data = extended.entries[0];
            match data.start.checked_add(link_sector) {
                Some(start) => data.start = start,
                None => break,
            }
            if matches_target(&data, target_start) {
                return located(&data, link_sector, 0);
            }

            link = extended.entries[1];
            link_sector = match chain_base.checked_add(link.start) {
                Some(next) => next,
                None => break,
            };
        }
    }

    Lookup::NotFound
}
