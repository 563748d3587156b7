use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::error::FixError;
use crate::sector::Sector;

const DIR_ENTRY_SIZE: u64 = 32;

// BPB field offsets
const OEM_NAME: usize = 0x03;
const BYTES_PER_SECTOR: usize = 0x0B;
const SECTORS_PER_CLUSTER: usize = 0x0D;
const RESERVED_SECTORS: usize = 0x0E;
const FAT_COUNT: usize = 0x10;
const ROOT_ENTRIES: usize = 0x11;
const TOTAL_SECTORS_16: usize = 0x13;
const SECTORS_PER_FAT: usize = 0x16;
const HIDDEN_SECTORS: usize = 0x1C;
const TOTAL_SECTORS_32: usize = 0x20;
const FS_TYPE: usize = 0x36;

/// Logical geometry of a FAT16 volume, decoded from its boot sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootGeometry {
    pub oem_name: String,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entries: u16,
    pub total_sectors_16: u16,
    pub sectors_per_fat: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub fs_type: String,
}

impl BootGeometry {
    pub fn parse(sector: &Sector) -> Result<Self, FixError> {
        let bpb = sector.as_bytes();

        let bytes_per_sector = LittleEndian::read_u16(&bpb[BYTES_PER_SECTOR..]);
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096 | 8192) {
            return Err(FixError::NotFat16(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }

        let geometry = Self {
            oem_name: ascii_field(&bpb[OEM_NAME..OEM_NAME + 8]),
            bytes_per_sector,
            sectors_per_cluster: bpb[SECTORS_PER_CLUSTER],
            reserved_sectors: LittleEndian::read_u16(&bpb[RESERVED_SECTORS..]),
            fat_count: bpb[FAT_COUNT],
            root_entries: LittleEndian::read_u16(&bpb[ROOT_ENTRIES..]),
            total_sectors_16: LittleEndian::read_u16(&bpb[TOTAL_SECTORS_16..]),
            sectors_per_fat: LittleEndian::read_u16(&bpb[SECTORS_PER_FAT..]),
            hidden_sectors: LittleEndian::read_u32(&bpb[HIDDEN_SECTORS..]),
            total_sectors_32: LittleEndian::read_u32(&bpb[TOTAL_SECTORS_32..]),
            fs_type: ascii_field(&bpb[FS_TYPE..FS_TYPE + 7]),
        };

        if geometry.sectors_per_fat == 0 {
            // FAT32 keeps its FAT size in the extended BPB instead
            return Err(FixError::NotFat16("sectors per FAT is 0".into()));
        }

        Ok(geometry)
    }

    /// Total logical sectors: the 16-bit field unless it is zero.
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }

    pub fn volume_bytes(&self) -> u64 {
        self.total_sectors() as u64 * self.bytes_per_sector as u64
    }

    pub fn root_dir_sectors(&self) -> u64 {
        let bps = self.bytes_per_sector as u64;
        (self.root_entries as u64 * DIR_ENTRY_SIZE).div_ceil(bps)
    }

    /// Reserved sectors, every FAT copy and the root directory: the part of
    /// the volume a shrink must never cut into.
    pub fn system_sectors(&self) -> u64 {
        self.reserved_sectors as u64
            + self.fat_count as u64 * self.sectors_per_fat as u64
            + self.root_dir_sectors()
    }

    /// Rewrite the total sector count in a raw boot sector, in whichever
    /// field currently holds it. No other byte is touched.
    pub fn write_total_sectors(sector: &mut Sector, new_total: u32) -> Result<(), FixError> {
        let bpb = sector.as_bytes_mut();
        let ts16 = LittleEndian::read_u16(&bpb[TOTAL_SECTORS_16..]);
        if ts16 != 0 {
            let new16 = u16::try_from(new_total).map_err(|_| {
                FixError::NotFat16(format!("{new_total} sectors don't fit the 16-bit field"))
            })?;
            LittleEndian::write_u16(&mut bpb[TOTAL_SECTORS_16..TOTAL_SECTORS_16 + 2], new16);
        } else {
            LittleEndian::write_u32(&mut bpb[TOTAL_SECTORS_32..TOTAL_SECTORS_32 + 4], new_total);
        }
        Ok(())
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}
