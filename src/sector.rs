use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Physical sector size of every table and boot sector this tool touches.
pub const SECTOR_SIZE: usize = 512;

/// DOS boot signature (`55 AA` on disk) read as a little-endian word.
pub const DOS_SIGNATURE: u16 = 0xAA55;

const SIGNATURE_OFFSET: usize = 0x1FE;

/// One raw 512-byte sector, as read from (and written back to) a device.
#[derive(Clone, PartialEq, Eq)]
pub struct Sector([u8; SECTOR_SIZE]);

/// On-disk format of a root or extended table sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Dos,
    Ahdi,
}

impl Sector {
    pub fn zeroed() -> Self {
        Sector([0u8; SECTOR_SIZE])
    }

    pub fn from_bytes(bytes: [u8; SECTOR_SIZE]) -> Self {
        Sector(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.0
    }

    pub fn signature(&self) -> u16 {
        LittleEndian::read_u16(&self.0[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2])
    }

    pub fn has_dos_signature(&self) -> bool {
        self.signature() == DOS_SIGNATURE
    }

    /// Classify the sector: anything carrying the DOS signature is a DOS
    /// table, everything else is read as an AHDI root sector.
    pub fn format(&self) -> TableFormat {
        if self.has_dos_signature() {
            TableFormat::Dos
        } else {
            TableFormat::Ahdi
        }
    }
}

impl Default for Sector {
    fn default() -> Self {
        Sector::zeroed()
    }
}

impl fmt::Debug for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sector(sig={:#06X}, {:02X?}..)", self.signature(), &self.0[..8])
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableFormat::Dos => write!(f, "MBR"),
            TableFormat::Ahdi => write!(f, "AHDI"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_signature_detected() {
        let mut sector = Sector::zeroed();
        sector.as_bytes_mut()[510] = 0x55;
        sector.as_bytes_mut()[511] = 0xAA;
        assert!(sector.has_dos_signature());
        assert_eq!(sector.format(), TableFormat::Dos);
    }

    #[test]
    fn test_swapped_signature_is_ahdi() {
        let mut sector = Sector::zeroed();
        sector.as_bytes_mut()[510] = 0xAA;
        sector.as_bytes_mut()[511] = 0x55;
        assert_eq!(sector.format(), TableFormat::Ahdi);
    }

    #[test]
    fn test_blank_sector_is_ahdi() {
        assert_eq!(Sector::zeroed().format(), TableFormat::Ahdi);
    }
}
