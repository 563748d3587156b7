use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::sector::{Sector, SECTOR_SIZE};

/// Host bus a physical unit hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Acsi,
    Scsi,
    Ide,
}

impl Bus {
    /// First BIOS device number of this bus, relative to the first hard disk.
    pub fn device_base(&self) -> u16 {
        match self {
            Bus::Acsi => 0,
            Bus::Scsi => 8,
            Bus::Ide => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Bus::Acsi => "ACSI",
            Bus::Scsi => "SCSI",
            Bus::Ide => "IDE",
        }
    }

    /// Decode a PUN flags byte as kept by the hard disk driver.
    ///
    /// - bit 7: drive not managed by the driver
    /// - bit 4: IDE
    /// - bit 3: SCSI (ACSI when neither bit is set)
    /// - bits 0-2: unit number
    pub fn from_pun_flags(flags: u8) -> Option<DeviceId> {
        if flags & 0x80 != 0 {
            return None;
        }
        let bus = if flags & 0x10 != 0 {
            Bus::Ide
        } else if flags & 0x08 != 0 {
            Bus::Scsi
        } else {
            Bus::Acsi
        };
        Some(DeviceId {
            bus,
            unit: flags & 0x07,
        })
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A physical unit: bus plus unit index on that bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub bus: Bus,
    pub unit: u8,
}

impl DeviceId {
    pub fn new(bus: Bus, unit: u8) -> Self {
        Self { bus, unit }
    }

    /// BIOS device number used for raw sector access (floppies take 0 and 1).
    pub fn bios_device(&self) -> u16 {
        2 + self.bus.device_base() + self.unit as u16
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.bus, self.unit)
    }
}

/// Raw sector access to every unit known to the run.
///
/// Retries and media change handling belong to the implementation; callers
/// only ever ask for one sector at a time.
pub trait SectorIo {
    fn read_sector(&mut self, device: DeviceId, lba: u32) -> io::Result<Sector>;
    fn write_sector(&mut self, device: DeviceId, lba: u32, sector: &Sector) -> io::Result<()>;
}

/// Sector reads against one already-chosen unit.
pub trait SectorSource {
    fn read_sector(&mut self, lba: u32) -> io::Result<Sector>;
}

/// Sector reads and writes against one already-chosen unit.
pub trait SectorSink: SectorSource {
    fn write_sector(&mut self, lba: u32, sector: &Sector) -> io::Result<()>;
}

/// A [`SectorIo`] narrowed to one device.
pub struct UnitIo<'a, I: ?Sized> {
    io: &'a mut I,
    device: DeviceId,
}

impl<'a, I: SectorIo + ?Sized> UnitIo<'a, I> {
    pub fn new(io: &'a mut I, device: DeviceId) -> Self {
        Self { io, device }
    }
}

impl<I: SectorIo + ?Sized> SectorSource for UnitIo<'_, I> {
    fn read_sector(&mut self, lba: u32) -> io::Result<Sector> {
        self.io.read_sector(self.device, lba)
    }
}

impl<I: SectorIo + ?Sized> SectorSink for UnitIo<'_, I> {
    fn write_sector(&mut self, lba: u32, sector: &Sector) -> io::Result<()> {
        self.io.write_sector(self.device, lba, sector)
    }
}

/// A whole-disk image (file or in-memory buffer) addressed in 512-byte sectors.
#[derive(Debug)]
pub struct DiskImage<T> {
    inner: T,
}

impl<T> DiskImage<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: Read + Seek> SectorSource for DiskImage<T> {
    fn read_sector(&mut self, lba: u32) -> io::Result<Sector> {
        self.inner
            .seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        let mut buf = [0u8; SECTOR_SIZE];
        self.inner.read_exact(&mut buf)?;
        Ok(Sector::from_bytes(buf))
    }
}

impl<T: Read + Write + Seek> SectorSink for DiskImage<T> {
    fn write_sector(&mut self, lba: u32, sector: &Sector) -> io::Result<()> {
        self.inner
            .seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        self.inner.write_all(sector.as_bytes())?;
        self.inner.flush()
    }
}

/// The set of disk images standing in for the physical units of a machine.
#[derive(Debug)]
pub struct DiskImages<T> {
    units: BTreeMap<DeviceId, DiskImage<T>>,
}

impl<T> DiskImages<T> {
    pub fn new() -> Self {
        Self {
            units: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, device: DeviceId, image: T) {
        self.units.insert(device, DiskImage::new(image));
    }

    pub fn get(&self, device: DeviceId) -> Option<&DiskImage<T>> {
        self.units.get(&device)
    }

    fn image_mut(&mut self, device: DeviceId) -> io::Result<&mut DiskImage<T>> {
        self.units.get_mut(&device).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no image attached to {device}"),
            )
        })
    }
}

impl<T> Default for DiskImages<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Read + Write + Seek> SectorIo for DiskImages<T> {
    fn read_sector(&mut self, device: DeviceId, lba: u32) -> io::Result<Sector> {
        self.image_mut(device)?.read_sector(lba)
    }

    fn write_sector(&mut self, device: DeviceId, lba: u32, sector: &Sector) -> io::Result<()> {
        self.image_mut(device)?.write_sector(lba, sector)
    }
}
