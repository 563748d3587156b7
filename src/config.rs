//! Drive map: which image file stands in for which unit, and where each
//! drive letter's partition starts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;
use serde::Deserialize;

use crate::classify::AddressLimit;
use crate::device::{Bus, DeviceId, DiskImages};
use crate::drive::{DriveLetter, Placement};

/// Config file looked up when none is given on the command line.
pub const DEFAULT_CONFIG: &str = "drives.json";

#[derive(Debug, Clone, Deserialize)]
pub struct UnitImage {
    pub bus: Bus,
    pub unit: u8,
    /// Whole-disk image; relative paths are taken from the config file's directory.
    pub image: PathBuf,
}

/// One drive letter's entry in the map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DriveEntry {
    Unit {
        letter: DriveLetter,
        bus: Bus,
        unit: u8,
        start: u32,
    },
    /// Raw PUN flags byte, as the hard disk driver keeps it.
    Pun {
        letter: DriveLetter,
        pun: u8,
        start: u32,
    },
    Unmanaged {
        letter: DriveLetter,
        managed: bool,
    },
}

impl DriveEntry {
    pub fn letter(&self) -> DriveLetter {
        match self {
            DriveEntry::Unit { letter, .. }
            | DriveEntry::Pun { letter, .. }
            | DriveEntry::Unmanaged { letter, .. } => *letter,
        }
    }

    fn placement(&self) -> Result<Option<Placement>> {
        match *self {
            DriveEntry::Unit {
                bus, unit, start, ..
            } => {
                check_unit(unit)?;
                Ok(Some(Placement {
                    device: DeviceId::new(bus, unit),
                    start,
                }))
            }
            DriveEntry::Pun { pun, start, .. } => Ok(Bus::from_pun_flags(pun)
                .map(|device| Placement { device, start })),
            DriveEntry::Unmanaged { letter, managed } => {
                if managed {
                    bail!("drive {letter} is marked managed but has no bus and unit");
                }
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriveMap {
    #[serde(default)]
    pub units: Vec<UnitImage>,
    #[serde(default)]
    pub drives: Vec<DriveEntry>,
    #[serde(default)]
    pub limit: Option<AddressLimit>,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn check_unit(unit: u8) -> Result<()> {
    if unit > 7 {
        bail!("unit {unit} out of range (0-7)");
    }
    Ok(())
}

impl DriveMap {
    /// Read and validate a drive map file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read drive map {}", path.display()))?;
        let mut map = Self::parse(&text)
            .with_context(|| format!("invalid drive map {}", path.display()))?;
        map.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!(
            "loaded {} units and {} drives from {}",
            map.units.len(),
            map.drives.len(),
            path.display()
        );
        Ok(map)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let map: DriveMap = serde_json::from_str(text).context("failed to parse JSON")?;
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<()> {
        let mut devices = BTreeSet::new();
        for unit in &self.units {
            check_unit(unit.unit)?;
            let device = DeviceId::new(unit.bus, unit.unit);
            if !devices.insert(device) {
                bail!("{device} has more than one image");
            }
        }
        let mut letters = BTreeSet::new();
        for drive in &self.drives {
            if !letters.insert(drive.letter()) {
                bail!("drive {} is listed more than once", drive.letter());
            }
        }
        Ok(())
    }

    fn image_path(&self, image: &Path) -> PathBuf {
        if image.is_absolute() {
            image.to_path_buf()
        } else {
            self.base_dir.join(image)
        }
    }

    /// Per-letter placements; letters missing from the result are not managed.
    pub fn placements(&self) -> Result<BTreeMap<DriveLetter, Placement>> {
        let mut placements = BTreeMap::new();
        for drive in &self.drives {
            if let Some(placement) = drive.placement()? {
                placements.insert(drive.letter(), placement);
            }
        }
        Ok(placements)
    }

    /// Open every unit's image. Read-only images can be scanned but any
    /// write to them fails.
    pub fn open_images(&self, read_only: bool) -> Result<DiskImages<File>> {
        let mut images = DiskImages::new();
        for unit in &self.units {
            let path = self.image_path(&unit.image);
            let file = OpenOptions::new()
                .read(true)
                .write(!read_only)
                .open(&path)
                .with_context(|| format!("failed to open image {}", path.display()))?;
            let device = DeviceId::new(unit.bus, unit.unit);
            debug!("{device} -> {}", path.display());
            images.insert(device, file);
        }
        Ok(images)
    }
}
