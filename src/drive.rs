use std::collections::BTreeMap;
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceId;
use crate::error::FixError;
use crate::partition::Located;

/// First and last drive letter a hard disk partition can be mounted as.
pub const FIRST_HARD_DRIVE: char = 'C';
pub const LAST_HARD_DRIVE: char = 'P';

/// An upper-case drive letter in the `C`..=`P` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct DriveLetter(char);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DriveArgError {
    #[error("'{0}' is not a drive letter (X, X: or X:\\)")]
    Malformed(String),

    #[error("'{0}:' is outside C: - P:")]
    OutOfRange(char),
}

impl DriveLetter {
    pub fn new(c: char) -> Result<Self, DriveArgError> {
        if !c.is_ascii_alphabetic() {
            return Err(DriveArgError::Malformed(c.to_string()));
        }
        let upper = c.to_ascii_uppercase();
        if !(FIRST_HARD_DRIVE..=LAST_HARD_DRIVE).contains(&upper) {
            return Err(DriveArgError::OutOfRange(upper));
        }
        Ok(DriveLetter(upper))
    }

    /// Parse a command line drive argument: `X`, `X:` or `X:\`.
    pub fn parse_arg(arg: &str) -> Result<Self, DriveArgError> {
        let mut chars = arg.chars();
        let letter = chars
            .next()
            .ok_or_else(|| DriveArgError::Malformed(arg.to_string()))?;
        match chars.as_str() {
            "" | ":" | ":\\" => {}
            _ => return Err(DriveArgError::Malformed(arg.to_string())),
        }
        if !letter.is_ascii_alphabetic() {
            return Err(DriveArgError::Malformed(arg.to_string()));
        }
        DriveLetter::new(letter)
    }

    pub fn as_char(&self) -> char {
        self.0
    }

    /// Index into a 16-entry per-letter table (A: = 0).
    pub fn index(&self) -> usize {
        (self.0 as u8 - b'A') as usize
    }
}

impl TryFrom<char> for DriveLetter {
    type Error = DriveArgError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        DriveLetter::new(c)
    }
}

impl From<DriveLetter> for char {
    fn from(letter: DriveLetter) -> char {
        letter.0
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

/// Where a drive lives, as reported by the bus/unit resolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub device: DeviceId,
    /// First sector of the partition backing the drive.
    pub start: u32,
}

/// Everything known about one requested drive. Created before resolution
/// and filled in by each stage of the run.
#[derive(Debug)]
pub struct DriveDescriptor {
    pub letter: DriveLetter,
    pub placement: Option<Placement>,
    pub resolved: Option<Located>,
    /// Excluded from the shrink pass. Stays set unless classification
    /// finds the partition eligible.
    pub skipped: bool,
    /// Set once the drive has failed a stage; the drive is then left alone.
    pub exclusion: Option<FixError>,
}

impl DriveDescriptor {
    pub fn new(letter: DriveLetter) -> Self {
        Self {
            letter,
            placement: None,
            resolved: None,
            skipped: true,
            exclusion: None,
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.exclusion.is_some()
    }

    /// Resolved to a partition and not excluded since.
    pub fn is_resolved(&self) -> bool {
        !self.is_excluded() && self.resolved.is_some()
    }

    /// Resolved and cleared for the shrink pass.
    pub fn is_eligible(&self) -> bool {
        self.is_resolved() && !self.skipped
    }

    /// Exclude the drive from the rest of the run and report why.
    pub fn exclude(&mut self, reason: FixError) {
        warn!("Skipping '{}' drive ({reason})", self.letter);
        self.skipped = true;
        self.exclusion = Some(reason);
    }

    /// First sector past the partition, when resolved.
    pub fn end_exclusive(&self) -> Option<u64> {
        self.resolved.map(|r| r.entry.end_exclusive())
    }
}

/// Drives requested for this run, keyed and iterated in letter order.
///
/// The order matters: root sectors are cached across consecutive drives on
/// the same unit.
#[derive(Debug, Default)]
pub struct DriveTable {
    drives: BTreeMap<DriveLetter, DriveDescriptor>,
    warnings: usize,
}

impl DriveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from command line arguments.
    ///
    /// Letters outside C:-P: and repeated letters are reported and dropped;
    /// anything that isn't a drive letter at all is an error.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, DriveArgError> {
        let mut table = Self::new();
        for arg in args {
            match DriveLetter::parse_arg(arg.as_ref()) {
                Ok(letter) => {
                    if !table.insert(letter) {
                        warn!("Ignoring multiple '{letter}' drives");
                        table.warnings += 1;
                    }
                }
                Err(DriveArgError::OutOfRange(c)) => {
                    warn!("Skipping '{c}:' drive (C: - P:)");
                    table.warnings += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(table)
    }

    /// Add a drive; returns false if it was already present.
    pub fn insert(&mut self, letter: DriveLetter) -> bool {
        if self.drives.contains_key(&letter) {
            return false;
        }
        self.drives.insert(letter, DriveDescriptor::new(letter));
        true
    }

    pub fn get(&self, letter: DriveLetter) -> Option<&DriveDescriptor> {
        self.drives.get(&letter)
    }

    pub fn get_mut(&mut self, letter: DriveLetter) -> Option<&mut DriveDescriptor> {
        self.drives.get_mut(&letter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DriveDescriptor> {
        self.drives.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DriveDescriptor> {
        self.drives.values_mut()
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    /// Diagnostics raised so far, including per-drive exclusions.
    pub fn warnings(&self) -> usize {
        self.warnings + self.iter().filter(|d| d.is_excluded()).count()
    }

    pub fn resolved_count(&self) -> usize {
        self.iter().filter(|d| d.is_resolved()).count()
    }
}
