//! Shrinking FAT16 volumes of an MS-DOS disk image back under the address
//! limit.
//!
//! Work is split in two stages. [`scan_drive`] only reads: it walks the
//! image's partition chain, decodes every boot sector and computes a
//! [`ShrinkProposal`] per partition that needs one. [`apply_proposal`] then
//! asks for confirmation and writes, one sector at a time.
//!
//! Writes are not transactional. If the partition table sector is written
//! and the boot sector write never happens, the two disagree until the
//! volume step is run again.
//!
//! The safety floor only covers the reserved sectors, the FATs and the
//! root directory. Clusters in use past the new end of the volume are not
//! checked for.

use std::collections::HashSet;

use log::{debug, info, warn};
use serde::Serialize;

use crate::classify::AddressLimit;
use crate::device::{DeviceId, SectorSink, SectorSource};
use crate::drive::{DriveDescriptor, DriveLetter};
use crate::error::FixError;
use crate::fs::fat16::BootGeometry;
use crate::partition::mbr::{follow_link, DosEntry, DosTable};
use crate::partition::MAX_CHAIN_DEPTH;
use crate::sector::SECTOR_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct ShrinkOptions {
    pub limit: AddressLimit,
    /// Only shrink partition table entries, never look at boot sectors.
    pub skip_fat_check: bool,
}

/// New size for one partition table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionShrink {
    pub table_sector: u32,
    pub slot: usize,
    pub old_size: u32,
    pub new_size: u32,
    pub phys_sectors: u32,
}

/// New total sector count for one FAT16 boot sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeShrink {
    pub boot_sector: u32,
    pub old_total: u32,
    pub new_total: u32,
    pub logical_sectors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShrinkProposal {
    pub partition: PartitionShrink,
    /// `None` when the FAT check was skipped.
    pub volume: Option<VolumeShrink>,
}

#[derive(Debug)]
pub enum EntryOutcome {
    WithinLimits,
    Shrink(ShrinkProposal),
    PastDriveEnd,
    PastAddressLimit,
    Rejected(FixError),
}

/// One data partition of the embedded image, as scanned.
#[derive(Debug)]
pub struct ScannedEntry {
    pub table_sector: u32,
    pub slot: usize,
    pub entry: DosEntry,
    /// Absolute first sector on the unit.
    pub start: u64,
    pub geometry: Option<BootGeometry>,
    pub outcome: EntryOutcome,
}

impl ScannedEntry {
    pub fn last_sector(&self) -> u64 {
        (self.start + self.entry.total_sectors as u64).saturating_sub(1)
    }
}

#[derive(Debug)]
pub struct DrivePlan {
    pub letter: DriveLetter,
    pub device: DeviceId,
    /// Sector of the embedded image's MBR; image-relative starts are based on it.
    pub image_sector: u32,
    pub entries: Vec<ScannedEntry>,
}

impl DrivePlan {
    pub fn proposals(&self) -> impl Iterator<Item = &ShrinkProposal> {
        self.entries.iter().filter_map(|e| match &e.outcome {
            EntryOutcome::Shrink(proposal) => Some(proposal),
            _ => None,
        })
    }
}

/// Physical sectors of `start..start + size` lying at or past `ceiling`.
pub fn overflow_sectors(start: u64, size: u32, ceiling: u64) -> u64 {
    (start + size as u64).saturating_sub(ceiling)
}

/// Logical sectors needed to cover `phys_sectors` physical sectors.
pub fn logical_sectors(phys_sectors: u64, bytes_per_sector: u16) -> u64 {
    (phys_sectors * SECTOR_SIZE as u64).div_ceil(bytes_per_sector as u64)
}

/// Work out the volume side of a shrink.
///
/// Fails when the volume already claims more bytes than its partition, or
/// when taking `phys_sectors` off its end would cut into the system area.
/// Returns `Ok(None)` when nothing needs to be cut.
pub fn plan_volume(
    geometry: &BootGeometry,
    boot_sector: u32,
    partition_size: u32,
    phys_sectors: u64,
) -> Result<Option<VolumeShrink>, FixError> {
    let fs_bytes = geometry.volume_bytes();
    let partition_bytes = partition_size as u64 * SECTOR_SIZE as u64;
    if fs_bytes > partition_bytes {
        return Err(FixError::FilesystemInconsistent {
            fs_bytes,
            partition_bytes,
        });
    }

    if phys_sectors == 0 {
        return Ok(None);
    }

    let cut = logical_sectors(phys_sectors, geometry.bytes_per_sector);
    let total = geometry.total_sectors() as u64;
    let floor = geometry.system_sectors();
    let new_total = total.saturating_sub(cut);
    if cut > total || new_total < floor {
        return Err(FixError::UnsafeShrink { new_total, floor });
    }

    // new_total <= total and cut <= total, both from a u32 field
    Ok(Some(VolumeShrink {
        boot_sector,
        old_total: total as u32,
        new_total: new_total as u32,
        logical_sectors: cut as u32,
    }))
}

struct ScanContext {
    image_sector: u32,
    drive_end: u64,
    options: ShrinkOptions,
}

/// Scan the MS-DOS image inside an eligible drive and propose shrinks for
/// every partition reaching past the drive's end or the address limit.
///
/// The image's MBR is the sector right after the drive's first sector.
/// Extended partitions are followed the same way the resolver does. A
/// table sector is read at most once; a chain deeper than
/// [`MAX_CHAIN_DEPTH`] fails the whole drive with
/// [`FixError::ChainTooDeep`].
pub fn scan_drive(
    source: &mut impl SectorSource,
    drive: &DriveDescriptor,
    options: &ShrinkOptions,
) -> Result<DrivePlan, FixError> {
    let placement = drive.placement.ok_or(FixError::NotManaged)?;
    let located = drive.resolved.ok_or(FixError::PartitionNotFound)?;
    let image_sector = located
        .entry
        .start()
        .checked_add(1)
        .ok_or(FixError::NoDosImage)?;

    let sector = source.read_sector(image_sector)?;
    let table = DosTable::parse(&sector);
    if !table.has_valid_signature() {
        return Err(FixError::NoDosImage);
    }

    let ctx = ScanContext {
        image_sector,
        drive_end: located.entry.end_exclusive(),
        options: *options,
    };
    let mut walk = ImageWalk {
        ctx,
        visited: HashSet::from([image_sector]),
        entries: Vec::new(),
    };
    walk.walk(source, &table, image_sector, 0, 0, 0)?;

    Ok(DrivePlan {
        letter: drive.letter,
        device: placement.device,
        image_sector,
        entries: walk.entries,
    })
}

/// Walk state of one image: every table sector already read, so a chain
/// looping back on itself is only scanned once.
struct ImageWalk {
    ctx: ScanContext,
    visited: HashSet<u32>,
    entries: Vec<ScannedEntry>,
}

impl ImageWalk {
    fn walk(
        &mut self,
        source: &mut impl SectorSource,
        table: &DosTable,
        table_sector: u32,
        prim_start: u32,
        ext_start: u32,
        depth: usize,
    ) -> Result<(), FixError> {
        for (slot, entry) in table.entries.iter().enumerate() {
            if entry.total_sectors == 0 || entry.is_extended() {
                continue;
            }
            let start = self.ctx.image_sector as u64 + prim_start as u64 + entry.start_lba as u64;
            let scanned = scan_entry(source, &self.ctx, table_sector, slot, entry, start);
            self.entries.push(scanned);
        }

        for entry in table.entries.iter().filter(|e| e.is_extended()) {
            let Some((link, chain_base)) = follow_link(entry, ext_start, prim_start) else {
                continue;
            };
            let Some(abs_link) = self.ctx.image_sector.checked_add(link) else {
                continue;
            };
            if !self.visited.insert(abs_link) {
                warn!("Skipping extended table at sector {abs_link} (already visited)");
                continue;
            }
            if depth >= MAX_CHAIN_DEPTH {
                return Err(FixError::ChainTooDeep {
                    max: MAX_CHAIN_DEPTH,
                });
            }
            let sector = match source.read_sector(abs_link) {
                Ok(sector) => sector,
                Err(e) => {
                    debug!("cannot read extended table at sector {abs_link}: {e}");
                    continue;
                }
            };
            let nested = DosTable::parse(&sector);
            if !nested.has_valid_signature() {
                warn!("Skipping extended table at sector {abs_link} (not a valid MBR)");
                continue;
            }
            self.walk(source, &nested, abs_link, link, chain_base, depth + 1)?;
        }
        Ok(())
    }
}

fn scan_entry(
    source: &mut impl SectorSource,
    ctx: &ScanContext,
    table_sector: u32,
    slot: usize,
    entry: &DosEntry,
    start: u64,
) -> ScannedEntry {
    let mut scanned = ScannedEntry {
        table_sector,
        slot,
        entry: *entry,
        start,
        geometry: None,
        outcome: EntryOutcome::WithinLimits,
    };

    let limit = ctx.options.limit.sectors as u64;
    if start >= ctx.drive_end {
        warn!("Skipping PTE[{slot}] of sector {table_sector} (starts past the drive end)");
        scanned.outcome = EntryOutcome::PastDriveEnd;
        return scanned;
    }
    if start >= limit {
        warn!("Skipping PTE[{slot}] of sector {table_sector} (starts past the address limit)");
        scanned.outcome = EntryOutcome::PastAddressLimit;
        return scanned;
    }
    // start < limit, so it fits a sector number
    let boot_sector = start as u32;

    let phys_sectors = overflow_sectors(start, entry.total_sectors, ctx.drive_end.min(limit));
    // start is below the ceiling, so the overflow is smaller than the partition
    let partition = (phys_sectors > 0).then(|| PartitionShrink {
        table_sector,
        slot,
        old_size: entry.total_sectors,
        new_size: entry.total_sectors - phys_sectors as u32,
        phys_sectors: phys_sectors as u32,
    });

    if ctx.options.skip_fat_check {
        if let Some(partition) = partition {
            scanned.outcome = EntryOutcome::Shrink(ShrinkProposal {
                partition,
                volume: None,
            });
        }
        return scanned;
    }

    if !entry.is_fat_bearing() {
        scanned.outcome = EntryOutcome::Rejected(FixError::NotFat16(format!(
            "partition type {:#04x} ({})",
            entry.partition_type,
            entry.partition_type_name()
        )));
        return scanned;
    }

    let geometry = match source
        .read_sector(boot_sector)
        .map_err(FixError::from)
        .and_then(|sector| BootGeometry::parse(&sector))
    {
        Ok(geometry) => geometry,
        Err(e) => {
            scanned.outcome = EntryOutcome::Rejected(e);
            return scanned;
        }
    };

    scanned.outcome = match plan_volume(&geometry, boot_sector, entry.total_sectors, phys_sectors) {
        Err(e) => EntryOutcome::Rejected(e),
        Ok(volume) => match partition {
            Some(partition) => EntryOutcome::Shrink(ShrinkProposal { partition, volume }),
            None => EntryOutcome::WithinLimits,
        },
    };
    scanned.geometry = Some(geometry);
    scanned
}

/// Yes/no decision on a proposed change.
pub trait Confirm {
    fn confirm(&mut self, question: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> Confirm for F {
    fn confirm(&mut self, question: &str) -> bool {
        self(question)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Declined,
}

#[derive(Debug)]
pub struct ApplyOutcome {
    pub partition: Result<StepOutcome, FixError>,
    pub volume: Option<Result<StepOutcome, FixError>>,
}

/// Ask for and apply both halves of a proposal. Each half is confirmed and
/// written on its own; a failure on one doesn't stop the other.
///
/// Every sector is read back before patching and must still hold the value
/// the proposal was computed from.
pub fn apply_proposal(
    sink: &mut impl SectorSink,
    proposal: &ShrinkProposal,
    confirm: &mut impl Confirm,
) -> ApplyOutcome {
    let partition = apply_partition(sink, &proposal.partition, confirm);
    let volume = proposal
        .volume
        .as_ref()
        .map(|volume| apply_volume(sink, volume, confirm));
    ApplyOutcome { partition, volume }
}

fn apply_partition(
    sink: &mut impl SectorSink,
    shrink: &PartitionShrink,
    confirm: &mut impl Confirm,
) -> Result<StepOutcome, FixError> {
    let question = format!(
        "Shrink PTE[{}] by {} phys. sectors?",
        shrink.slot, shrink.phys_sectors
    );
    if !confirm.confirm(&question) {
        return Ok(StepOutcome::Declined);
    }

    let mut sector = sink.read_sector(shrink.table_sector)?;
    let table = DosTable::parse(&sector);
    let current = table.entries.get(shrink.slot).map(|e| e.total_sectors);
    if !table.has_valid_signature() || current != Some(shrink.old_size) {
        return Err(FixError::StaleSector {
            sector: shrink.table_sector,
        });
    }

    DosTable::write_total_sectors(&mut sector, shrink.slot, shrink.new_size);
    sink.write_sector(shrink.table_sector, &sector)
        .map_err(|source| FixError::WriteFailure {
            sector: shrink.table_sector,
            source,
        })?;
    info!(
        "wrote partition table sector {}: PTE[{}] {} -> {} sectors",
        shrink.table_sector, shrink.slot, shrink.old_size, shrink.new_size
    );
    Ok(StepOutcome::Applied)
}

fn apply_volume(
    sink: &mut impl SectorSink,
    shrink: &VolumeShrink,
    confirm: &mut impl Confirm,
) -> Result<StepOutcome, FixError> {
    let question = format!("Shrink volume by {} log. sectors?", shrink.logical_sectors);
    if !confirm.confirm(&question) {
        return Ok(StepOutcome::Declined);
    }

    let mut sector = sink.read_sector(shrink.boot_sector)?;
    let geometry = BootGeometry::parse(&sector)?;
    if geometry.total_sectors() != shrink.old_total {
        return Err(FixError::StaleSector {
            sector: shrink.boot_sector,
        });
    }

    BootGeometry::write_total_sectors(&mut sector, shrink.new_total)?;
    sink.write_sector(shrink.boot_sector, &sector)
        .map_err(|source| FixError::WriteFailure {
            sector: shrink.boot_sector,
            source,
        })?;
    info!(
        "wrote boot sector {}: {} -> {} sectors",
        shrink.boot_sector, shrink.old_total, shrink.new_total
    );
    Ok(StepOutcome::Applied)
}
