//! End-to-end runs over in-memory units: locate, resolve, classify, scan
//! and apply, the way the command line front end chains them.
//!
//! Disks are sparse so that gigabyte-sized partitions cost a handful of
//! sectors.

use std::collections::BTreeMap;
use std::io;

use atonce_fixer::classify::{AddressLimit, LimitPolicy};
use atonce_fixer::config::DriveMap;
use atonce_fixer::device::{Bus, DeviceId, SectorIo, UnitIo};
use atonce_fixer::drive::{DriveLetter, DriveTable, Placement};
use atonce_fixer::error::FixError;
use atonce_fixer::fs::BootGeometry;
use atonce_fixer::partition::mbr::DosTable;
use atonce_fixer::prepare_drives;
use atonce_fixer::sector::Sector;
use atonce_fixer::shrink::{
    apply_proposal, scan_drive, EntryOutcome, ShrinkOptions, StepOutcome,
};

// ============================================================================
// Sector builders
// ============================================================================

fn ahdi_root(entries: &[(u8, &[u8; 3], u32, u32)], disk_sectors: u32) -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[0x1C2..0x1C6].copy_from_slice(&disk_sectors.to_be_bytes());
    for (i, (flags, id, start, size)) in entries.iter().enumerate() {
        let off = 0x1C6 + i * 12;
        buf[off] = *flags;
        buf[off + 1..off + 4].copy_from_slice(*id);
        buf[off + 4..off + 8].copy_from_slice(&start.to_be_bytes());
        buf[off + 8..off + 12].copy_from_slice(&size.to_be_bytes());
    }
    buf
}

fn dos_mbr(entries: &[(u8, u8, u32, u32)]) -> [u8; 512] {
    let mut buf = [0u8; 512];
    for (i, (status, ptype, start, size)) in entries.iter().enumerate() {
        let off = 446 + i * 16;
        buf[off] = *status;
        buf[off + 4] = *ptype;
        buf[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        buf[off + 12..off + 16].copy_from_slice(&size.to_le_bytes());
    }
    buf[510] = 0x55;
    buf[511] = 0xAA;
    buf
}

fn fat16_boot(bps: u16, reserved: u16, fats: u8, root_entries: u16, spf: u16, total: u32) -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    buf[0x03..0x0B].copy_from_slice(b"MSDOS5.0");
    buf[0x0B..0x0D].copy_from_slice(&bps.to_le_bytes());
    buf[0x0D] = 64;
    buf[0x0E..0x10].copy_from_slice(&reserved.to_le_bytes());
    buf[0x10] = fats;
    buf[0x11..0x13].copy_from_slice(&root_entries.to_le_bytes());
    if total <= u16::MAX as u32 {
        buf[0x13..0x15].copy_from_slice(&(total as u16).to_le_bytes());
    } else {
        buf[0x20..0x24].copy_from_slice(&total.to_le_bytes());
    }
    buf[0x15] = 0xF8;
    buf[0x16..0x18].copy_from_slice(&spf.to_le_bytes());
    buf[0x36..0x3E].copy_from_slice(b"FAT16   ");
    buf[510] = 0x55;
    buf[511] = 0xAA;
    buf
}

// ============================================================================
// Sparse units
// ============================================================================

/// Units made of a few written sectors; everything else reads as zeros up
/// to the unit's size.
#[derive(Default)]
struct SparseUnits {
    sizes: BTreeMap<DeviceId, u32>,
    sectors: BTreeMap<(DeviceId, u32), Sector>,
    writes: Vec<(DeviceId, u32)>,
}

impl SparseUnits {
    fn attach(&mut self, device: DeviceId, size: u32) {
        self.sizes.insert(device, size);
    }

    fn put(&mut self, device: DeviceId, lba: u32, bytes: [u8; 512]) {
        self.sectors.insert((device, lba), Sector::from_bytes(bytes));
    }

    fn check(&self, device: DeviceId, lba: u32) -> io::Result<()> {
        match self.sizes.get(&device) {
            Some(&size) if lba < size => Ok(()),
            Some(_) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "past end of unit")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such unit")),
        }
    }
}

impl SectorIo for SparseUnits {
    fn read_sector(&mut self, device: DeviceId, lba: u32) -> io::Result<Sector> {
        self.check(device, lba)?;
        Ok(self
            .sectors
            .get(&(device, lba))
            .cloned()
            .unwrap_or_default())
    }

    fn write_sector(&mut self, device: DeviceId, lba: u32, sector: &Sector) -> io::Result<()> {
        self.check(device, lba)?;
        self.writes.push((device, lba));
        self.sectors.insert((device, lba), sector.clone());
        Ok(())
    }
}

fn letter(c: char) -> DriveLetter {
    DriveLetter::new(c).unwrap()
}

fn placements(entries: &[(char, DeviceId, u32)]) -> BTreeMap<DriveLetter, Placement> {
    entries
        .iter()
        .map(|&(c, device, start)| (letter(c), Placement { device, start }))
        .collect()
}

const ACSI0: DeviceId = DeviceId {
    bus: Bus::Acsi,
    unit: 0,
};
const IDE0: DeviceId = DeviceId {
    bus: Bus::Ide,
    unit: 0,
};

/// Two gigabytes, so only the drive's own end constrains the image.
fn wide_limit() -> AddressLimit {
    AddressLimit {
        sectors: 4_194_304,
        policy: LimitPolicy::FixedOrDriveEnd,
    }
}

/// A BGM drive at sector 2 hosting a DOS image whose single FAT16
/// partition starts at absolute sector 2048, with room for exactly
/// 2097152 sectors before the drive ends.
fn hosted_fat16(size: u32, boot: [u8; 512]) -> SparseUnits {
    let drive_size = 2048 + 2_097_152 - 2;
    let mut units = SparseUnits::default();
    units.attach(ACSI0, 2 + drive_size + 16);
    units.put(ACSI0, 0, ahdi_root(&[(0x01, b"BGM", 2, drive_size)], 2 + drive_size));
    // image MBR at 3; its entries are relative to it
    units.put(ACSI0, 3, dos_mbr(&[(0x80, 0x06, 2045, size)]));
    units.put(ACSI0, 2048, boot);
    units
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn scenario_a_partition_within_limits() {
    let mut units = hosted_fat16(2_097_152, fat16_boot(512, 4, 2, 512, 256, 2_097_152));
    let mut drives = DriveTable::from_args(&["C"]).unwrap();
    let limit = wide_limit();

    let resolved = prepare_drives(&mut units, &placements(&[('C', ACSI0, 2)]), &mut drives, &limit);
    assert_eq!(resolved, 1);

    let drive = drives.get(letter('C')).unwrap();
    assert!(drive.is_eligible());

    let options = ShrinkOptions {
        limit,
        skip_fat_check: false,
    };
    let plan = scan_drive(&mut UnitIo::new(&mut units, ACSI0), drive, &options).unwrap();
    assert_eq!(plan.entries.len(), 1);
    assert_eq!(plan.entries[0].start, 2048);
    assert!(matches!(plan.entries[0].outcome, EntryOutcome::WithinLimits));
    assert_eq!(plan.proposals().count(), 0);
    assert!(units.writes.is_empty());
}

#[test]
fn scenario_b_oversized_partition_is_shrunk() {
    let mut units = hosted_fat16(2_100_000, fat16_boot(512, 4, 2, 512, 256, 2_100_000));
    let mut drives = DriveTable::from_args(&["C:"]).unwrap();
    let limit = wide_limit();
    prepare_drives(&mut units, &placements(&[('C', ACSI0, 2)]), &mut drives, &limit);

    let options = ShrinkOptions {
        limit,
        skip_fat_check: false,
    };
    let drive = drives.get(letter('C')).unwrap();
    let plan = scan_drive(&mut UnitIo::new(&mut units, ACSI0), drive, &options).unwrap();
    let proposal = *plan.proposals().next().unwrap();

    assert_eq!(proposal.partition.phys_sectors, 2848);
    assert_eq!(proposal.partition.new_size, 2_097_152);
    assert_eq!(proposal.partition.table_sector, 3);
    let volume = proposal.volume.unwrap();
    assert_eq!(volume.logical_sectors, 2848);
    assert_eq!(volume.new_total, 2_097_152);

    let mut asked = 0;
    let outcome = apply_proposal(
        &mut UnitIo::new(&mut units, ACSI0),
        &proposal,
        &mut |_: &str| {
            asked += 1;
            true
        },
    );
    assert_eq!(asked, 2);
    assert_eq!(outcome.partition.unwrap(), StepOutcome::Applied);
    assert_eq!(outcome.volume.unwrap().unwrap(), StepOutcome::Applied);
    assert_eq!(units.writes, vec![(ACSI0, 3), (ACSI0, 2048)]);

    let table = DosTable::parse(&units.read_sector(ACSI0, 3).unwrap());
    assert_eq!(table.entries[0].total_sectors, 2_097_152);
    assert_eq!(table.entries[0].start_lba, 2045);
    assert_eq!(table.entries[0].partition_type, 0x06);
    let geometry = BootGeometry::parse(&units.read_sector(ACSI0, 2048).unwrap()).unwrap();
    assert_eq!(geometry.total_sectors(), 2_097_152);
    assert_eq!(geometry.total_sectors_16, 0);
    assert_eq!(geometry.sectors_per_fat, 256);

    // the image now fits: a second scan finds nothing to do
    let drive = drives.get(letter('C')).unwrap();
    let plan = scan_drive(&mut UnitIo::new(&mut units, ACSI0), drive, &options).unwrap();
    assert!(matches!(plan.entries[0].outcome, EntryOutcome::WithinLimits));
}

#[test]
fn test_fixed_limit_cuts_below_drive_end() {
    // The drive runs to 3000002, well past a fixed 1 GiB limit; the image
    // partition at 2048 crosses the limit but not the drive end
    let drive_size = 3_000_000;
    let mut units = SparseUnits::default();
    units.attach(ACSI0, 2 + drive_size + 16);
    units.put(ACSI0, 0, ahdi_root(&[(0x01, b"BGM", 2, drive_size)], 2 + drive_size));
    units.put(ACSI0, 3, dos_mbr(&[(0x00, 0x06, 2045, 2_500_000)]));
    units.put(ACSI0, 2048, fat16_boot(2048, 1, 2, 512, 256, 625_000));

    let mut drives = DriveTable::from_args(&["C"]).unwrap();
    let limit = AddressLimit::fixed(2_097_152);
    prepare_drives(&mut units, &placements(&[('C', ACSI0, 2)]), &mut drives, &limit);
    let drive = drives.get(letter('C')).unwrap();
    assert!(drive.is_eligible());

    let options = ShrinkOptions {
        limit,
        skip_fat_check: false,
    };
    let plan = scan_drive(&mut UnitIo::new(&mut units, ACSI0), drive, &options).unwrap();
    let proposal = *plan.proposals().next().unwrap();

    // 2048 + 2500000 - 2097152
    assert_eq!(proposal.partition.phys_sectors, 404_896);
    assert_eq!(proposal.partition.new_size, 2_095_104);
    assert_eq!(2048 + proposal.partition.new_size, limit.sectors);
    let volume = proposal.volume.unwrap();
    // 404896 physical sectors are 101224 logical sectors of 2 KiB
    assert_eq!(volume.logical_sectors, 101_224);
    assert_eq!(volume.new_total, 625_000 - 101_224);
    assert_eq!(
        volume.new_total as u64 * 2048,
        proposal.partition.new_size as u64 * 512
    );

    let outcome = apply_proposal(&mut UnitIo::new(&mut units, ACSI0), &proposal, &mut |_: &str| true);
    assert_eq!(outcome.partition.unwrap(), StepOutcome::Applied);
    assert_eq!(outcome.volume.unwrap().unwrap(), StepOutcome::Applied);
    let table = DosTable::parse(&units.read_sector(ACSI0, 3).unwrap());
    assert_eq!(table.entries[0].total_sectors, 2_095_104);
    let geometry = BootGeometry::parse(&units.read_sector(ACSI0, 2048).unwrap()).unwrap();
    assert_eq!(geometry.total_sectors(), 523_776);
}

#[test]
fn scenario_b_shrink_into_system_area_is_rejected() {
    // 8 KiB logical sectors: 2100000 physical sectors are 131250 logical ones,
    // and the FATs alone take 131070 of them
    let mut units = hosted_fat16(2_100_000, fat16_boot(8192, 1, 2, 512, 65535, 131_250));
    let mut drives = DriveTable::from_args(&["C"]).unwrap();
    let limit = wide_limit();
    prepare_drives(&mut units, &placements(&[('C', ACSI0, 2)]), &mut drives, &limit);

    let options = ShrinkOptions {
        limit,
        skip_fat_check: false,
    };
    let drive = drives.get(letter('C')).unwrap();
    let plan = scan_drive(&mut UnitIo::new(&mut units, ACSI0), drive, &options).unwrap();
    match &plan.entries[0].outcome {
        EntryOutcome::Rejected(FixError::UnsafeShrink { new_total, floor }) => {
            assert_eq!(*new_total, 131_250 - 178);
            assert_eq!(*floor, 1 + 2 * 65535 + 2);
        }
        other => panic!("expected UnsafeShrink, got {other:?}"),
    }
    assert_eq!(plan.proposals().count(), 0);
}

#[test]
fn scenario_c_bgm_partition_found_and_eligible() {
    let mut units = SparseUnits::default();
    units.attach(ACSI0, 1);
    units.put(
        ACSI0,
        0,
        ahdi_root(&[(0x01, b"GEM", 2, 60_000), (0x01, b"BGM", 60_002, 500_000)], 600_000),
    );
    let mut drives = DriveTable::from_args(&["D"]).unwrap();

    let resolved = prepare_drives(
        &mut units,
        &placements(&[('D', ACSI0, 60_002)]),
        &mut drives,
        &AddressLimit::default(),
    );
    assert_eq!(resolved, 1);

    let drive = drives.get(letter('D')).unwrap();
    let located = drive.resolved.unwrap();
    assert_eq!(located.slot, 1);
    assert_eq!(located.entry.type_label(), "BGM");
    assert!(!drive.skipped);
}

#[test]
fn scenario_d_xgm_chain_without_match_excludes_drive() {
    let mut units = SparseUnits::default();
    units.attach(ACSI0, 2000);
    units.put(ACSI0, 0, ahdi_root(&[(0x01, b"XGM", 1000, 900)], 2000));
    // first link: one data partition at 1000+1, no further link
    units.put(ACSI0, 1000, ahdi_root(&[(0x01, b"GEM", 1, 800)], 0));
    units.attach(IDE0, 1);
    units.put(IDE0, 0, dos_mbr(&[(0x00, 0x06, 63, 10_000)]));

    let mut drives = DriveTable::from_args(&["C", "D"]).unwrap();
    let resolved = prepare_drives(
        &mut units,
        &placements(&[('C', ACSI0, 2), ('D', IDE0, 63)]),
        &mut drives,
        &AddressLimit::default(),
    );

    assert_eq!(resolved, 1);
    let c = drives.get(letter('C')).unwrap();
    assert!(matches!(c.exclusion, Some(FixError::PartitionNotFound)));
    assert!(c.skipped);
    let d = drives.get(letter('D')).unwrap();
    assert!(d.is_eligible());
    assert_eq!(drives.warnings(), 1);
}

// ============================================================================
// Failure isolation and configuration
// ============================================================================

#[test]
fn test_run_continues_past_failing_drives() {
    let mut units = SparseUnits::default();
    units.attach(IDE0, 1);
    units.put(IDE0, 0, dos_mbr(&[(0x00, 0x0E, 2048, 4096), (0x00, 0x83, 8192, 4096)]));

    // C: not managed, D: no image for SCSI 0, E: fine, F: Linux partition
    let scsi0 = DeviceId::new(Bus::Scsi, 0);
    let mut drives = DriveTable::from_args(&["c", "d", "e", "f", "e:"]).unwrap();
    let resolved = prepare_drives(
        &mut units,
        &placements(&[('D', scsi0, 2), ('E', IDE0, 2048), ('F', IDE0, 8192)]),
        &mut drives,
        &AddressLimit::default(),
    );

    assert_eq!(resolved, 2);
    assert!(matches!(
        drives.get(letter('C')).unwrap().exclusion,
        Some(FixError::NotManaged)
    ));
    assert!(matches!(
        drives.get(letter('D')).unwrap().exclusion,
        Some(FixError::RootSectorRead(_))
    ));
    assert!(drives.get(letter('E')).unwrap().is_eligible());
    let f = drives.get(letter('F')).unwrap();
    assert!(f.is_resolved());
    assert!(f.skipped);
    // two exclusions plus the repeated E:
    assert_eq!(drives.warnings(), 3);
}

#[test]
fn test_drive_without_dos_image() {
    let mut units = SparseUnits::default();
    units.attach(ACSI0, 100);
    units.put(ACSI0, 0, ahdi_root(&[(0x01, b"BGM", 2, 90)], 100));
    let mut drives = DriveTable::from_args(&["C"]).unwrap();
    let limit = AddressLimit::default();
    prepare_drives(&mut units, &placements(&[('C', ACSI0, 2)]), &mut drives, &limit);

    let options = ShrinkOptions {
        limit,
        skip_fat_check: false,
    };
    let drive = drives.get(letter('C')).unwrap();
    assert!(matches!(
        scan_drive(&mut UnitIo::new(&mut units, ACSI0), drive, &options),
        Err(FixError::NoDosImage)
    ));
}

#[test]
fn test_config_file_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();

    // BGM drive at 2 (100 sectors), image MBR at 3, FAT16 partition at 3+10
    // running 11 sectors past the drive's end
    let mut image = vec![0u8; 120 * 512];
    let mut put = |lba: usize, bytes: [u8; 512]| {
        image[lba * 512..(lba + 1) * 512].copy_from_slice(&bytes);
    };
    put(0, ahdi_root(&[(0x81, b"BGM", 2, 100)], 120));
    put(3, dos_mbr(&[(0x80, 0x06, 10, 100)]));
    put(13, fat16_boot(512, 1, 2, 16, 1, 100));
    std::fs::write(dir.path().join("acsi0.img"), &image).unwrap();

    let config = dir.path().join("drives.json");
    std::fs::write(
        &config,
        r#"{
            "units": [ { "bus": "acsi", "unit": 0, "image": "acsi0.img" } ],
            "drives": [ { "letter": "C", "pun": 0, "start": 2 } ]
        }"#,
    )
    .unwrap();

    let map = DriveMap::load(&config).unwrap();
    let limit = map.limit.unwrap_or_default();
    let mut io = map.open_images(false).unwrap();
    let mut drives = DriveTable::from_args(&["C"]).unwrap();
    assert_eq!(
        prepare_drives(&mut io, &map.placements().unwrap(), &mut drives, &limit),
        1
    );

    let options = ShrinkOptions {
        limit,
        skip_fat_check: false,
    };
    let drive = drives.get(letter('C')).unwrap();
    let plan = scan_drive(&mut UnitIo::new(&mut io, ACSI0), drive, &options).unwrap();
    let proposal = *plan.proposals().next().unwrap();
    assert_eq!(proposal.partition.new_size, 89);
    assert_eq!(proposal.volume.map(|v| v.new_total), Some(89));

    let outcome = apply_proposal(&mut UnitIo::new(&mut io, ACSI0), &proposal, &mut |_: &str| true);
    assert!(outcome.partition.is_ok());
    assert!(matches!(outcome.volume, Some(Ok(StepOutcome::Applied))));
    drop(io);

    let written = std::fs::read(dir.path().join("acsi0.img")).unwrap();
    let size_field = &written[3 * 512 + 458..3 * 512 + 462];
    assert_eq!(u32::from_le_bytes(size_field.try_into().unwrap()), 89);
    let total16 = &written[13 * 512 + 0x13..13 * 512 + 0x15];
    assert_eq!(u16::from_le_bytes(total16.try_into().unwrap()), 89);
}
