use std::fmt::Write;

use serde::Serialize;

use crate::device::DeviceId;
use crate::drive::{DriveDescriptor, DriveLetter, DriveTable};
use crate::shrink::{DrivePlan, EntryOutcome, ScannedEntry, ShrinkProposal};
use crate::sector::SECTOR_SIZE;

const MIB: u64 = 1024 * 1024;

/// Size in MiB with two decimals, the integer part zero padded to three
/// digits: `512.00`, `001.50`, `2048.01`.
pub fn format_mib(bytes: u64) -> String {
    let hundredths = (bytes * 100 + MIB / 2) / MIB;
    format!("{:03}.{:02}", hundredths / 100, hundredths % 100)
}

fn format_sectors_mib(sectors: u32) -> String {
    format_mib(sectors as u64 * SECTOR_SIZE as u64)
}

/// The drive summary printed before any change is proposed.
///
/// Excluded drives were already reported when they failed and are left
/// out; `*` only marks drives the classifier passed over.
pub fn summary_table(drives: &DriveTable) -> String {
    let mut out = String::new();
    out.push_str("Drv Bus  # Type Size   Sectors\n");
    out.push_str("--------------------------------------\n");

    let mut any_skipped = false;
    for drive in drives.iter().filter(|d| !d.is_excluded()) {
        out.push_str(&summary_row(drive));
        out.push('\n');
        any_skipped |= drive.skipped;
    }

    if any_skipped {
        out.push('\n');
        out.push_str("* skipped: past the address limit, unused\n");
        out.push_str("  partition or unsupported type\n");
    }
    out
}

fn summary_row(drive: &DriveDescriptor) -> String {
    let mut row = format!("{}  ", drive.letter);
    match drive.placement {
        Some(p) => {
            let _ = write!(row, "{:<4} {}", p.device.bus.name(), p.device.unit);
        }
        None => row.push_str("---  -"),
    }

    match (drive.resolved, drive.placement) {
        (Some(located), _) if located.entry.size() > 0 => {
            let entry = located.entry;
            let _ = write!(
                row,
                " {:<3}  {} {:07}-{:07}",
                entry.type_label(),
                format_mib(entry.size_bytes()),
                entry.start(),
                entry.last_sector()
            );
        }
        (_, Some(p)) => {
            let _ = write!(row, "             {}", p.start);
        }
        (_, None) => {}
    }

    if drive.skipped {
        row.push('*');
    }
    row
}

/// Describe the partitions found inside a drive's DOS image and what is
/// proposed for each.
pub fn plan_listing(plan: &DrivePlan) -> String {
    let mut out = format!(
        "{} MS-DOS image at sector {}\n",
        plan.letter, plan.image_sector
    );
    if plan.entries.is_empty() {
        out.push_str("  no partitions\n");
    }
    for entry in &plan.entries {
        out.push_str(&plan_line(entry));
        out.push('\n');
    }
    out
}

fn plan_line(scanned: &ScannedEntry) -> String {
    let mut line = format!(
        "  {} [{}] {:02x} {:<14} {} {:07}-{:07}",
        scanned.table_sector,
        scanned.slot,
        scanned.entry.partition_type,
        scanned.entry.partition_type_name(),
        format_sectors_mib(scanned.entry.total_sectors),
        scanned.start,
        scanned.last_sector()
    );
    if let Some(geometry) = &scanned.geometry {
        let _ = write!(line, "  {:<8} {:<5}", geometry.oem_name, geometry.fs_type);
    }
    line.push_str("  ");
    line.push_str(&describe_outcome(&scanned.outcome));
    line
}

pub fn describe_outcome(outcome: &EntryOutcome) -> String {
    match outcome {
        EntryOutcome::WithinLimits => "within limits".to_string(),
        EntryOutcome::Shrink(proposal) => describe_proposal(proposal),
        EntryOutcome::PastDriveEnd => "starts past the drive end, skipped".to_string(),
        EntryOutcome::PastAddressLimit => "starts past the address limit, skipped".to_string(),
        EntryOutcome::Rejected(e) => format!("left alone: {e}"),
    }
}

fn describe_proposal(proposal: &ShrinkProposal) -> String {
    let p = &proposal.partition;
    let mut text = format!(
        "shrink partition {} -> {} sectors",
        p.old_size, p.new_size
    );
    if let Some(v) = &proposal.volume {
        let _ = write!(text, ", volume {} -> {} sectors", v.old_total, v.new_total);
    }
    text
}

#[derive(Serialize)]
struct PlanRecord<'a> {
    drive: DriveLetter,
    device: DeviceId,
    bios_device: u16,
    image_sector: u32,
    proposals: Vec<&'a ShrinkProposal>,
}

/// Every proposal of every plan as pretty-printed JSON.
pub fn proposals_json(plans: &[DrivePlan]) -> serde_json::Result<String> {
    let records: Vec<PlanRecord<'_>> = plans
        .iter()
        .map(|plan| PlanRecord {
            drive: plan.letter,
            device: plan.device,
            bios_device: plan.device.bios_device(),
            image_sector: plan.image_sector,
            proposals: plan.proposals().collect(),
        })
        .collect();
    serde_json::to_string_pretty(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Bus;
    use crate::drive::Placement;
    use crate::error::FixError;
    use crate::partition::mbr::DosEntry;
    use crate::partition::{Located, PartitionEntry};
    use crate::shrink::{PartitionShrink, VolumeShrink};

    #[test]
    fn test_format_mib() {
        assert_eq!(format_mib(512 * MIB), "512.00");
        assert_eq!(format_mib(MIB + MIB / 2), "001.50");
        assert_eq!(format_mib(0), "000.00");
        // 1023.999 MiB rounds up into the integer part
        assert_eq!(format_mib(1024 * MIB - 1000), "1024.00");
        assert_eq!(format_mib(2_100_000 * 512), "1025.39");
    }

    fn resolved_drive(c: char) -> DriveDescriptor {
        let mut drive = DriveDescriptor::new(DriveLetter::new(c).unwrap());
        drive.placement = Some(Placement {
            device: DeviceId::new(Bus::Ide, 0),
            start: 2,
        });
        drive.resolved = Some(Located {
            entry: PartitionEntry::Ahdi {
                flags: 1,
                id: *b"BGM",
                start: 2,
                size: 1_048_576,
            },
            table_sector: 0,
            slot: 0,
        });
        drive
    }

    #[test]
    fn test_summary_rows() {
        let mut drive = resolved_drive('C');
        drive.skipped = false;
        assert_eq!(summary_row(&drive), "C:  IDE  0 BGM  512.00 0000002-1048577");

        let mut dos = resolved_drive('D');
        dos.resolved = Some(Located {
            entry: PartitionEntry::Dos {
                partition_type: 0x06,
                start: 63,
                size: 2048,
            },
            table_sector: 0,
            slot: 1,
        });
        assert_eq!(summary_row(&dos), "D:  IDE  0 06   001.00 0000063-0002110*");
    }

    #[test]
    fn test_summary_unresolved_rows() {
        let mut placed = DriveDescriptor::new(DriveLetter::new('E').unwrap());
        placed.placement = Some(Placement {
            device: DeviceId::new(Bus::Acsi, 1),
            start: 4000,
        });
        assert_eq!(summary_row(&placed), "E:  ACSI 1             4000*");

        let unmanaged = DriveDescriptor::new(DriveLetter::new('F').unwrap());
        assert_eq!(summary_row(&unmanaged), "F:  ---  -*");
    }

    #[test]
    fn test_summary_leaves_out_excluded_drives() {
        let mut drives = DriveTable::from_args(&["C", "E", "F"]).unwrap();
        let c = DriveLetter::new('C').unwrap();
        *drives.get_mut(c).unwrap() = resolved_drive('C');
        drives.get_mut(c).unwrap().skipped = false;
        drives
            .get_mut(DriveLetter::new('E').unwrap())
            .unwrap()
            .exclude(FixError::PartitionNotFound);
        drives
            .get_mut(DriveLetter::new('F').unwrap())
            .unwrap()
            .exclude(FixError::NotManaged);

        let table = summary_table(&drives);
        assert!(table.contains("C:  IDE  0 BGM"));
        assert!(!table.contains("E:"));
        assert!(!table.contains("F:"));
        assert!(!table.contains("* skipped"));
    }

    #[test]
    fn test_summary_footnote_only_when_skipped() {
        let mut drives = DriveTable::new();
        let letter = DriveLetter::new('C').unwrap();
        drives.insert(letter);
        *drives.get_mut(letter).unwrap() = resolved_drive('C');
        drives.get_mut(letter).unwrap().skipped = false;
        let table = summary_table(&drives);
        assert!(table.starts_with("Drv Bus  # Type Size   Sectors\n"));
        assert!(!table.contains("* skipped"));

        drives.get_mut(letter).unwrap().skipped = true;
        assert!(summary_table(&drives).contains("* skipped"));
    }

    fn shrink_plan() -> DrivePlan {
        let proposal = ShrinkProposal {
            partition: PartitionShrink {
                table_sector: 3,
                slot: 0,
                old_size: 4000,
                new_size: 3936,
                phys_sectors: 64,
            },
            volume: Some(VolumeShrink {
                boot_sector: 66,
                old_total: 4000,
                new_total: 3936,
                logical_sectors: 64,
            }),
        };
        DrivePlan {
            letter: DriveLetter::new('C').unwrap(),
            device: DeviceId::new(Bus::Ide, 0),
            image_sector: 3,
            entries: vec![ScannedEntry {
                table_sector: 3,
                slot: 0,
                entry: DosEntry {
                    status: 0x80,
                    partition_type: 0x06,
                    start_lba: 63,
                    total_sectors: 4000,
                },
                start: 66,
                geometry: None,
                outcome: EntryOutcome::Shrink(proposal),
            }],
        }
    }

    #[test]
    fn test_plan_listing() {
        let listing = plan_listing(&shrink_plan());
        assert!(listing.starts_with("C: MS-DOS image at sector 3\n"));
        assert!(listing.contains(
            "  3 [0] 06 FAT16 (>32MB)  001.95 0000066-0004065  shrink partition 4000 -> 3936 sectors, volume 4000 -> 3936 sectors"
        ));
    }

    #[test]
    fn test_proposals_json() {
        let json = proposals_json(&[shrink_plan()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["drive"], "C");
        assert_eq!(value[0]["device"]["bus"], "ide");
        // IDE starts at 16, after the two floppies
        assert_eq!(value[0]["bios_device"], 18);
        assert_eq!(value[0]["proposals"][0]["partition"]["new_size"], 3936);
        assert_eq!(value[0]["proposals"][0]["volume"]["boot_sector"], 66);
    }
}
