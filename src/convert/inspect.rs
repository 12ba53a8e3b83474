//! Volume Inspector: pure queries over disks, partitions and volumes.
//!
//! The only side effect in this module is the temporary read-only mount a
//! `used_kb` query needs on an unmounted volume, and that mount is scoped
//! and released before the query returns.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::block::{self, MountGuard, MountMode, parse_partition_number};
use super::runner::{Runner, ToolCommand};
use super::ui::{LogLevel, UiSink};

/// One partition-table entry, in KiB.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub node: String,
    pub index: u32,
    pub start_kb: u64,
    pub size_kb: u64,
}

impl TableEntry {
    pub fn end_kb(&self) -> u64 {
        self.start_kb + self.size_kb
    }
}

/// A parsed partition table with the usable extent of the disk.
#[derive(Debug, Clone)]
pub struct DiskTable {
    pub first_usable_kb: u64,
    pub last_usable_kb: u64,
    pub entries: Vec<TableEntry>,
}

impl DiskTable {
    pub fn entry_for(&self, partition: &str) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.node == partition)
    }
}

/// A contiguous unpartitioned gap, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start_kb: u64,
    pub end_kb: u64,
}

impl FreeRegion {
    pub fn size_kb(&self) -> u64 {
        self.end_kb - self.start_kb
    }
}

/// Source-volume candidate offered in the selection menu.
#[derive(Debug, Clone)]
pub struct NtfsCandidate {
    pub device: String,
    pub partition: String,
    pub size_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRotation {
    Rotational,
    SolidState,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskPartitionTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartitionTable {
    firstlba: Option<u64>,
    lastlba: Option<u64>,
    size: Option<u64>,
    sectorsize: u64,
    partitions: Option<Vec<SfdiskPartition>>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
}

pub struct Inspector<'r> {
    runner: &'r dyn Runner,
    ui: &'r dyn UiSink,
}

impl<'r> Inspector<'r> {
    pub fn new(runner: &'r dyn Runner, ui: &'r dyn UiSink) -> Self {
        Self { runner, ui }
    }

    /// Total disk size in KiB.
    pub fn disk_total_kb(&self, device: &str) -> Result<u64> {
        let out = self
            .runner
            .query(&ToolCommand::new("blockdev", ["--getsize64", device]))?
            .expect_success("blockdev --getsize64")?;
        let bytes: u64 = out
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("unparseable blockdev output for {}", device))?;
        Ok(bytes / 1024)
    }

    /// Parse the partition table via `sfdisk -J`.
    pub fn table(&self, device: &str) -> Result<DiskTable> {
        let out = self
            .runner
            .query(&ToolCommand::new("sfdisk", ["-J", device]))?
            .expect_success("sfdisk -J")?;
        parse_table(device, &out.stdout)
    }

    /// Contiguous unpartitioned gaps on the device, found by scanning the
    /// sorted table rather than trusting index arithmetic.
    pub fn free_regions(&self, device: &str) -> Result<Vec<FreeRegion>> {
        let table = self.table(device)?;
        Ok(free_regions_of(&table))
    }

    /// Live data on the volume in KiB. Mounts read-only (scoped) when the
    /// volume is not already mounted. A failed mount degrades to a
    /// conservative estimate of 80% of the partition size, loudly.
    pub fn used_kb(&self, partition: &str, size_kb: u64) -> Result<u64> {
        if let Some(point) = self.mount_point_of(partition)? {
            return self.df_used_kb(&point);
        }

        let mount = match MountGuard::acquire(self.runner, partition, MountMode::ReadOnlyQuery) {
            Ok(mount) => mount,
            Err(e) => {
                self.ui.log(
                    LogLevel::Warning,
                    &format!(
                        "could not mount {} to measure used space ({}); assuming 80% of {} KiB",
                        partition, e, size_kb
                    ),
                );
                return Ok(size_kb * 8 / 10);
            }
        };
        let used = self.df_used_kb(&mount.path_string());
        mount.release()?;
        used
    }

    fn df_used_kb(&self, mount_point: &str) -> Result<u64> {
        let out = self
            .runner
            .query(&ToolCommand::new(
                "df",
                ["-k", "--output=used", mount_point],
            ))?
            .expect_success("df")?;
        let value = out
            .stdout
            .lines()
            .last()
            .map(str::trim)
            .unwrap_or_default();
        value
            .parse()
            .with_context(|| format!("unparseable df output: {:?}", out.stdout))
    }

    /// Where a device or partition is mounted, if anywhere.
    pub fn mount_point_of(&self, node: &str) -> Result<Option<String>> {
        let out = self
            .runner
            .query(&ToolCommand::new("findmnt", ["-n", "-o", "TARGET", node]))?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out.stdout.lines().next().map(|l| l.trim().to_string()))
    }

    /// Whether any partition of the device is mounted.
    pub fn device_has_mounts(&self, device: &str) -> Result<bool> {
        for child in self.children(device)? {
            if self.mount_point_of(&child)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Child partition nodes of a device, as full paths.
    pub fn children(&self, device: &str) -> Result<Vec<String>> {
        block::list_children(self.runner, device)
    }

    /// NTFS volumes across all disks, for the source selection menu.
    pub fn ntfs_candidates(&self) -> Result<Vec<NtfsCandidate>> {
        let out = self
            .runner
            .query(&ToolCommand::new(
                "lsblk",
                ["-J", "-b", "-o", "NAME,TYPE,SIZE,FSTYPE"],
            ))?
            .expect_success("lsblk")?;
        let json: Value =
            serde_json::from_str(&out.stdout).context("failed to parse lsblk JSON output")?;

        let mut candidates = Vec::new();
        if let Some(devices) = json.get("blockdevices").and_then(|v| v.as_array()) {
            for dev in devices {
                let dev_type = dev.get("type").and_then(|v| v.as_str()).unwrap_or("");
                let dev_name = dev.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if dev_type != "disk" || dev_name.starts_with("loop") {
                    continue;
                }
                let Some(kids) = dev.get("children").and_then(|v| v.as_array()) else {
                    continue;
                };
                for kid in kids {
                    let fstype = kid.get("fstype").and_then(|v| v.as_str()).unwrap_or("");
                    if !fstype.eq_ignore_ascii_case("ntfs") && fstype != "ntfs3" {
                        continue;
                    }
                    let name = kid.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    let size = kid.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
                    candidates.push(NtfsCandidate {
                        device: format!("/dev/{}", dev_name),
                        partition: format!("/dev/{}", name),
                        size_kb: size / 1024,
                    });
                }
            }
        }
        Ok(candidates)
    }

    /// Whether the device is backed by rotational media. Consults the
    /// kernel's sysfs flag, then lsblk's ROTA column, then S.M.A.R.T.
    pub fn rotation(&self, device: &str) -> DiskRotation {
        let base = device.trim_start_matches("/dev/").replace('/', "!");
        if let Ok(flag) = std::fs::read_to_string(format!("/sys/block/{}/queue/rotational", base)) {
            return match flag.trim() {
                "1" => DiskRotation::Rotational,
                "0" => DiskRotation::SolidState,
                _ => DiskRotation::Unknown,
            };
        }

        if let Ok(out) = self.runner.query(&ToolCommand::new(
            "lsblk",
            ["-d", "-n", "-o", "ROTA", device],
        )) && out.success()
        {
            match out.stdout.trim() {
                "1" => return DiskRotation::Rotational,
                "0" => return DiskRotation::SolidState,
                _ => {}
            }
        }

        if self.runner.has_tool("smartctl")
            && let Ok(out) = self
                .runner
                .query(&ToolCommand::new("smartctl", ["-i", device]))
            && out.success()
        {
            let info = out.stdout.to_lowercase();
            if info.contains("solid state device") {
                return DiskRotation::SolidState;
            }
            if info.contains("rotation rate") && info.contains("rpm") {
                return DiskRotation::Rotational;
            }
        }

        DiskRotation::Unknown
    }
}

fn parse_table(device: &str, json: &str) -> Result<DiskTable> {
    let output: SfdiskOutput =
        serde_json::from_str(json).context("failed to parse sfdisk JSON output")?;
    let pt = output.partitiontable;
    let sector_size = pt.sectorsize.max(512);
    let to_kb = |sectors: u64| sectors * sector_size / 1024;

    let mut partitions = pt.partitions.unwrap_or_default();
    partitions.sort_by_key(|p| p.start);

    let first_lba = pt
        .firstlba
        .or_else(|| partitions.iter().map(|p| p.start).min())
        .unwrap_or(2048);
    let last_lba = pt
        .lastlba
        .or_else(|| pt.size.map(|s| s.saturating_sub(1)))
        .or_else(|| {
            partitions
                .iter()
                .map(|p| p.start.saturating_add(p.size).saturating_sub(1))
                .max()
        })
        .map(|l| l.max(first_lba))
        .unwrap_or(first_lba);

    let mut entries = Vec::new();
    for p in partitions {
        let index = parse_partition_number(device, &p.node)
            .with_context(|| format!("unexpected partition node {:?}", p.node))?;
        entries.push(TableEntry {
            node: p.node,
            index,
            start_kb: to_kb(p.start),
            size_kb: to_kb(p.size),
        });
    }

    Ok(DiskTable {
        first_usable_kb: to_kb(first_lba),
        last_usable_kb: to_kb(last_lba + 1),
        entries,
    })
}

/// Gap scan over a sorted table. Gaps under 1 MiB are ignored.
pub fn free_regions_of(table: &DiskTable) -> Vec<FreeRegion> {
    const MIN_GAP_KB: u64 = 1024;

    let mut regions = Vec::new();
    let mut cursor = table.first_usable_kb;
    for entry in &table.entries {
        if entry.start_kb > cursor && entry.start_kb - cursor > MIN_GAP_KB {
            regions.push(FreeRegion {
                start_kb: cursor,
                end_kb: entry.start_kb,
            });
        }
        cursor = cursor.max(entry.end_kb());
    }
    if table.last_usable_kb > cursor && table.last_usable_kb - cursor > MIN_GAP_KB {
        regions.push(FreeRegion {
            start_kb: cursor,
            end_kb: table.last_usable_kb,
        });
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_maps_sectors_to_kb() {
        let json = r#"{
   "partitiontable": {
      "label": "gpt",
      "firstlba": 2048,
      "lastlba": 20971519,
      "sectorsize": 512,
      "partitions": [
         {"node": "/dev/sda1", "start": 2048, "size": 4194304}
      ]
   }
}"#;
        let table = parse_table("/dev/sda", json).unwrap();
        assert_eq!(table.first_usable_kb, 1024);
        assert_eq!(table.last_usable_kb, 10485760);
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.entries[0].index, 1);
        assert_eq!(table.entries[0].start_kb, 1024);
        assert_eq!(table.entries[0].size_kb, 2097152);
    }

    #[test]
    fn test_free_regions_finds_gaps_between_partitions() {
        let json = r#"{
   "partitiontable": {
      "label": "gpt",
      "firstlba": 2048,
      "lastlba": 200000000,
      "sectorsize": 512,
      "partitions": [
         {"node": "/dev/sda1", "start": 10000000, "size": 10000000},
         {"node": "/dev/sda2", "start": 40000000, "size": 10000000}
      ]
   }
}"#;
        let table = parse_table("/dev/sda", json).unwrap();
        let regions = free_regions_of(&table);
        assert_eq!(regions.len(), 3);
        // Leading gap, middle gap, trailing gap.
        assert_eq!(regions[0].start_kb, 1024);
        assert_eq!(regions[0].end_kb, 5000000);
        assert_eq!(regions[1].start_kb, 10000000);
        assert_eq!(regions[1].end_kb, 20000000);
        assert_eq!(regions[2].start_kb, 25000000);
        assert_eq!(regions[2].end_kb, 100000000);
    }

    #[test]
    fn test_free_regions_ignores_sub_mib_gaps() {
        let json = r#"{
   "partitiontable": {
      "label": "gpt",
      "firstlba": 2048,
      "lastlba": 10000000,
      "sectorsize": 512,
      "partitions": [
         {"node": "/dev/sda1", "start": 2048, "size": 9995904}
      ]
   }
}"#;
        let table = parse_table("/dev/sda", json).unwrap();
        assert!(free_regions_of(&table).is_empty());
    }

    #[test]
    fn test_parse_table_without_lba_fields() {
        // MBR output omits firstlba/lastlba; size stands in for the end.
        let json = r#"{
    "partitiontable": {
        "label": "dos",
        "size": 100000,
        "sectorsize": 512,
        "partitions": [
            {"node": "/dev/sdb1", "start": 2048, "size": 4096}
        ]
    }
}"#;
        let table = parse_table("/dev/sdb", json).unwrap();
        assert_eq!(table.last_usable_kb, 50000);
        let regions = free_regions_of(&table);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_kb, (2048 + 4096) / 2);
    }

    #[test]
    fn test_parse_table_nvme_naming() {
        let json = r#"{
   "partitiontable": {
      "label": "gpt",
      "firstlba": 2048,
      "lastlba": 1000000,
      "sectorsize": 512,
      "partitions": [
         {"node": "/dev/nvme0n1p3", "start": 2048, "size": 500000}
      ]
   }
}"#;
        let table = parse_table("/dev/nvme0n1", json).unwrap();
        assert_eq!(table.entries[0].index, 3);
    }
}
