//! Environment checks that must pass before the first mutation.

use anyhow::Result;
use duct::cmd;

use super::block::{ntfs_failure_detail, parse_ntfs_min_size};
use super::engine::shrink_target_kb;
use super::error::ConvertError;
use super::fs::FsKind;
use super::inspect::Inspector;
use super::migrate::HASH_TOOLS;
use super::runner::{Runner, ToolCommand};
use super::ui::{LogLevel, UiSink};

/// Room a freshly formatted target needs beyond the shrunk source.
const MIN_TARGET_KB: u64 = 8 * 1024;
const PART_GAP_KB: u64 = 1024;

const BASE_TOOLS: [&str; 12] = [
    "sfdisk",
    "lsblk",
    "blockdev",
    "mount",
    "umount",
    "findmnt",
    "udevadm",
    "partprobe",
    "rsync",
    "ntfsresize",
    "sync",
    "df",
];

fn required_tools(kind: FsKind) -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = BASE_TOOLS.to_vec();
    tools.push(kind.mkfs_tool());
    tools.push(kind.grow_tool());
    tools.dedup();
    tools
}

/// Check tools, partition table, swap, mounts, NTFS health and headroom.
/// Nothing on disk is touched except a possible unmount of the source.
pub fn run_preflight(
    runner: &dyn Runner,
    ui: &dyn UiSink,
    device: &str,
    source_partition: &str,
    kind: FsKind,
    use_existing_target: bool,
) -> Result<()> {
    let missing: Vec<&str> = required_tools(kind)
        .into_iter()
        .filter(|tool| !runner.has_tool(tool))
        .collect();
    if !missing.is_empty() {
        return Err(ConvertError::Preflight(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        ))
        .into());
    }

    // The partition editor must actually answer, not just exist.
    if !runner.is_simulated()
        && cmd("sfdisk", ["--version"])
            .stdout_null()
            .stderr_null()
            .run()
            .is_err()
    {
        return Err(ConvertError::Preflight("sfdisk is present but not runnable".into()).into());
    }

    if !HASH_TOOLS.iter().any(|tool| runner.has_tool(tool)) {
        ui.log(
            LogLevel::Warning,
            "no hash tool available (xxhsum/sha256sum/md5sum); \
             large files will be verified by size only",
        );
    }

    let inspector = Inspector::new(runner, ui);
    let table = inspector
        .table(device)
        .map_err(|e| ConvertError::Preflight(format!("cannot read partition table: {}", e)))?;
    if table.entry_for(source_partition).is_none() {
        return Err(ConvertError::Preflight(format!(
            "{} is not a partition of {}",
            source_partition, device
        ))
        .into());
    }

    if !runner.is_simulated() {
        let swaps = std::fs::read_to_string("/proc/swaps").unwrap_or_default();
        if device_in_swaps(&swaps, device) {
            return Err(ConvertError::Preflight(format!(
                "a partition of {} is active as swap; disable it first (swapoff)",
                device
            ))
            .into());
        }
    }

    // The engine owns the source for the duration: unmount it or refuse.
    if let Some(point) = inspector.mount_point_of(source_partition)? {
        ui.log(
            LogLevel::Info,
            &format!("{} is mounted at {}; unmounting", source_partition, point),
        );
        runner.execute(&ToolCommand::new("umount", [source_partition]))?;
        if inspector.mount_point_of(source_partition)?.is_some() {
            return Err(ConvertError::Preflight(format!(
                "{} is mounted and could not be unmounted",
                source_partition
            ))
            .into());
        }
    }

    // Mounted siblings keep the kernel from re-reading the table promptly.
    if inspector.device_has_mounts(device)? {
        ui.log(
            LogLevel::Warning,
            &format!(
                "other partitions of {} are mounted; partition table re-reads may be slow",
                device
            ),
        );
    }

    let health = runner.query(&ToolCommand::new(
        "ntfsresize",
        ["--info", "--force", source_partition],
    ))?;
    if !health.success() {
        return Err(ConvertError::Preflight(ntfs_failure_detail(
            &health.stdout,
            &health.stderr,
        ))
        .into());
    }
    if let Some(min_bytes) = parse_ntfs_min_size(&health.stdout) {
        ui.log(
            LogLevel::Info,
            &format!(
                "NTFS reports a minimum shrink size of {} KiB",
                min_bytes / 1024
            ),
        );
    }

    if !use_existing_target {
        let entry = table
            .entry_for(source_partition)
            .expect("checked above")
            .clone();
        let used_kb = inspector.used_kb(source_partition, entry.size_kb)?;
        let needed_kb = shrink_target_kb(used_kb) + PART_GAP_KB + MIN_TARGET_KB;
        let disk_total_kb = inspector.disk_total_kb(device)?;
        if needed_kb > disk_total_kb {
            return Err(ConvertError::Preflight(format!(
                "insufficient headroom: {} KiB in use, {} KiB total on {}",
                used_kb, disk_total_kb, device
            ))
            .into());
        }
    }

    Ok(())
}

/// Whether any swap entry lives on the device, per /proc/swaps content.
fn device_in_swaps(swaps: &str, device: &str) -> bool {
    swaps
        .lines()
        .skip(1) // header
        .filter_map(|line| line.split_whitespace().next())
        .any(|filename| filename.starts_with(device))
}
