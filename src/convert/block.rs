//! Block Layer Adapter: partition-table mutation, filesystem creation and
//! resize, scoped mounts, kernel re-probe convergence.
//!
//! Every operation here goes through the process seam, so the same code
//! drives real block devices, dry runs, and the simulated backend.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::error::ConvertError;
use super::fs::{FsKind, GrowStrategy};
use super::inspect::TableEntry;
use super::runner::{Runner, ToolCommand, ToolOutput};
use super::ui::{LogLevel, UiSink};

const REPROBE_CAP: Duration = Duration::from_secs(10);
const REPROBE_POLL: Duration = Duration::from_millis(500);
const UNMOUNT_RETRIES: u32 = 3;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Partition path for a disk and index, honoring the `p` infix convention
/// of devices whose name ends in a digit (nvme0n1p1, mmcblk0p2).
pub fn get_part_path(disk: &str, part_num: u32) -> String {
    if disk.chars().last().unwrap_or(' ').is_numeric() {
        format!("{}p{}", disk, part_num)
    } else {
        format!("{}{}", disk, part_num)
    }
}

/// Inverse of [`get_part_path`].
pub fn parse_partition_number(disk_path: &str, partition_path: &str) -> Result<u32> {
    let disk_name = disk_path.strip_prefix("/dev/").unwrap_or(disk_path);
    let part_name = partition_path
        .strip_prefix("/dev/")
        .unwrap_or(partition_path);

    if !part_name.starts_with(disk_name) {
        anyhow::bail!(
            "Partition {} does not belong to disk {}",
            partition_path,
            disk_path
        );
    }

    let suffix = &part_name[disk_name.len()..];
    let suffix = suffix.strip_prefix('p').unwrap_or(suffix);
    suffix
        .parse::<u32>()
        .context("Failed to parse partition number")
}

/// Child partition nodes of a device as full paths, via lsblk.
pub fn list_children(runner: &dyn Runner, device: &str) -> Result<Vec<String>> {
    let out = runner
        .query(&ToolCommand::new(
            "lsblk",
            ["-J", "-b", "-o", "NAME,TYPE,SIZE,FSTYPE", device],
        ))?
        .expect_success("lsblk")?;
    let json: Value =
        serde_json::from_str(&out.stdout).context("failed to parse lsblk JSON output")?;
    let mut children = Vec::new();
    if let Some(devices) = json.get("blockdevices").and_then(|v| v.as_array()) {
        for dev in devices {
            if let Some(kids) = dev.get("children").and_then(|v| v.as_array()) {
                for kid in kids {
                    if let Some(name) = kid.get("name").and_then(|v| v.as_str()) {
                        children.push(format!("/dev/{}", name));
                    }
                }
            }
        }
    }
    Ok(children)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Read-only mount for inspection queries; allowed in dry-run mode.
    ReadOnlyQuery,
    /// Read-write mount for migration; suppressed by dry-run.
    ReadWrite,
}

static MOUNT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A mount owned by the engine, released on every exit path. `release`
/// applies the retry discipline and verifies the point actually let go;
/// dropping without release falls back to a best-effort unmount.
pub struct MountGuard<'r> {
    runner: &'r dyn Runner,
    point: PathBuf,
    mode: MountMode,
    released: bool,
}

impl<'r> MountGuard<'r> {
    pub fn acquire(runner: &'r dyn Runner, device: &str, mode: MountMode) -> Result<Self> {
        let seq = MOUNT_SEQ.fetch_add(1, Ordering::Relaxed);
        let point = std::env::temp_dir().join(format!(
            "ntfs2linux-{}-{}-{}",
            std::process::id(),
            seq,
            device.trim_start_matches("/dev/").replace('/', "_"),
        ));
        std::fs::create_dir_all(&point)
            .with_context(|| format!("failed to create mount point {}", point.display()))?;

        let point_str = point.to_string_lossy().to_string();
        let cmd = match mode {
            MountMode::ReadOnlyQuery => {
                ToolCommand::new("mount", ["-o", "ro", device, point_str.as_str()])
            }
            MountMode::ReadWrite => ToolCommand::new("mount", [device, point_str.as_str()]),
        };
        let out = match mode {
            MountMode::ReadOnlyQuery => runner.query(&cmd),
            MountMode::ReadWrite => runner.execute(&cmd),
        }?;
        if !out.success() {
            let _ = std::fs::remove_dir(&point);
            return Err(ConvertError::MountBusy(format!(
                "mount of {} failed: {}",
                device,
                out.stderr.trim()
            ))
            .into());
        }

        Ok(Self {
            runner,
            point,
            mode,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.point
    }

    pub fn path_string(&self) -> String {
        self.point.to_string_lossy().to_string()
    }

    /// Unmounts travel the same channel as the mount did, so a read-only
    /// inspection mount (a query) is released even in dry-run mode.
    fn unmount_once(&self, point: &str) -> Result<ToolOutput> {
        let cmd = ToolCommand::new("umount", [point]);
        match self.mode {
            MountMode::ReadOnlyQuery => self.runner.query(&cmd),
            MountMode::ReadWrite => self.runner.execute(&cmd),
        }
    }

    fn is_still_mounted(&self) -> bool {
        match self.runner.query(&ToolCommand::new(
            "findmnt",
            ["-n", "-o", "TARGET", self.point.to_string_lossy().as_ref()],
        )) {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }

    /// Unmount with up to three retries, verifying the point is gone from
    /// the mount table after each attempt.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        let point = self.path_string();
        let mut last_err = String::new();

        for attempt in 0..UNMOUNT_RETRIES {
            if attempt > 0 {
                std::thread::sleep(UNMOUNT_RETRY_DELAY);
            }
            match self.unmount_once(point.as_str()) {
                Ok(out) if out.success() || !self.is_still_mounted() => {
                    let _ = std::fs::remove_dir(&self.point);
                    return Ok(());
                }
                Ok(out) => last_err = out.stderr.trim().to_string(),
                Err(e) => last_err = e.to_string(),
            }
        }

        Err(ConvertError::UnmountStuck(format!("{} ({})", point, last_err)).into())
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let point = self.path_string();
            let _ = self.unmount_once(point.as_str());
            let _ = std::fs::remove_dir(&self.point);
        }
    }
}

pub struct BlockLayer<'r> {
    runner: &'r dyn Runner,
    ui: &'r dyn UiSink,
}

impl<'r> BlockLayer<'r> {
    pub fn new(runner: &'r dyn Runner, ui: &'r dyn UiSink) -> Self {
        Self { runner, ui }
    }

    fn ensure_unmounted(&self, partition: &str) -> Result<()> {
        let out = self.runner.query(&ToolCommand::new(
            "findmnt",
            ["-n", "-o", "TARGET", partition],
        ))?;
        if out.success() {
            return Err(ConvertError::MountBusy(format!(
                "{} is mounted at {}",
                partition,
                out.stdout.trim()
            ))
            .into());
        }
        Ok(())
    }

    /// Shrink the NTFS volume, then its partition-table entry, to
    /// `new_size_kb`. A non-destructive validation pass of the resizer
    /// runs first; nothing is written if it rejects.
    pub fn shrink_ntfs(&self, device: &str, partition: &str, new_size_kb: u64) -> Result<()> {
        self.ensure_unmounted(partition)?;

        let bytes = new_size_kb * 1024;
        let validation = self.runner.query(&ToolCommand::new(
            "ntfsresize",
            [
                "--no-action",
                "--force",
                "--size",
                &bytes.to_string(),
                partition,
            ],
        ))?;
        if !validation.success() {
            return Err(ConvertError::BlockOp {
                op: "shrink_ntfs (validation)",
                detail: ntfs_failure_detail(&validation.stdout, &validation.stderr),
            }
            .into());
        }

        self.runner
            .execute(&ToolCommand::new(
                "ntfsresize",
                ["--force", "--size", &bytes.to_string(), partition],
            ))?
            .expect_success("ntfsresize")?;

        // Partition entry follows the filesystem, same start. A filesystem
        // smaller than its partition is safe, so a failure here only costs
        // reclaimable space this iteration.
        let index = parse_partition_number(device, partition)?;
        let entry_resize = self.runner.execute(
            &ToolCommand::new("sfdisk", ["-N", &index.to_string(), device])
                .with_stdin(format!(", {}KiB\n", new_size_kb)),
        )?;
        if !entry_resize.success() {
            self.ui.log(
                LogLevel::Warning,
                &format!(
                    "could not shrink the partition entry of {}: {}",
                    partition,
                    entry_resize.stderr.trim()
                ),
            );
        }

        self.reprobe(device)?;
        Ok(())
    }

    /// Append a partition covering `[start_kb, end_kb)` and return its
    /// path. The new node is identified by diffing the device's child set
    /// before and after, so mixed naming conventions cannot confuse it.
    pub fn create_partition(&self, device: &str, start_kb: u64, end_kb: u64) -> Result<String> {
        let before = list_children(self.runner, device)?;

        if self.runner.is_dry_run() {
            let next = before
                .iter()
                .filter_map(|c| parse_partition_number(device, c).ok())
                .max()
                .unwrap_or(0)
                + 1;
            return Ok(get_part_path(device, next));
        }

        let script = format!(
            "start={}KiB, size={}KiB, type=L\n",
            start_kb,
            end_kb - start_kb
        );
        self.runner
            .execute(&ToolCommand::new("sfdisk", ["--append", device]).with_stdin(script))?
            .expect_success("sfdisk --append")?;
        self.reprobe(device)?;

        let deadline = Instant::now() + REPROBE_CAP;
        loop {
            let after = list_children(self.runner, device)?;
            let mut fresh: Vec<String> = after
                .into_iter()
                .filter(|c| !before.contains(c))
                .collect();
            if let Some(node) = fresh.pop() {
                return Ok(node);
            }
            if Instant::now() >= deadline {
                return Err(ConvertError::KernelViewStale(device.to_string()).into());
            }
            std::thread::sleep(REPROBE_POLL);
        }
    }

    /// Write a fresh filesystem onto an unmounted partition.
    pub fn format(&self, partition: &str, kind: FsKind) -> Result<()> {
        self.ensure_unmounted(partition)?;
        self.runner
            .execute(&kind.mkfs_command(partition))?
            .expect_success(kind.mkfs_tool())?;
        Ok(())
    }

    /// Rewrite a partition entry to `[new_start_kb, new_end_kb)`. When the
    /// start sector moves, sfdisk relocates the partition content too.
    pub fn expand_partition(
        &self,
        device: &str,
        entry: &TableEntry,
        new_start_kb: u64,
        new_end_kb: u64,
    ) -> Result<()> {
        if new_start_kb == entry.start_kb && new_end_kb == entry.end_kb() {
            return Ok(());
        }

        let mut args = Vec::new();
        if new_start_kb != entry.start_kb {
            self.ui.log(
                LogLevel::Info,
                &format!(
                    "relocating {} from {} KiB to {} KiB (data moves with it)",
                    entry.node, entry.start_kb, new_start_kb
                ),
            );
            args.push("--move-data".to_string());
        }
        args.extend([
            "-N".to_string(),
            entry.index.to_string(),
            device.to_string(),
        ]);

        let script = format!(
            "start={}KiB, size={}KiB\n",
            new_start_kb,
            new_end_kb - new_start_kb
        );
        self.runner
            .execute(&ToolCommand::new("sfdisk", args).with_stdin(script))?
            .expect_success("sfdisk resize")?;
        self.reprobe(device)?;
        Ok(())
    }

    /// Grow the filesystem on a partition to fill it, mounting first when
    /// the kind requires a mounted resize.
    pub fn grow_fs(&self, partition: &str, kind: FsKind) -> Result<()> {
        match kind.grow_strategy() {
            GrowStrategy::Device => {
                self.runner
                    .execute(&kind.grow_command(partition, None))?
                    .expect_success(kind.grow_tool())?;
            }
            GrowStrategy::Mounted | GrowStrategy::RemountResize => {
                let mount = MountGuard::acquire(self.runner, partition, MountMode::ReadWrite)?;
                let result = self
                    .runner
                    .execute(&kind.grow_command(partition, Some(&mount.path_string())))
                    .and_then(|out| out.expect_success(kind.grow_tool()));
                mount.release()?;
                result?;
            }
        }
        Ok(())
    }

    /// Remove a partition entry and wait for the kernel to drop the node.
    pub fn delete_partition(&self, device: &str, index: u32) -> Result<()> {
        let node = get_part_path(device, index);
        self.runner
            .execute(&ToolCommand::new(
                "sfdisk",
                ["--delete", device, &index.to_string()],
            ))?
            .expect_success("sfdisk --delete")?;
        self.reprobe(device)?;

        if self.runner.is_dry_run() {
            return Ok(());
        }
        let deadline = Instant::now() + REPROBE_CAP;
        loop {
            let children = list_children(self.runner, device)?;
            if !children.contains(&node) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConvertError::KernelViewStale(device.to_string()).into());
            }
            std::thread::sleep(REPROBE_POLL);
        }
    }

    /// Ask the kernel to re-read the partition table and settle udev.
    pub fn reprobe(&self, device: &str) -> Result<()> {
        // partprobe can fail transiently right after a table write; the
        // convergence polls above are the real gate.
        let _ = self
            .runner
            .execute(&ToolCommand::new("partprobe", [device]));
        self.runner
            .execute(&ToolCommand::new("udevadm", ["settle"]))?;
        Ok(())
    }
}

/// Classify ntfsresize failure output into an operator-actionable message.
pub fn ntfs_failure_detail(stdout: &str, stderr: &str) -> String {
    let combined = format!("{}\n{}", stdout, stderr);
    if combined.contains("hibernat") {
        return "Windows is hibernated; boot Windows, disable Fast Startup, \
                then shut down fully (shutdown /s /f /t 0)"
            .to_string();
    }
    if combined.contains("inconsistent") || combined.contains("dirty") {
        return "NTFS filesystem has errors; boot Windows and run: chkdsk /f".to_string();
    }
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        stdout.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Minimum shrink size from `ntfsresize --info` output. The hint line
/// reads "You might resize at N bytes ..."; the figure is the word right
/// before the "bytes" unit.
pub fn parse_ntfs_min_size(output: &str) -> Option<u64> {
    let hint = output.lines().find(|line| line.contains("resize at"))?;
    let (before_unit, _) = hint.split_once(" bytes")?;
    before_unit.split_whitespace().last()?.parse().ok()
}
