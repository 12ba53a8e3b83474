//! Simulated backend for `--dummy-mode` and the end-to-end tests.
//!
//! A second implementation of the process seam: it keeps a model of one or
//! more disks (partition table entries plus a real backing directory per
//! partition, under a tempdir) and synthesizes each tool's output from
//! that model. Mounting renames the backing tree onto the requested mount
//! point, so the migrator's real filesystem walks and deletions exercise
//! the same code paths they do on hardware.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use walkdir::WalkDir;

use super::block::get_part_path;
use super::runner::{Runner, ToolCommand, ToolOutput};

struct SimPartition {
    index: u32,
    start_kb: u64,
    size_kb: u64,
    fs: Option<String>,
    store: PathBuf,
    mounted_at: Option<PathBuf>,
}

impl SimPartition {
    fn tree(&self) -> &Path {
        self.mounted_at.as_deref().unwrap_or(&self.store)
    }
}

struct SimDisk {
    device: String,
    size_kb: u64,
    rotational: bool,
    partitions: Vec<SimPartition>,
}

struct SimState {
    disks: Vec<SimDisk>,
    store_seq: u64,
    corrupt_after_copy: Option<String>,
    pinned_used_kb: std::collections::HashMap<String, u64>,
}

/// Public snapshot of a simulated partition, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPartitionInfo {
    pub path: String,
    pub index: u32,
    pub start_kb: u64,
    pub size_kb: u64,
    pub fs: Option<String>,
}

pub struct DummyRunner {
    state: Mutex<SimState>,
    root: TempDir,
}

impl DummyRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                disks: Vec::new(),
                store_seq: 0,
                corrupt_after_copy: None,
                pinned_used_kb: std::collections::HashMap::new(),
            }),
            root: TempDir::with_prefix("ntfs2linux-sim-").expect("tempdir for simulation"),
        }
    }

    /// The demo disk `--dummy-mode` starts from: half a gigabyte of NTFS
    /// with a modest file population.
    pub fn demo() -> Self {
        let runner = Self::new();
        runner.add_disk("/dev/vda", 512 * 1024, false);
        runner.add_partition("/dev/vda", 1, 1024, 511 * 1024, Some("ntfs"));
        for i in 0..24 {
            runner.seed_file("/dev/vda1", &format!("data/file{:02}.bin", i), 512 * 1024);
        }
        runner.seed_file("/dev/vda1", "docs/readme.txt", 4096);
        runner
    }

    pub fn add_disk(&self, device: &str, size_kb: u64, rotational: bool) {
        let mut state = self.state.lock().expect("sim state");
        state.disks.push(SimDisk {
            device: device.to_string(),
            size_kb,
            rotational,
            partitions: Vec::new(),
        });
    }

    pub fn add_partition(
        &self,
        device: &str,
        index: u32,
        start_kb: u64,
        size_kb: u64,
        fs: Option<&str>,
    ) -> String {
        let mut state = self.state.lock().expect("sim state");
        let store = self.fresh_store(&mut state);
        let disk = state
            .disks
            .iter_mut()
            .find(|d| d.device == device)
            .expect("unknown simulated disk");
        disk.partitions.push(SimPartition {
            index,
            start_kb,
            size_kb,
            fs: fs.map(str::to_string),
            store,
            mounted_at: None,
        });
        disk.partitions.sort_by_key(|p| p.index);
        get_part_path(device, index)
    }

    /// Create a file of `size` deterministic bytes on a partition.
    pub fn seed_file(&self, partition: &str, rel: &str, size: usize) {
        let state = self.state.lock().expect("sim state");
        let part = find_partition(&state, partition).expect("unknown simulated partition");
        let path = part.tree().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("seed dir");
        }
        let seed = fnv64(rel.as_bytes()) as u8;
        let content: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_add(seed)).collect();
        std::fs::write(path, content).expect("seed file");
    }

    /// After the next copy, flip one byte in the named target file while
    /// keeping its size. Models in-flight corruption for the verification
    /// failure scenario.
    pub fn corrupt_after_copy(&self, rel: &str) {
        let mut state = self.state.lock().expect("sim state");
        state.corrupt_after_copy = Some(rel.to_string());
    }

    /// Pin the used-space figure df reports for a partition, regardless of
    /// what its tree actually holds. Models an inspector that keeps seeing
    /// the same occupancy.
    pub fn pin_used_kb(&self, partition: &str, used_kb: u64) {
        let mut state = self.state.lock().expect("sim state");
        state.pinned_used_kb.insert(partition.to_string(), used_kb);
    }

    pub fn partitions_of(&self, device: &str) -> Vec<SimPartitionInfo> {
        let state = self.state.lock().expect("sim state");
        state
            .disks
            .iter()
            .filter(|d| d.device == device)
            .flat_map(|d| {
                d.partitions.iter().map(|p| SimPartitionInfo {
                    path: get_part_path(&d.device, p.index),
                    index: p.index,
                    start_kb: p.start_kb,
                    size_kb: p.size_kb,
                    fs: p.fs.clone(),
                })
            })
            .collect()
    }

    /// Sorted (relative path, size) listing of a partition's files.
    pub fn files_of(&self, partition: &str) -> Vec<(String, u64)> {
        let state = self.state.lock().expect("sim state");
        let Some(part) = find_partition(&state, partition) else {
            return Vec::new();
        };
        let root = part.tree().to_path_buf();
        let mut files: Vec<(String, u64)> = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(e.path())
                    .to_string_lossy()
                    .to_string();
                let size = e.metadata().map(|m| m.len()).unwrap_or(0);
                (rel, size)
            })
            .collect();
        files.sort();
        files
    }

    pub fn any_mounted(&self) -> bool {
        let state = self.state.lock().expect("sim state");
        state
            .disks
            .iter()
            .any(|d| d.partitions.iter().any(|p| p.mounted_at.is_some()))
    }

    fn fresh_store(&self, state: &mut SimState) -> PathBuf {
        state.store_seq += 1;
        let store = self.root.path().join(format!("store-{}", state.store_seq));
        std::fs::create_dir_all(&store).expect("store dir");
        store
    }

    fn dispatch(
        &self,
        cmd: &ToolCommand,
        on_line: Option<&mut dyn FnMut(&str)>,
    ) -> Result<ToolOutput> {
        let mut state = self.state.lock().expect("sim state");
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();

        match cmd.program.as_str() {
            "blockdev" => {
                let device = args.last().copied().unwrap_or_default();
                let disk = state
                    .disks
                    .iter()
                    .find(|d| d.device == device)
                    .with_context(|| format!("simulated blockdev: unknown device {}", device))?;
                Ok(out_ok(format!("{}\n", disk.size_kb * 1024)))
            }
            "sfdisk" => self.run_sfdisk(&mut state, &args, cmd.stdin.as_deref()),
            "lsblk" => Ok(self.run_lsblk(&state, &args)),
            "ntfsresize" => Ok(run_ntfsresize(&state, &args)),
            "mount" => Ok(run_mount(&mut state, &args)),
            "umount" => Ok(run_umount(&mut state, &args)),
            "findmnt" => Ok(run_findmnt(&state, &args)),
            "df" => Ok(run_df(&state, &args)),
            "rsync" => Ok(run_rsync(&mut state, &args, on_line)),
            "sync" | "partprobe" => Ok(ToolOutput::ok()),
            "udevadm" => Ok(ToolOutput::ok()),
            // Filesystem grow tools: growth is implicit in the model.
            "resize2fs" | "resize.f2fs" | "resize_reiserfs" | "xfs_growfs" | "btrfs" => {
                Ok(ToolOutput::ok())
            }
            "xxhsum" | "xxh64sum" | "sha256sum" | "md5sum" => {
                let path = args.last().copied().unwrap_or_default();
                match std::fs::read(path) {
                    Ok(bytes) => Ok(out_ok(format!("{:016x}  {}\n", fnv64(&bytes), path))),
                    Err(e) => Ok(out_err(1, format!("{}: {}", path, e))),
                }
            }
            program if program.starts_with("mkfs.") || program == "mkreiserfs" => {
                let kind = program.strip_prefix("mkfs.").unwrap_or("reiserfs");
                let partition = args.last().copied().unwrap_or_default().to_string();
                let fresh = self.fresh_store(&mut state);
                let part = find_partition_mut(&mut state, &partition)
                    .with_context(|| format!("simulated mkfs: unknown partition {}", partition))?;
                let old = std::mem::replace(&mut part.store, fresh);
                part.fs = Some(kind.to_string());
                drop(state);
                let _ = std::fs::remove_dir_all(old);
                Ok(ToolOutput::ok())
            }
            other => Ok(out_err(127, format!("{}: not simulated", other))),
        }
    }

    fn run_sfdisk(
        &self,
        state: &mut SimState,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<ToolOutput> {
        if args.first() == Some(&"-J") {
            let device = args[1];
            let disk = state
                .disks
                .iter()
                .find(|d| d.device == device)
                .with_context(|| format!("simulated sfdisk: unknown device {}", device))?;
            let partitions: Vec<_> = disk
                .partitions
                .iter()
                .map(|p| {
                    json!({
                        "node": get_part_path(&disk.device, p.index),
                        "start": p.start_kb * 2,
                        "size": p.size_kb * 2,
                        "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
                    })
                })
                .collect();
            let doc = json!({
                "partitiontable": {
                    "label": "gpt",
                    "device": device,
                    "unit": "sectors",
                    "firstlba": 2048,
                    "lastlba": disk.size_kb * 2 - 1,
                    "sectorsize": 512,
                    "partitions": partitions
                }
            });
            return Ok(out_ok(doc.to_string()));
        }

        if args.first() == Some(&"--append") {
            let device = args[1].to_string();
            let (start_kb, size_kb) = parse_sfdisk_script(stdin.unwrap_or_default());
            let (start_kb, size_kb) = (
                start_kb.context("sfdisk --append needs a start")?,
                size_kb.context("sfdisk --append needs a size")?,
            );
            let next = state
                .disks
                .iter()
                .find(|d| d.device == device)
                .map(|d| d.partitions.iter().map(|p| p.index).max().unwrap_or(0) + 1)
                .context("simulated sfdisk: unknown device")?;
            let store = self.fresh_store(state);
            let disk = state
                .disks
                .iter_mut()
                .find(|d| d.device == device)
                .expect("checked above");
            disk.partitions.push(SimPartition {
                index: next,
                start_kb,
                size_kb,
                fs: None,
                store,
                mounted_at: None,
            });
            disk.partitions.sort_by_key(|p| p.index);
            return Ok(ToolOutput::ok());
        }

        if args.first() == Some(&"--delete") {
            let device = args[1];
            let index: u32 = args[2].parse().context("sfdisk --delete index")?;
            let disk = state
                .disks
                .iter_mut()
                .find(|d| d.device == device)
                .with_context(|| format!("simulated sfdisk: unknown device {}", device))?;
            let Some(pos) = disk.partitions.iter().position(|p| p.index == index) else {
                return Ok(out_err(1, format!("no partition {} on {}", index, device)));
            };
            if disk.partitions[pos].mounted_at.is_some() {
                return Ok(out_err(1, "partition is mounted".to_string()));
            }
            let removed = disk.partitions.remove(pos);
            let _ = std::fs::remove_dir_all(&removed.store);
            return Ok(ToolOutput::ok());
        }

        if let Some(pos) = args.iter().position(|a| *a == "-N") {
            let index: u32 = args[pos + 1].parse().context("sfdisk -N index")?;
            let device = args[pos + 2];
            let (start_kb, size_kb) = parse_sfdisk_script(stdin.unwrap_or_default());
            let disk = state
                .disks
                .iter_mut()
                .find(|d| d.device == device)
                .with_context(|| format!("simulated sfdisk: unknown device {}", device))?;
            let Some(part) = disk.partitions.iter_mut().find(|p| p.index == index) else {
                return Ok(out_err(1, format!("no partition {} on {}", index, device)));
            };
            if let Some(start) = start_kb {
                part.start_kb = start;
            }
            if let Some(size) = size_kb {
                part.size_kb = size;
            }
            return Ok(ToolOutput::ok());
        }

        Ok(out_err(1, format!("sfdisk: unsupported args {:?}", args)))
    }

    fn run_lsblk(&self, state: &SimState, args: &[&str]) -> ToolOutput {
        if args.contains(&"-J") {
            let device_filter = args
                .iter()
                .find(|a| a.starts_with("/dev/"))
                .copied()
                .map(str::to_string);
            let devices: Vec<_> = state
                .disks
                .iter()
                .filter(|d| {
                    device_filter
                        .as_ref()
                        .is_none_or(|wanted| &d.device == wanted)
                })
                .map(|d| {
                    let children: Vec<_> = d
                        .partitions
                        .iter()
                        .map(|p| {
                            json!({
                                "name": get_part_path(&d.device, p.index)
                                    .trim_start_matches("/dev/"),
                                "type": "part",
                                "size": p.size_kb * 1024,
                                "fstype": p.fs,
                            })
                        })
                        .collect();
                    json!({
                        "name": d.device.trim_start_matches("/dev/"),
                        "type": "disk",
                        "size": d.size_kb * 1024,
                        "fstype": serde_json::Value::Null,
                        "children": children
                    })
                })
                .collect();
            return out_ok(json!({ "blockdevices": devices }).to_string());
        }

        if args.contains(&"ROTA") {
            let device = args.last().copied().unwrap_or_default();
            let rotational = state
                .disks
                .iter()
                .find(|d| d.device == device)
                .map(|d| d.rotational)
                .unwrap_or(false);
            return out_ok(format!("{}\n", if rotational { 1 } else { 0 }));
        }

        out_err(1, "lsblk: unsupported args".to_string())
    }
}

impl Default for DummyRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for DummyRunner {
    fn execute(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        self.dispatch(cmd, None)
    }

    fn query(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        self.dispatch(cmd, None)
    }

    fn stream(&self, cmd: &ToolCommand, on_line: &mut dyn FnMut(&str)) -> Result<ToolOutput> {
        self.dispatch(cmd, Some(on_line))
    }

    fn io_completions(&self, _device: &str) -> Option<u64> {
        // The simulation is always settled.
        Some(0)
    }

    fn has_tool(&self, _name: &str) -> bool {
        true
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

fn find_partition<'s>(state: &'s SimState, partition: &str) -> Option<&'s SimPartition> {
    state.disks.iter().find_map(|d| {
        d.partitions
            .iter()
            .find(|p| get_part_path(&d.device, p.index) == partition)
    })
}

fn find_partition_mut<'s>(state: &'s mut SimState, partition: &str) -> Option<&'s mut SimPartition> {
    state.disks.iter_mut().find_map(|d| {
        let device = d.device.clone();
        d.partitions
            .iter_mut()
            .find(|p| get_part_path(&device, p.index) == partition)
    })
}

fn run_ntfsresize(state: &SimState, args: &[&str]) -> ToolOutput {
    let partition = args.last().copied().unwrap_or_default();
    let Some(part) = find_partition(state, partition) else {
        return out_err(1, format!("ntfsresize: unknown device {}", partition));
    };
    if part.fs.as_deref() != Some("ntfs") {
        return out_err(1, format!("{} is not an NTFS volume", partition));
    }
    let used = du_bytes(part.tree());

    if args.contains(&"--info") {
        return out_ok(format!(
            "Current volume size: {} bytes\nYou might resize at {} bytes or smaller.\n",
            part.size_kb * 1024,
            used
        ));
    }

    if let Some(pos) = args.iter().position(|a| *a == "--size") {
        let requested: u64 = args
            .get(pos + 1)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if requested < used {
            return out_err(
                1,
                format!(
                    "Requested size {} is below the minimum of {} bytes",
                    requested, used
                ),
            );
        }
    }
    ToolOutput::ok()
}

fn run_mount(state: &mut SimState, args: &[&str]) -> ToolOutput {
    // Remount-with-resize is how one filesystem kind grows; accept it.
    if args.iter().any(|a| a.contains("remount")) {
        return ToolOutput::ok();
    }
    let positional: Vec<&str> = split_positional(args);
    let [device, point] = positional[..] else {
        return out_err(1, format!("mount: unsupported args {:?}", args));
    };
    let Some(part) = find_partition_mut(state, device) else {
        return out_err(32, format!("mount: special device {} does not exist", device));
    };
    if part.mounted_at.is_some() {
        return out_err(32, format!("{} is already mounted", device));
    }
    if part.fs.is_none() {
        return out_err(32, format!("wrong fs type on {}", device));
    }
    let target = PathBuf::from(point);
    if let Err(e) = std::fs::rename(&part.store, &target) {
        return out_err(32, format!("mount: {}", e));
    }
    part.mounted_at = Some(target);
    ToolOutput::ok()
}

fn run_umount(state: &mut SimState, args: &[&str]) -> ToolOutput {
    let point = args.last().copied().unwrap_or_default();
    for disk in &mut state.disks {
        for part in &mut disk.partitions {
            if part.mounted_at.as_deref() == Some(Path::new(point)) {
                if let Err(e) = std::fs::rename(point, &part.store) {
                    return out_err(32, format!("umount: {}", e));
                }
                part.mounted_at = None;
                return ToolOutput::ok();
            }
        }
    }
    out_err(32, format!("umount: {}: not mounted", point))
}

fn run_findmnt(state: &SimState, args: &[&str]) -> ToolOutput {
    let node = args.last().copied().unwrap_or_default();
    for disk in &state.disks {
        for part in &disk.partitions {
            let Some(point) = &part.mounted_at else {
                continue;
            };
            let path = get_part_path(&disk.device, part.index);
            if path == node || point.as_path() == Path::new(node) {
                return out_ok(format!("{}\n", point.display()));
            }
        }
    }
    out_err(1, String::new())
}

fn run_df(state: &SimState, args: &[&str]) -> ToolOutput {
    let point = args.last().copied().unwrap_or_default();
    for disk in &state.disks {
        for part in &disk.partitions {
            if part.mounted_at.as_deref() == Some(Path::new(point)) {
                let path = get_part_path(&disk.device, part.index);
                let used_kb = state
                    .pinned_used_kb
                    .get(&path)
                    .copied()
                    .unwrap_or_else(|| du_bytes(part.tree()).div_ceil(1024));
                return out_ok(format!(" Used\n{:>5}\n", used_kb));
            }
        }
    }
    out_err(1, format!("df: {}: no such file or directory", point))
}

fn run_rsync(
    state: &mut SimState,
    args: &[&str],
    mut on_line: Option<&mut dyn FnMut(&str)>,
) -> ToolOutput {
    let positional = split_positional(args);
    let [src, dst] = positional[..] else {
        return out_err(1, format!("rsync: unsupported args {:?}", args));
    };
    let src_root = PathBuf::from(src.trim_end_matches('/'));
    let dst_root = PathBuf::from(dst);

    let capacity: u64 = state
        .disks
        .iter()
        .flat_map(|d| &d.partitions)
        .find(|p| p.mounted_at.as_deref() == Some(dst_root.as_path()))
        .map(|p| p.size_kb * 1024)
        .unwrap_or(u64::MAX);

    let total_bytes: u64 = WalkDir::new(&src_root)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();

    let mut used = du_bytes(&dst_root);
    let mut copied = 0u64;
    let mut partial = false;

    for entry in WalkDir::new(&src_root).sort_by_file_name().into_iter().flatten() {
        let rel = match entry.path().strip_prefix(&src_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let dest = dst_root.join(&rel);
        if entry.file_type().is_dir() {
            let _ = std::fs::create_dir_all(&dest);
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if dest.exists()
            && std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0) == len
        {
            copied += len;
            continue;
        }
        if used + len > capacity {
            partial = true;
            continue;
        }
        if let Some(parent) = dest.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if std::fs::copy(entry.path(), &dest).is_err() {
            partial = true;
            continue;
        }
        used += len;
        copied += len;
        if let Some(cb) = on_line.as_deref_mut()
            && total_bytes > 0
        {
            let pct = (copied * 100 / total_bytes).min(100);
            cb(&format!("{:>15}  {}%  simulated", copied, pct));
        }
    }

    if let Some(rel) = state.corrupt_after_copy.take() {
        let victim = dst_root.join(rel);
        if let Ok(mut bytes) = std::fs::read(&victim)
            && !bytes.is_empty()
        {
            let mid = bytes.len() / 2;
            bytes[mid] ^= 0xff;
            let _ = std::fs::write(&victim, bytes);
        }
    }

    if partial {
        out_err(24, "rsync warning: some files vanished or did not fit".to_string())
    } else {
        ToolOutput::ok()
    }
}

fn split_positional<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut positional = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if *arg == "-o" {
            skip_next = true;
            continue;
        }
        if arg.starts_with('-') {
            continue;
        }
        positional.push(*arg);
    }
    positional
}

/// Parse an sfdisk script line into (start_kb, size_kb). Named fields use
/// KiB suffixes; bare numbers are sectors.
fn parse_sfdisk_script(line: &str) -> (Option<u64>, Option<u64>) {
    let mut start = None;
    let mut size = None;
    let mut positional = 0usize;
    for raw in line.trim().split(',') {
        let token = raw.trim();
        if token.is_empty() {
            positional += 1;
            continue;
        }
        if let Some(v) = token.strip_prefix("start=") {
            start = parse_kb(v);
        } else if let Some(v) = token.strip_prefix("size=") {
            size = parse_kb(v);
        } else if token.starts_with("type=") || token == "L" {
            // partition type, irrelevant to the simulation
        } else {
            match positional {
                0 => start = parse_kb(token),
                1 => size = parse_kb(token),
                _ => {}
            }
            positional += 1;
        }
    }
    (start, size)
}

fn parse_kb(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(kb) = value.strip_suffix("KiB") {
        kb.trim().parse().ok()
    } else {
        value.parse::<u64>().ok().map(|sectors| sectors / 2)
    }
}

fn du_bytes(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn out_ok(stdout: String) -> ToolOutput {
    ToolOutput {
        code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn out_err(code: i32, stderr: String) -> ToolOutput {
    ToolOutput {
        code,
        stdout: String::new(),
        stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfdisk_json_round_trips_through_inspector_parsing() {
        let runner = DummyRunner::new();
        runner.add_disk("/dev/vda", 1024 * 1024, false);
        runner.add_partition("/dev/vda", 1, 1024, 512 * 1024, Some("ntfs"));

        let out = runner
            .query(&ToolCommand::new("sfdisk", ["-J", "/dev/vda"]))
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("\"node\":\"/dev/vda1\""));
        assert!(out.stdout.contains("\"sectorsize\":512"));
    }

    #[test]
    fn test_mount_cycle_moves_the_backing_tree() {
        let runner = DummyRunner::new();
        runner.add_disk("/dev/vda", 1024 * 1024, false);
        runner.add_partition("/dev/vda", 1, 1024, 512 * 1024, Some("ext4"));
        runner.seed_file("/dev/vda1", "hello.txt", 64);

        let point = tempfile::tempdir().unwrap();
        let point_str = point.path().join("m");
        std::fs::create_dir_all(&point_str).unwrap();
        let point_arg = point_str.to_string_lossy().to_string();

        let out = runner
            .execute(&ToolCommand::new("mount", ["/dev/vda1", point_arg.as_str()]))
            .unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert!(point_str.join("hello.txt").exists());
        assert!(runner.any_mounted());

        let out = runner
            .execute(&ToolCommand::new("umount", [point_arg.as_str()]))
            .unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert!(!runner.any_mounted());
        assert_eq!(runner.files_of("/dev/vda1").len(), 1);
    }

    #[test]
    fn test_rsync_respects_target_capacity() {
        let runner = DummyRunner::new();
        runner.add_disk("/dev/vda", 1024 * 1024, false);
        runner.add_partition("/dev/vda", 1, 1024, 512 * 1024, Some("ntfs"));
        // Tiny target: 16 KiB capacity.
        runner.add_partition("/dev/vda", 2, 600 * 1024, 16, Some("ext4"));
        runner.seed_file("/dev/vda1", "a.bin", 8 * 1024);
        runner.seed_file("/dev/vda1", "b.bin", 8 * 1024);
        runner.seed_file("/dev/vda1", "c.bin", 8 * 1024);

        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("s");
        let dst = scratch.path().join("t");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        let src_arg = src.to_string_lossy().to_string();
        let dst_arg = dst.to_string_lossy().to_string();
        runner
            .execute(&ToolCommand::new("mount", ["/dev/vda1", src_arg.as_str()]))
            .unwrap();
        runner
            .execute(&ToolCommand::new("mount", ["/dev/vda2", dst_arg.as_str()]))
            .unwrap();

        let out = runner
            .execute(&ToolCommand::new(
                "rsync",
                ["-aHS", &format!("{}/", src_arg), dst_arg.as_str()],
            ))
            .unwrap();
        assert_eq!(out.code, 24, "partial copy reports the partial exit code");

        runner
            .execute(&ToolCommand::new("umount", [src_arg.as_str()]))
            .unwrap();
        runner
            .execute(&ToolCommand::new("umount", [dst_arg.as_str()]))
            .unwrap();
        // Two of three files fit.
        assert_eq!(runner.files_of("/dev/vda2").len(), 2);
    }

    #[test]
    fn test_ntfsresize_validation_rejects_undersize() {
        let runner = DummyRunner::new();
        runner.add_disk("/dev/vda", 1024 * 1024, false);
        runner.add_partition("/dev/vda", 1, 1024, 512 * 1024, Some("ntfs"));
        runner.seed_file("/dev/vda1", "big.bin", 64 * 1024);

        let too_small = (32 * 1024).to_string();
        let out = runner
            .query(&ToolCommand::new(
                "ntfsresize",
                ["--no-action", "--force", "--size", &too_small, "/dev/vda1"],
            ))
            .unwrap();
        assert!(!out.success());

        let enough = (128 * 1024).to_string();
        let out = runner
            .query(&ToolCommand::new(
                "ntfsresize",
                ["--no-action", "--force", "--size", &enough, "/dev/vda1"],
            ))
            .unwrap();
        assert!(out.success());
    }

    #[test]
    fn test_hash_tool_is_deterministic_and_content_sensitive() {
        let runner = DummyRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"same").unwrap();
        std::fs::write(&b, b"same").unwrap();
        let ha = runner
            .query(&ToolCommand::new("xxhsum", [a.to_string_lossy().to_string()]))
            .unwrap();
        let hb = runner
            .query(&ToolCommand::new("xxhsum", [b.to_string_lossy().to_string()]))
            .unwrap();
        assert_eq!(
            ha.stdout.split_whitespace().next(),
            hb.stdout.split_whitespace().next()
        );

        std::fs::write(&b, b"diff").unwrap();
        let hb2 = runner
            .query(&ToolCommand::new("xxhsum", [b.to_string_lossy().to_string()]))
            .unwrap();
        assert_ne!(
            ha.stdout.split_whitespace().next(),
            hb2.stdout.split_whitespace().next()
        );
    }

    #[test]
    fn test_sfdisk_append_and_delete() {
        let runner = DummyRunner::new();
        runner.add_disk("/dev/vda", 1024 * 1024, false);
        runner.add_partition("/dev/vda", 1, 1024, 100 * 1024, Some("ntfs"));

        let out = runner
            .execute(
                &ToolCommand::new("sfdisk", ["--append", "/dev/vda"])
                    .with_stdin("start=102400KiB, size=204800KiB, type=L\n"),
            )
            .unwrap();
        assert!(out.success(), "{}", out.stderr);
        let parts = runner.partitions_of("/dev/vda");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].index, 2);
        assert_eq!(parts[1].start_kb, 102400);
        assert_eq!(parts[1].size_kb, 204800);

        runner
            .execute(&ToolCommand::new("sfdisk", ["--delete", "/dev/vda", "1"]))
            .unwrap();
        assert_eq!(runner.partitions_of("/dev/vda").len(), 1);
    }
}
