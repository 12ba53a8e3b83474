//! Verified Migrator: move file content from the NTFS source to the target
//! volume and delete from the source exactly what has been proven durable
//! on the target.
//!
//! Any error before the pruning step returns without touching source
//! content. Pruning errors are reported but not fatal: the verified copies
//! already exist durably on the target.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use super::block::{MountGuard, MountMode};
use super::error::ConvertError;
use super::runner::{Runner, ToolCommand};
use super::ui::{LogLevel, PromptResponse, UiSink};

/// Files at or below this size are verified by size alone.
const HASH_FLOOR_BYTES: u64 = 100 * 1024;

/// Hash tools in preference order; fastest first.
pub const HASH_TOOLS: [&str; 4] = ["xxhsum", "xxh64sum", "sha256sum", "md5sum"];

/// rsync exit codes that mean "partial transfer", not hard failure.
const RSYNC_PARTIAL_CODES: [i32; 2] = [23, 24];

/// Settling-wait tuning. Defaults follow the durability barrier contract:
/// 1 s polls, settled under 10 new completions, 30 s cap.
#[derive(Debug, Clone)]
pub struct SettleConfig {
    pub poll: Duration,
    pub threshold: u64,
    pub cap: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            threshold: 10,
            cap: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub total_files: u64,
    pub verified: u64,
    pub missing: u64,
    pub failed: u64,
    pub pruned: u64,
    pub bytes_enumerated: u64,
}

/// Outcome of the verification walk, before the acceptance gate.
#[derive(Debug, Default)]
pub struct VerifyOutcome {
    pub verified: Vec<PathBuf>,
    pub missing: u64,
    pub failed: u64,
    pub total: u64,
    pub downgraded: u64,
}

pub struct Migrator<'r> {
    runner: &'r dyn Runner,
    ui: &'r dyn UiSink,
    instance_id: String,
    cancel: Arc<AtomicBool>,
    pub settle: SettleConfig,
}

impl<'r> Migrator<'r> {
    pub fn new(
        runner: &'r dyn Runner,
        ui: &'r dyn UiSink,
        instance_id: &str,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            runner,
            ui,
            instance_id: instance_id.to_string(),
            cancel,
            settle: SettleConfig::default(),
        }
    }

    /// Run one migration step: mount both volumes, copy, wait for
    /// durability, verify, gate, prune, release.
    pub fn migrate(
        &self,
        device: &str,
        source_partition: &str,
        target_partition: &str,
    ) -> Result<MigrationReport> {
        if self.runner.is_dry_run() {
            self.ui.log(
                LogLevel::Info,
                &format!(
                    "[DRY RUN] would migrate files from {} to {}",
                    source_partition, target_partition
                ),
            );
            return Ok(MigrationReport::default());
        }

        let source = MountGuard::acquire(self.runner, source_partition, MountMode::ReadWrite)?;
        let target = match MountGuard::acquire(self.runner, target_partition, MountMode::ReadWrite)
        {
            Ok(target) => target,
            Err(e) => {
                source.release()?;
                return Err(e);
            }
        };

        let result = self.migrate_mounted(device, &source, &target);

        // Both mounts let go on every path; a stuck unmount is its own
        // failure even when migration succeeded.
        let target_released = target.release();
        let source_released = source.release();
        let report = result?;
        target_released?;
        source_released?;
        Ok(report)
    }

    fn migrate_mounted(
        &self,
        device: &str,
        source: &MountGuard,
        target: &MountGuard,
    ) -> Result<MigrationReport> {
        let source_point = source.path_string();
        let target_point = target.path_string();
        let (file_count, byte_count) = enumerate_tree(source.path())?;
        self.ui.log(
            LogLevel::Info,
            &format!(
                "source holds {} files, {} KiB",
                file_count,
                byte_count / 1024
            ),
        );

        if self.cancel.load(Ordering::SeqCst) {
            return Err(ConvertError::Interrupted.into());
        }

        self.copy_tree(source.path(), target.path())?;

        durability_barrier(
            self.runner,
            self.ui,
            device,
            &[source_point.as_str(), target_point.as_str()],
            &self.settle,
        )?;

        self.ui.status("verifying copied files", None);
        let outcome = self.verify_tree(source.path(), target.path())?;
        self.apply_gate(&outcome)?;

        let manifest = self.write_manifest(&outcome.verified)?;
        self.ui.log(
            LogLevel::Success,
            &format!(
                "{} of {} files verified on the target",
                outcome.verified.len(),
                outcome.total
            ),
        );

        if self.cancel.load(Ordering::SeqCst) {
            return Err(ConvertError::Interrupted.into());
        }

        let pruned = self.prune_verified(source.path(), &outcome.verified);
        drop(manifest);

        // Deletions must be on disk before the engine re-measures.
        durability_barrier(
            self.runner,
            self.ui,
            device,
            &[source_point.as_str(), target_point.as_str()],
            &self.settle,
        )?;

        Ok(MigrationReport {
            total_files: outcome.total,
            verified: outcome.verified.len() as u64,
            missing: outcome.missing,
            failed: outcome.failed,
            pruned,
            bytes_enumerated: byte_count,
        })
    }

    /// Recursive copy preserving mode, ownership, times, hard links and
    /// sparseness. Partial-transfer exits are tolerated; verification
    /// decides what actually made it.
    fn copy_tree(&self, source: &Path, target: &Path) -> Result<()> {
        let src_arg = format!("{}/", source.display());
        let dst_arg = target.display().to_string();
        let cmd = ToolCommand::new(
            "rsync",
            [
                "-aHS",
                "--partial",
                "--info=progress2",
                src_arg.as_str(),
                dst_arg.as_str(),
            ],
        );

        // Copy output lands in a per-iteration log that dies with it.
        let mut copy_log = tempfile::Builder::new()
            .prefix(&format!("ntfs2linux-copylog-{}-", self.instance_id))
            .tempfile()
            .context("failed to create copy log")?;

        let ui = self.ui;
        let out = self.runner.stream(&cmd, &mut |line| {
            let _ = writeln!(copy_log, "{}", line);
            if let Some(pct) = parse_progress_percent(line) {
                ui.status("copying files", Some(pct));
            }
        })?;

        if !out.success() {
            if RSYNC_PARTIAL_CODES.contains(&out.code) {
                self.ui.log(
                    LogLevel::Warning,
                    &format!(
                        "copy finished partially (rsync exit {}); unverified files stay on the source",
                        out.code
                    ),
                );
            } else {
                return Err(ConvertError::BlockOp {
                    op: "migrate_files (copy)",
                    detail: format!("rsync exit {}: {}", out.code, out.stderr.trim()),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Walk every regular file on the source and compare it against the
    /// target copy: presence, then size, then (for files above the hash
    /// floor, when a hash tool is available) content hash.
    pub fn verify_tree(&self, source: &Path, target: &Path) -> Result<VerifyOutcome> {
        let hash_tool = self.pick_hash_tool();
        if hash_tool.is_none() {
            self.ui.log(
                LogLevel::Warning,
                "no hash tool found (xxhsum/sha256sum/md5sum); verifying by size only",
            );
        }

        let mut outcome = VerifyOutcome::default();
        for entry in WalkDir::new(source).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.ui
                        .log(LogLevel::Warning, &format!("skipping unreadable entry: {}", e));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(source)
                .context("walk escaped the source root")?
                .to_path_buf();
            outcome.total += 1;

            let source_len = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    self.ui.log(
                        LogLevel::Warning,
                        &format!("cannot stat {}: {}", rel.display(), e),
                    );
                    outcome.failed += 1;
                    continue;
                }
            };

            let target_path = target.join(&rel);
            let target_len = match std::fs::symlink_metadata(&target_path) {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    outcome.missing += 1;
                    continue;
                }
            };

            if source_len != target_len {
                outcome.failed += 1;
                continue;
            }
            if source_len == 0 {
                outcome.verified.push(rel);
                continue;
            }

            if source_len > HASH_FLOOR_BYTES
                && let Some(tool) = hash_tool
            {
                match (
                    self.hash_file(tool, entry.path()),
                    self.hash_file(tool, &target_path),
                ) {
                    (Some(a), Some(b)) if a == b => outcome.verified.push(rel),
                    (Some(_), Some(_)) => {
                        outcome.failed += 1;
                    }
                    _ => {
                        // Hash tool failure downgrades to size-only.
                        outcome.downgraded += 1;
                        outcome.verified.push(rel);
                    }
                }
            } else {
                outcome.verified.push(rel);
            }
        }

        if outcome.downgraded > 0 {
            self.ui.log(
                LogLevel::Warning,
                &format!(
                    "{} files verified by size only after hash tool failures",
                    outcome.downgraded
                ),
            );
        }
        Ok(outcome)
    }

    /// The acceptance gate: no source file is deleted unless this passes.
    fn apply_gate(&self, outcome: &VerifyOutcome) -> Result<()> {
        if outcome.failed > 0 {
            return Err(ConvertError::VerificationFailed(format!(
                "{} of {} files differ between source and target",
                outcome.failed, outcome.total
            ))
            .into());
        }
        if outcome.total == 0 {
            return Ok(());
        }
        if outcome.missing * 10 > outcome.total {
            return Err(ConvertError::VerificationFailed(format!(
                "{} of {} files missing on the target (over 10%)",
                outcome.missing, outcome.total
            ))
            .into());
        }
        let verified = outcome.verified.len() as u64;
        if verified * 10 < outcome.total * 9 {
            let answer = self.ui.prompt(
                &format!(
                    "Only {} of {} files verified. Delete the verified files from the source and continue?",
                    verified, outcome.total
                ),
                &["Continue", "Abort"],
            );
            if answer != PromptResponse::Choice(0) {
                return Err(ConvertError::VerificationFailed(format!(
                    "{} of {} files verified (under 90%)",
                    verified, outcome.total
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Manifest of verified relative paths; lives only as long as the
    /// iteration that produced it.
    fn write_manifest(&self, verified: &[PathBuf]) -> Result<tempfile::NamedTempFile> {
        let mut manifest = tempfile::Builder::new()
            .prefix(&format!("ntfs2linux-manifest-{}-", self.instance_id))
            .tempfile()
            .context("failed to create verification manifest")?;
        for path in verified {
            writeln!(manifest, "{}", path.display())?;
        }
        manifest.flush()?;
        Ok(manifest)
    }

    /// Delete exactly the verified paths from the source, then sweep
    /// emptied directories. Errors are reported, not fatal.
    fn prune_verified(&self, source: &Path, verified: &[PathBuf]) -> u64 {
        let mut pruned = 0u64;
        for rel in verified {
            let path = source.join(rel);
            match std::fs::remove_file(&path) {
                Ok(()) => pruned += 1,
                Err(e) => {
                    self.ui.log(
                        LogLevel::Warning,
                        &format!("could not delete {}: {}", rel.display(), e),
                    );
                }
            }
        }

        for entry in WalkDir::new(source)
            .follow_links(false)
            .contents_first(true)
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_dir() && entry.path() != source {
                // Fails on non-empty directories; that is the filter.
                let _ = std::fs::remove_dir(entry.path());
            }
        }

        pruned
    }

    fn pick_hash_tool(&self) -> Option<&'static str> {
        HASH_TOOLS
            .into_iter()
            .find(|tool| self.runner.has_tool(tool))
    }

    fn hash_file(&self, tool: &str, path: &Path) -> Option<String> {
        let out = self
            .runner
            .query(&ToolCommand::new(
                tool,
                [path.to_string_lossy().to_string()],
            ))
            .ok()?;
        if !out.success() {
            return None;
        }
        out.stdout
            .split_whitespace()
            .next()
            .map(|t| t.to_string())
    }
}

/// Global sync, per-mount sync, then a bounded wait for the device's I/O
/// counters to settle. Required before any query that must reflect
/// completed writes.
pub fn durability_barrier(
    runner: &dyn Runner,
    ui: &dyn UiSink,
    device: &str,
    mounts: &[&str],
    settle: &SettleConfig,
) -> Result<()> {
    runner
        .execute(&ToolCommand::new("sync", Vec::<String>::new()))?
        .expect_success("sync")?;
    for mount in mounts {
        runner
            .execute(&ToolCommand::new("sync", [*mount]))?
            .expect_success("sync")?;
    }

    let Some(mut last) = runner.io_completions(device) else {
        return Ok(());
    };
    let deadline = Instant::now() + settle.cap;
    loop {
        std::thread::sleep(settle.poll);
        let Some(current) = runner.io_completions(device) else {
            return Ok(());
        };
        if current.saturating_sub(last) < settle.threshold {
            return Ok(());
        }
        last = current;
        if Instant::now() >= deadline {
            ui.log(
                LogLevel::Warning,
                &format!("I/O on {} did not settle within the wait cap", device),
            );
            return Ok(());
        }
    }
}

/// File count and byte total of a tree, for progress reporting.
pub fn enumerate_tree(root: &Path) -> Result<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((files, bytes))
}

/// Extract a percentage from rsync `--info=progress2` output.
pub fn parse_progress_percent(line: &str) -> Option<u8> {
    line.split_whitespace()
        .find(|token| token.ends_with('%'))
        .and_then(|token| token.trim_end_matches('%').parse::<u8>().ok())
        .filter(|p| *p <= 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::dummy::DummyRunner;
    use crate::convert::ui::ScriptedUi;

    fn write_file(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_progress_percent() {
        assert_eq!(
            parse_progress_percent("  1,442,341  42%  12.31MB/s    0:00:10"),
            Some(42)
        );
        assert_eq!(parse_progress_percent("100%"), Some(100));
        assert_eq!(parse_progress_percent("sending incremental file list"), None);
        assert_eq!(parse_progress_percent("999%"), None);
    }

    #[test]
    fn test_verify_tree_classifies_outcomes() {
        let runner = DummyRunner::new();
        let ui = ScriptedUi::new(vec![]);
        let cancel = Arc::new(AtomicBool::new(false));
        let migrator = Migrator::new(&runner, &ui, "test", cancel);

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        write_file(src.path(), "same.txt", b"identical");
        write_file(dst.path(), "same.txt", b"identical");
        write_file(src.path(), "empty.txt", b"");
        write_file(dst.path(), "empty.txt", b"");
        write_file(src.path(), "only-on-source.txt", b"data");
        write_file(src.path(), "short.txt", b"abcdef");
        write_file(dst.path(), "short.txt", b"uvwxyz"); // same size, small: size-only pass

        let big = vec![7u8; (HASH_FLOOR_BYTES + 1) as usize];
        let mut corrupted = big.clone();
        corrupted[1024] ^= 0xff;
        write_file(src.path(), "big.bin", &big);
        write_file(dst.path(), "big.bin", &corrupted); // same size, hash differs

        let outcome = migrator.verify_tree(src.path(), dst.path()).unwrap();
        assert_eq!(outcome.total, 5);
        assert_eq!(outcome.missing, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.verified.len(), 3);
        assert!(!outcome.verified.contains(&PathBuf::from("big.bin")));
        assert!(!outcome.verified.contains(&PathBuf::from("only-on-source.txt")));
    }

    #[test]
    fn test_verify_tree_hashes_match_for_identical_large_files() {
        let runner = DummyRunner::new();
        let ui = ScriptedUi::new(vec![]);
        let migrator = Migrator::new(&runner, &ui, "test", Arc::new(AtomicBool::new(false)));

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let big = vec![42u8; (HASH_FLOOR_BYTES * 2) as usize];
        write_file(src.path(), "a/b/large.bin", &big);
        write_file(dst.path(), "a/b/large.bin", &big);

        let outcome = migrator.verify_tree(src.path(), dst.path()).unwrap();
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.verified, vec![PathBuf::from("a/b/large.bin")]);
    }

    #[test]
    fn test_gate_rejects_any_failure() {
        let runner = DummyRunner::new();
        let ui = ScriptedUi::new(vec![]);
        let migrator = Migrator::new(&runner, &ui, "test", Arc::new(AtomicBool::new(false)));

        let outcome = VerifyOutcome {
            verified: vec![PathBuf::from("x")],
            missing: 0,
            failed: 1,
            total: 2,
            downgraded: 0,
        };
        let err = migrator.apply_gate(&outcome).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_gate_boundaries() {
        let runner = DummyRunner::new();
        let ui = ScriptedUi::new(vec![]);
        let migrator = Migrator::new(&runner, &ui, "test", Arc::new(AtomicBool::new(false)));

        // Exactly 10% missing, 90% verified: passes without a prompt.
        let boundary = VerifyOutcome {
            verified: (0..54).map(|i| PathBuf::from(format!("f{}", i))).collect(),
            missing: 6,
            failed: 0,
            total: 60,
            downgraded: 0,
        };
        migrator.apply_gate(&boundary).unwrap();

        // 11 of 60 missing: rejected outright.
        let over = VerifyOutcome {
            verified: (0..49).map(|i| PathBuf::from(format!("f{}", i))).collect(),
            missing: 11,
            failed: 0,
            total: 60,
            downgraded: 0,
        };
        assert!(migrator.apply_gate(&over).is_err());
    }

    #[test]
    fn test_gate_shortfall_prompt_is_failure_when_unanswered() {
        let runner = DummyRunner::new();
        // Script holds no answers: the prompt resolves to Cancelled.
        let ui = ScriptedUi::new(vec![]);
        let migrator = Migrator::new(&runner, &ui, "test", Arc::new(AtomicBool::new(false)));

        let outcome = VerifyOutcome {
            verified: (0..5).map(|i| PathBuf::from(format!("f{}", i))).collect(),
            missing: 1,
            failed: 0,
            total: 10,
            downgraded: 0,
        };
        assert!(migrator.apply_gate(&outcome).is_err());
        assert!(ui.saw_event_containing("prompt:"));
    }

    #[test]
    fn test_prune_deletes_only_the_manifest() {
        let runner = DummyRunner::new();
        let ui = ScriptedUi::new(vec![]);
        let migrator = Migrator::new(&runner, &ui, "test", Arc::new(AtomicBool::new(false)));

        let src = tempfile::tempdir().unwrap();
        write_file(src.path(), "keep/hold.txt", b"stays");
        write_file(src.path(), "gone/a.txt", b"verified");
        write_file(src.path(), "gone/b.txt", b"verified");

        let manifest = vec![PathBuf::from("gone/a.txt"), PathBuf::from("gone/b.txt")];
        let pruned = migrator.prune_verified(src.path(), &manifest);

        assert_eq!(pruned, 2);
        assert!(src.path().join("keep/hold.txt").exists());
        assert!(!src.path().join("gone/a.txt").exists());
        // Emptied directory swept, occupied one kept.
        assert!(!src.path().join("gone").exists());
        assert!(src.path().join("keep").exists());
    }

    #[test]
    fn test_enumerate_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", b"12345");
        write_file(dir.path(), "sub/b.txt", b"123");
        let (files, bytes) = enumerate_tree(dir.path()).unwrap();
        assert_eq!(files, 2);
        assert_eq!(bytes, 8);
    }
}
