//! Conversion Engine: the iterative state machine that composes the
//! inspector, block layer, migrator and journal.
//!
//! Each checkpoint is persisted to the journal before the engine moves on,
//! so a crash at any point resumes at a safe retry point. Pre-migrate
//! checkpoints are idempotent because they are functions of the current
//! on-disk geometry; the migrator re-verifies already-copied files.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::block::{BlockLayer, parse_partition_number};
use super::error::ConvertError;
use super::inspect::{DiskTable, Inspector, TableEntry, free_regions_of};
use super::journal::{ConversionState, Journal, LastOperation};
use super::migrate::{Migrator, SettleConfig, durability_barrier};
use super::runner::Runner;
use super::ui::{LogLevel, ProgressPanel, PromptResponse, UiSink};

const MIB_KB: u64 = 1024;

/// Gap left between the shrunk source and the target partition.
const PART_GAP_KB: u64 = MIB_KB;

/// Iterations below this delta count as no progress.
const PROGRESS_DELTA_KB: u64 = MIB_KB;

const NO_PROGRESS_LIMIT: u32 = 3;

/// The source counts as empty below ~0.1% of the disk (at least 1 MiB).
pub fn empty_threshold_kb(disk_total_kb: u64) -> u64 {
    (disk_total_kb / 1000).max(MIB_KB)
}

/// Iteration continues while more than ~1% of the disk (at least 10 MiB)
/// remains on the source.
pub fn continue_threshold_kb(disk_total_kb: u64) -> u64 {
    (disk_total_kb / 100).max(10 * MIB_KB)
}

/// Shrink target: live data plus a 5% safety buffer.
pub fn shrink_target_kb(used_kb: u64) -> u64 {
    (used_kb + used_kb / 20).max(MIB_KB)
}

/// The extent a partition can expand to: its own extent united with the
/// free space touching it on either side, bounded by neighboring entries
/// and the usable disk range.
pub fn expansion_extent(table: &DiskTable, entry: &TableEntry) -> (u64, u64) {
    let left = table
        .entries
        .iter()
        .filter(|e| e.node != entry.node && e.end_kb() <= entry.start_kb)
        .map(|e| e.end_kb())
        .max()
        .unwrap_or(table.first_usable_kb)
        .max(table.first_usable_kb);
    let right = table
        .entries
        .iter()
        .filter(|e| e.node != entry.node && e.start_kb >= entry.end_kb())
        .map(|e| e.start_kb)
        .min()
        .unwrap_or(table.last_usable_kb)
        .min(table.last_usable_kb);
    (left, right)
}

pub struct Engine<'r> {
    runner: &'r dyn Runner,
    ui: &'r dyn UiSink,
    journal: Journal,
    state: ConversionState,
    cancel: Arc<AtomicBool>,
    instance_id: String,
    /// Settling-wait tuning, overridable by tests.
    pub settle: SettleConfig,
    /// Stop as if interrupted right after journaling this checkpoint.
    /// Drives the crash/resume tests.
    pub halt_after: Option<LastOperation>,
    prev_used_kb: Option<u64>,
    no_progress_rounds: u32,
    initial_used_kb: Option<u64>,
}

impl<'r> Engine<'r> {
    pub fn new(
        runner: &'r dyn Runner,
        ui: &'r dyn UiSink,
        journal: Journal,
        state: ConversionState,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let instance_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        );
        Self {
            runner,
            ui,
            journal,
            state,
            cancel,
            instance_id,
            settle: SettleConfig::default(),
            halt_after: None,
            prev_used_kb: None,
            no_progress_rounds: 0,
            initial_used_kb: None,
        }
    }

    pub fn state(&self) -> &ConversionState {
        &self.state
    }

    /// Drive the conversion to completion, from a fresh state or a resumed
    /// journal record.
    pub fn run(&mut self) -> Result<()> {
        match self.state.last_operation {
            LastOperation::Complete => {
                // A finished run left its journal behind; just clean up.
                if !self.runner.is_dry_run() {
                    self.journal.remove(&self.state.device)?;
                }
                return Ok(());
            }
            LastOperation::DeleteSource | LastOperation::ExpandFinal => {
                self.ui.log(
                    LogLevel::Info,
                    &format!(
                        "resuming finalization of {} at {}",
                        self.state.device,
                        self.state.last_operation.as_str()
                    ),
                );
                return self.finalize();
            }
            LastOperation::CreateTarget => {
                // Crashed between creating and formatting the target: the
                // partition exists but carries no filesystem yet.
                if let Some(target) = self.state.target_partition.clone() {
                    let block = BlockLayer::new(self.runner, self.ui);
                    block.format(&target, self.state.target_kind)?;
                    self.checkpoint(LastOperation::FormatTarget)?;
                }
            }
            _ => {}
        }

        self.iteration_loop()?;
        self.finalize()
    }

    fn iteration_loop(&mut self) -> Result<()> {
        let inspector = Inspector::new(self.runner, self.ui);
        let block = BlockLayer::new(self.runner, self.ui);
        let device = self.state.device.clone();

        loop {
            self.checkpoint(LastOperation::IterationStart)?;

            let disk_total_kb = inspector.disk_total_kb(&device)?;
            let table = inspector.table(&device)?;
            let source_entry = table
                .entry_for(&self.state.source_partition)
                .with_context(|| {
                    format!(
                        "source partition {} not found on {}",
                        self.state.source_partition, device
                    )
                })?
                .clone();
            let used_kb =
                inspector.used_kb(&self.state.source_partition, source_entry.size_kb)?;
            if self.initial_used_kb.is_none() {
                self.initial_used_kb = Some(used_kb);
            }
            self.emit_panel(used_kb, "inspecting source");

            if used_kb < empty_threshold_kb(disk_total_kb) {
                self.ui.log(
                    LogLevel::Info,
                    &format!(
                        "source holds {} KiB, under the empty threshold; leaving the loop",
                        used_kb
                    ),
                );
                return Ok(());
            }

            if let Some(prev) = self.prev_used_kb {
                if prev.saturating_sub(used_kb) < PROGRESS_DELTA_KB {
                    self.no_progress_rounds += 1;
                    if self.no_progress_rounds >= NO_PROGRESS_LIMIT {
                        let answer = self.ui.prompt(
                            "Three iterations in a row made no measurable progress. Continue anyway?",
                            &["Continue", "Abort"],
                        );
                        if answer != PromptResponse::Choice(0) {
                            return Err(ConvertError::NoProgress(self.no_progress_rounds).into());
                        }
                        self.no_progress_rounds = 0;
                    }
                } else {
                    self.no_progress_rounds = 0;
                }
            }
            self.prev_used_kb = Some(used_kb);

            let shrink_to_kb = shrink_target_kb(used_kb);

            if self.state.use_existing_target {
                self.check_existing_target_space(&inspector, &table, used_kb)?;
            } else {
                block.shrink_ntfs(&device, &self.state.source_partition, shrink_to_kb)?;
                self.checkpoint(LastOperation::ShrinkNtfs)?;

                match self.state.target_partition.clone() {
                    None => {
                        // Re-read geometry: the entry shrink is best-effort
                        // and the target must start after the real end.
                        let fresh = inspector.table(&device)?;
                        let source_end_kb = fresh
                            .entry_for(&self.state.source_partition)
                            .map(|e| e.end_kb())
                            .unwrap_or(source_entry.start_kb + shrink_to_kb);
                        let target_start = source_end_kb + PART_GAP_KB;
                        let target =
                            block.create_partition(&device, target_start, table.last_usable_kb)?;
                        self.ui.log(
                            LogLevel::Success,
                            &format!(
                                "created target partition {} ({} KiB)",
                                target,
                                table.last_usable_kb.saturating_sub(target_start)
                            ),
                        );
                        self.state.target_partition = Some(target.clone());
                        self.checkpoint(LastOperation::CreateTarget)?;
                        block.format(&target, self.state.target_kind)?;
                        self.checkpoint(LastOperation::FormatTarget)?;
                    }
                    Some(target) => {
                        let fresh = inspector.table(&device)?;
                        let entry = fresh.entry_for(&target).with_context(|| {
                            format!("target partition {} vanished from {}", target, device)
                        })?;
                        let (new_start, new_end) = expansion_extent(&fresh, entry);
                        block.expand_partition(&device, entry, new_start, new_end)?;
                        block.grow_fs(&target, self.state.target_kind)?;
                        self.checkpoint(LastOperation::ExpandPartitionTable)?;
                    }
                }
            }

            self.checkpoint(LastOperation::MigrateFiles)?;
            let target = self
                .state
                .target_partition
                .clone()
                .context("no target volume to migrate onto")?;
            self.emit_panel(used_kb, "migrating files");

            let mut migrator = Migrator::new(
                self.runner,
                self.ui,
                &self.instance_id,
                Arc::clone(&self.cancel),
            );
            migrator.settle = self.settle.clone();
            let report = migrator.migrate(&device, &self.state.source_partition, &target)?;
            self.state.files_migrated_total += report.pruned;

            durability_barrier(self.runner, self.ui, &device, &[], &self.settle)?;
            let remaining_kb = inspector.used_kb(
                &self.state.source_partition,
                if self.state.use_existing_target {
                    source_entry.size_kb
                } else {
                    shrink_to_kb
                },
            )?;

            // The delta can be zero or negative when only metadata moved;
            // that is the no-progress counter's problem, not a failure.
            let migrated_kb = used_kb.saturating_sub(remaining_kb);
            self.ui.log(
                LogLevel::Info,
                &format!(
                    "iteration {}: {}/{} files verified, ~{} KiB migrated, {} KiB left on the source",
                    self.state.iteration,
                    report.verified,
                    report.total_files,
                    migrated_kb,
                    remaining_kb
                ),
            );

            if self.runner.is_dry_run() {
                self.ui.log(
                    LogLevel::Info,
                    "[DRY RUN] one iteration simulated; proceeding to finalization",
                );
                return Ok(());
            }

            if remaining_kb > continue_threshold_kb(disk_total_kb) {
                self.state.iteration += 1;
                continue;
            }
            return Ok(());
        }
    }

    fn check_existing_target_space(
        &self,
        inspector: &Inspector,
        table: &DiskTable,
        source_used_kb: u64,
    ) -> Result<()> {
        let Some(target) = &self.state.target_partition else {
            return Ok(());
        };
        let Some(entry) = table.entry_for(target) else {
            anyhow::bail!("chosen target partition {} not found", target);
        };
        let target_used = inspector.used_kb(target, entry.size_kb)?;
        let free = entry.size_kb.saturating_sub(target_used);
        if free < source_used_kb {
            self.ui.log(
                LogLevel::Warning,
                &format!(
                    "target has {} KiB free for {} KiB of source data; migration will be partial",
                    free, source_used_kb
                ),
            );
        }
        Ok(())
    }

    /// Remove the emptied source and give its space to the target.
    fn finalize(&mut self) -> Result<()> {
        let inspector = Inspector::new(self.runner, self.ui);
        let block = BlockLayer::new(self.runner, self.ui);
        let device = self.state.device.clone();

        let table = inspector.table(&device)?;
        if let Some(entry) = table.entry_for(&self.state.source_partition) {
            let leftover_kb = inspector
                .used_kb(&self.state.source_partition, entry.size_kb)
                .unwrap_or(0);
            if leftover_kb > 0 {
                self.ui.log(
                    LogLevel::Warning,
                    &format!(
                        "{} KiB of residual data will be discarded with the source partition",
                        leftover_kb
                    ),
                );
            }
            self.checkpoint(LastOperation::DeleteSource)?;
            let index = parse_partition_number(&device, &self.state.source_partition)?;
            block.delete_partition(&device, index)?;
            self.ui.log(
                LogLevel::Success,
                &format!("removed source partition {}", self.state.source_partition),
            );
        }

        self.checkpoint(LastOperation::ExpandFinal)?;
        let table = inspector.table(&device)?;
        match self.state.target_partition.clone() {
            Some(target) => {
                if let Some(entry) = table.entry_for(&target) {
                    let (new_start, new_end) = expansion_extent(&table, entry);
                    block.expand_partition(&device, entry, new_start, new_end)?;
                    block.grow_fs(&target, self.state.target_kind)?;
                }
            }
            None => {
                // The source was empty from the start: no target volume
                // exists yet. Claim the largest free region outright.
                let region = free_regions_of(&table)
                    .into_iter()
                    .max_by_key(|r| r.size_kb())
                    .context("no free region left for the target volume")?;
                let target = block.create_partition(&device, region.start_kb, region.end_kb)?;
                block.format(&target, self.state.target_kind)?;
                self.state.target_partition = Some(target);
            }
        }

        self.checkpoint(LastOperation::Complete)?;
        if !self.runner.is_dry_run() {
            self.journal.remove(&device)?;
        }
        self.ui.log(
            LogLevel::Success,
            &format!(
                "conversion complete: {} is now {}",
                self.state
                    .target_partition
                    .as_deref()
                    .unwrap_or(&self.state.device),
                self.state.target_kind
            ),
        );
        Ok(())
    }

    /// Persist the state transition, then honor halt/cancel requests. The
    /// journal always reflects the last fully completed step.
    fn checkpoint(&mut self, op: LastOperation) -> Result<()> {
        self.state.last_operation = op;
        if !self.runner.is_dry_run() {
            self.journal.persist(&self.state)?;
        }
        if self.halt_after == Some(op) {
            self.ui.log(
                LogLevel::Warning,
                &format!("halting after checkpoint {}", op.as_str()),
            );
            return Err(ConvertError::Interrupted.into());
        }
        if self.cancel.load(Ordering::SeqCst) {
            self.ui.log(
                LogLevel::Warning,
                "termination requested; progress is journaled",
            );
            return Err(ConvertError::Interrupted.into());
        }
        Ok(())
    }

    fn emit_panel(&self, used_kb: u64, current_op: &str) {
        let percent = match self.initial_used_kb {
            Some(initial) if initial > 0 => {
                (initial.saturating_sub(used_kb) * 100 / initial).min(100) as u8
            }
            _ => 0,
        };
        self.ui.panel(&ProgressPanel {
            source: self.state.source_partition.clone(),
            target: self.state.target_partition.clone(),
            iteration: self.state.iteration,
            est_iterations: self.state.iteration + 1,
            percent,
            files_migrated: self.state.files_migrated_total,
            current_op: current_op.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        // 10 GiB disk: floors dominate.
        assert_eq!(empty_threshold_kb(10 * 1024 * 1024), 10 * 1024);
        assert_eq!(continue_threshold_kb(10 * 1024 * 1024), 104857);
        // Tiny disk: floors apply.
        assert_eq!(empty_threshold_kb(100 * 1024), 1024);
        assert_eq!(continue_threshold_kb(100 * 1024), 10 * 1024);
    }

    #[test]
    fn test_shrink_target_adds_five_percent() {
        assert_eq!(shrink_target_kb(2 * 1024 * 1024), 2 * 1024 * 1024 + 104857);
        // Never below 1 MiB, or NTFS has no room to exist.
        assert_eq!(shrink_target_kb(10), 1024);
    }

    fn entry(node: &str, index: u32, start_kb: u64, size_kb: u64) -> TableEntry {
        TableEntry {
            node: node.to_string(),
            index,
            start_kb,
            size_kb,
        }
    }

    #[test]
    fn test_expansion_extent_claims_adjacent_gaps() {
        let table = DiskTable {
            first_usable_kb: 1024,
            last_usable_kb: 100 * 1024 * 1024,
            entries: vec![
                entry("/dev/sda1", 1, 1024, 21 * 1024 * 1024),
                entry("/dev/sda2", 2, 63 * 1024 * 1024, 37 * 1024 * 1024),
            ],
        };
        // The target can grow left across the gap the shrink opened.
        let (start, end) = expansion_extent(&table, &table.entries[1]);
        assert_eq!(start, 1024 + 21 * 1024 * 1024);
        assert_eq!(end, 100 * 1024 * 1024);
    }

    #[test]
    fn test_expansion_extent_with_source_deleted() {
        let table = DiskTable {
            first_usable_kb: 1024,
            last_usable_kb: 10 * 1024 * 1024,
            entries: vec![entry("/dev/sda2", 2, 3 * 1024 * 1024, 7 * 1024 * 1024)],
        };
        let (start, end) = expansion_extent(&table, &table.entries[0]);
        assert_eq!(start, 1024);
        assert_eq!(end, 10 * 1024 * 1024);
    }

    #[test]
    fn test_expansion_extent_respects_neighbors() {
        let table = DiskTable {
            first_usable_kb: 1024,
            last_usable_kb: 100 * 1024,
            entries: vec![
                entry("/dev/sda1", 1, 1024, 10 * 1024),
                entry("/dev/sda2", 2, 20 * 1024, 30 * 1024),
                entry("/dev/sda3", 3, 80 * 1024, 10 * 1024),
            ],
        };
        let (start, end) = expansion_extent(&table, &table.entries[1]);
        assert_eq!(start, 11 * 1024);
        assert_eq!(end, 80 * 1024);
    }
}
