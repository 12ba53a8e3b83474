//! Crash-safe record of engine progress, one file per source device.
//!
//! The journal is written as a whole-file overwrite of `KEY=value` lines
//! after each state transition, and only after the operation the record
//! names has observably completed on disk. On startup the presence of a
//! journal file is the resume offer (and the lock against a second
//! conversion of the same device).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::fs::FsKind;

/// The checkpoint names of the conversion state machine, in the order a
/// fresh run passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOperation {
    IterationStart,
    ShrinkNtfs,
    CreateTarget,
    FormatTarget,
    ExpandPartitionTable,
    MigrateFiles,
    DeleteSource,
    ExpandFinal,
    Complete,
}

impl LastOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastOperation::IterationStart => "iteration_start",
            LastOperation::ShrinkNtfs => "shrink_ntfs",
            LastOperation::CreateTarget => "create_target",
            LastOperation::FormatTarget => "format_target",
            LastOperation::ExpandPartitionTable => "expand_partition_table",
            LastOperation::MigrateFiles => "migrate_files",
            LastOperation::DeleteSource => "delete_source",
            LastOperation::ExpandFinal => "expand_final",
            LastOperation::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "iteration_start" => Some(LastOperation::IterationStart),
            "shrink_ntfs" => Some(LastOperation::ShrinkNtfs),
            "create_target" => Some(LastOperation::CreateTarget),
            "format_target" => Some(LastOperation::FormatTarget),
            "expand_partition_table" => Some(LastOperation::ExpandPartitionTable),
            "migrate_files" => Some(LastOperation::MigrateFiles),
            "delete_source" => Some(LastOperation::DeleteSource),
            "expand_final" => Some(LastOperation::ExpandFinal),
            "complete" => Some(LastOperation::Complete),
            _ => None,
        }
    }
}

/// The persisted subset of conversion state.
#[derive(Debug, Clone)]
pub struct ConversionState {
    pub device: String,
    pub target_kind: FsKind,
    pub source_partition: String,
    pub target_partition: Option<String>,
    pub use_existing_target: bool,
    pub iteration: u32,
    pub last_operation: LastOperation,
    pub files_migrated_total: u64,
}

impl ConversionState {
    fn to_record(&self) -> String {
        format!(
            "DEVICE={}\n\
             TARGET_KIND={}\n\
             SOURCE_PARTITION={}\n\
             TARGET_PARTITION={}\n\
             USE_EXISTING_TARGET={}\n\
             ITERATION={}\n\
             LAST_OPERATION={}\n\
             FILES_MIGRATED_TOTAL={}\n",
            self.device,
            self.target_kind.name(),
            self.source_partition,
            self.target_partition.as_deref().unwrap_or(""),
            self.use_existing_target,
            self.iteration,
            self.last_operation.as_str(),
            self.files_migrated_total,
        )
    }

    fn from_record(content: &str) -> Result<Self> {
        let mut device = None;
        let mut target_kind = None;
        let mut source_partition = None;
        let mut target_partition = None;
        let mut use_existing_target = false;
        let mut iteration = 0u32;
        let mut last_operation = None;
        let mut files_migrated_total = 0u64;

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "DEVICE" => device = Some(value.to_string()),
                "TARGET_KIND" => target_kind = FsKind::from_name(value),
                "SOURCE_PARTITION" => source_partition = Some(value.to_string()),
                "TARGET_PARTITION" => {
                    if !value.is_empty() {
                        target_partition = Some(value.to_string());
                    }
                }
                "USE_EXISTING_TARGET" => use_existing_target = value == "true",
                "ITERATION" => iteration = value.parse().unwrap_or(0),
                "LAST_OPERATION" => last_operation = LastOperation::from_str(value),
                "FILES_MIGRATED_TOTAL" => files_migrated_total = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        Ok(ConversionState {
            device: device.context("journal record missing DEVICE")?,
            target_kind: target_kind.context("journal record missing TARGET_KIND")?,
            source_partition: source_partition.context("journal record missing SOURCE_PARTITION")?,
            target_partition,
            use_existing_target,
            iteration,
            last_operation: last_operation.context("journal record missing LAST_OPERATION")?,
            files_migrated_total,
        })
    }
}

pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    /// The per-user journal directory, `~/.ntfs2linux`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("cannot determine home directory")?;
        Ok(Self::at(home.join(".ntfs2linux")))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, device: &str) -> PathBuf {
        let base = Path::new(device)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| device.replace('/', "_"));
        self.dir.join(format!("{}.state", base))
    }

    /// Whole-file overwrite of the record for this state's device.
    pub fn persist(&self, state: &ConversionState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(&state.device);
        std::fs::write(&path, state.to_record())
            .with_context(|| format!("failed to write journal {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, device: &str) -> Result<Option<ConversionState>> {
        let path = self.path_for(device);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read journal {}", path.display()))?;
        Ok(Some(ConversionState::from_record(&content)?))
    }

    /// All resumable records, newest first by modification time.
    pub fn all(&self) -> Result<Vec<ConversionState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(std::time::SystemTime, ConversionState)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("state") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(state) = ConversionState::from_record(&content) {
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                found.push((mtime, state));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, s)| s).collect())
    }

    pub fn remove(&self, device: &str) -> Result<()> {
        let path = self.path_for(device);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove journal {}", path.display()))?;
        }
        Ok(())
    }
}
