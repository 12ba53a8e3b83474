//! Shared scaffolding for the simulated end-to-end scenarios.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use ntfs2linux::convert::dummy::DummyRunner;
use ntfs2linux::convert::engine::Engine;
use ntfs2linux::convert::fs::FsKind;
use ntfs2linux::convert::journal::{ConversionState, Journal, LastOperation};
use ntfs2linux::convert::migrate::SettleConfig;
use ntfs2linux::convert::ui::ScriptedUi;

pub const KIB: u64 = 1;
pub const MIB: u64 = 1024 * KIB;

/// Settling wait shrunk so scenarios run in milliseconds.
pub fn fast_settle() -> SettleConfig {
    SettleConfig {
        poll: Duration::from_millis(10),
        threshold: 10,
        cap: Duration::from_millis(100),
    }
}

pub fn fresh_state(device: &str, source: &str, kind: FsKind) -> ConversionState {
    ConversionState {
        device: device.to_string(),
        target_kind: kind,
        source_partition: source.to_string(),
        target_partition: None,
        use_existing_target: false,
        iteration: 0,
        last_operation: LastOperation::IterationStart,
        files_migrated_total: 0,
    }
}

pub fn make_engine<'r>(
    runner: &'r DummyRunner,
    ui: &'r ScriptedUi,
    journal_dir: &Path,
    state: ConversionState,
) -> Engine<'r> {
    let journal = Journal::at(journal_dir.to_path_buf());
    let mut engine = Engine::new(runner, ui, journal, state, Arc::new(AtomicBool::new(false)));
    engine.settle = fast_settle();
    engine
}

/// Seed `count` files of `size` bytes under `prefix` on a partition.
pub fn seed_files(runner: &DummyRunner, partition: &str, prefix: &str, count: u32, size: usize) {
    for i in 0..count {
        runner.seed_file(partition, &format!("{}/file{:03}.bin", prefix, i), size);
    }
}
