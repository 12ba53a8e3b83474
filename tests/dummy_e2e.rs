//! End-to-end conversion scenarios against the simulated block layer.

mod common;

use common::*;

use ntfs2linux::convert::dummy::DummyRunner;
use ntfs2linux::convert::error::ConvertError;
use ntfs2linux::convert::fs::FsKind;
use ntfs2linux::convert::journal::{Journal, LastOperation};
use ntfs2linux::convert::ui::{PromptResponse, ScriptedUi};

const DEV: &str = "/dev/vda";
const SRC: &str = "/dev/vda1";

/// 10 GiB NTFS, nothing on it: no migration iterations, source deleted,
/// target formatted and grown across the whole disk.
#[test]
fn empty_source_converts_without_migrating() {
    let runner = DummyRunner::new();
    runner.add_disk(DEV, 10 * 1024 * MIB, false);
    runner.add_partition(DEV, 1, MIB, 10 * 1024 * MIB - MIB, Some("ntfs"));

    let ui = ScriptedUi::new(vec![]);
    let journal_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &runner,
        &ui,
        journal_dir.path(),
        fresh_state(DEV, SRC, FsKind::Ext4),
    );
    engine.run().unwrap();

    let parts = runner.partitions_of(DEV);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].fs.as_deref(), Some("ext4"));
    assert_eq!(parts[0].start_kb, MIB);
    assert_eq!(parts[0].start_kb + parts[0].size_kb, 10 * 1024 * MIB);

    assert_eq!(engine.state().files_migrated_total, 0);
    assert_eq!(engine.state().iteration, 0);
    assert!(!ui.saw_event_containing("migrating files"));

    let journal = Journal::at(journal_dir.path().to_path_buf());
    assert!(journal.load(DEV).unwrap().is_none(), "journal cleaned up");
    assert!(!runner.any_mounted());
}

/// 100 MiB NTFS with 20 MiB in 20 files, target ext4: one iteration moves
/// everything, then finalization hands the whole disk to ext4.
#[test]
fn single_iteration_converts_to_ext4() {
    let runner = DummyRunner::new();
    runner.add_disk(DEV, 100 * MIB, false);
    runner.add_partition(DEV, 1, MIB, 99 * MIB, Some("ntfs"));
    seed_files(&runner, SRC, "data", 20, 1024 * 1024);
    let source_files = runner.files_of(SRC);

    let ui = ScriptedUi::new(vec![]);
    let journal_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &runner,
        &ui,
        journal_dir.path(),
        fresh_state(DEV, SRC, FsKind::Ext4),
    );
    engine.run().unwrap();

    let parts = runner.partitions_of(DEV);
    assert_eq!(parts.len(), 1, "source deleted, only the target remains");
    assert_eq!(parts[0].fs.as_deref(), Some("ext4"));
    assert_eq!(parts[0].start_kb, MIB);
    assert_eq!(parts[0].start_kb + parts[0].size_kb, 100 * MIB);

    let target = parts[0].path.clone();
    assert_eq!(runner.files_of(&target), source_files, "bit-for-bit file set");
    assert_eq!(engine.state().files_migrated_total, 20);
    assert_eq!(engine.state().iteration, 0);
    assert!(!runner.any_mounted());
}

/// 100 MiB NTFS with 60 MiB used, target btrfs. The first target is too
/// small for everything, so the copy is partial (within the acceptance
/// gate); the second iteration grows btrfs into the freed space with a
/// mounted resize and migrates the rest.
#[test]
fn space_limited_conversion_takes_two_iterations() {
    let runner = DummyRunner::new();
    runner.add_disk(DEV, 100 * MIB, false);
    runner.add_partition(DEV, 1, MIB, 99 * MIB, Some("ntfs"));
    // 54 small files sort before 6 large ones; the large tail does not
    // fit the first target, keeping `missing` just inside the gate.
    seed_files(&runner, SRC, "data", 54, 512 * 1024);
    seed_files(&runner, SRC, "zz", 6, 5767168);
    let source_files = runner.files_of(SRC);
    assert_eq!(source_files.len(), 60);

    let ui = ScriptedUi::new(vec![]);
    let journal_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &runner,
        &ui,
        journal_dir.path(),
        fresh_state(DEV, SRC, FsKind::Btrfs),
    );
    engine.run().unwrap();

    assert_eq!(engine.state().iteration, 1, "exactly two iterations");
    assert_eq!(engine.state().files_migrated_total, 60);

    let parts = runner.partitions_of(DEV);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].fs.as_deref(), Some("btrfs"));
    assert_eq!(parts[0].start_kb, MIB);
    assert_eq!(parts[0].start_kb + parts[0].size_kb, 100 * MIB);
    assert_eq!(runner.files_of(&parts[0].path), source_files);
    assert!(!runner.any_mounted());
}

/// Crash injected right after journaling `migrate_files` in iteration 0.
/// A resumed engine must converge to the same on-disk state as an
/// uninterrupted control run.
#[test]
fn crash_after_migrate_checkpoint_resumes_to_identical_state() {
    let seed = |runner: &DummyRunner| {
        runner.add_disk(DEV, 100 * MIB, false);
        runner.add_partition(DEV, 1, MIB, 99 * MIB, Some("ntfs"));
        seed_files(runner, SRC, "data", 20, 1024 * 1024);
    };

    // Control run, no crash.
    let control = DummyRunner::new();
    seed(&control);
    let control_ui = ScriptedUi::new(vec![]);
    let control_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &control,
        &control_ui,
        control_dir.path(),
        fresh_state(DEV, SRC, FsKind::Ext4),
    );
    engine.run().unwrap();

    // Crashing run.
    let runner = DummyRunner::new();
    seed(&runner);
    let ui = ScriptedUi::new(vec![]);
    let journal_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &runner,
        &ui,
        journal_dir.path(),
        fresh_state(DEV, SRC, FsKind::Ext4),
    );
    engine.halt_after = Some(LastOperation::MigrateFiles);
    let err = engine.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConvertError>(),
        Some(ConvertError::Interrupted)
    ));

    // The journal reflects the last completed transition.
    let journal = Journal::at(journal_dir.path().to_path_buf());
    let state = journal.load(DEV).unwrap().expect("journal survives the crash");
    assert_eq!(state.last_operation, LastOperation::MigrateFiles);
    assert_eq!(state.iteration, 0);
    assert!(state.target_partition.is_some());
    assert!(!runner.any_mounted(), "crash released every mount");

    // Restart from the journal.
    let resume_ui = ScriptedUi::new(vec![]);
    let mut engine = make_engine(&runner, &resume_ui, journal_dir.path(), state);
    engine.run().unwrap();

    assert_eq!(runner.partitions_of(DEV), control.partitions_of(DEV));
    let target = runner.partitions_of(DEV)[0].path.clone();
    assert_eq!(runner.files_of(&target), control.files_of(&target));
    assert!(journal.load(DEV).unwrap().is_none());
}

/// One target file corrupted in flight (size intact): the hash check must
/// catch it, the engine must fail, and the source must keep every file.
#[test]
fn corrupted_target_file_fails_verification_and_preserves_source() {
    let runner = DummyRunner::new();
    runner.add_disk(DEV, 100 * MIB, false);
    runner.add_partition(DEV, 1, MIB, 99 * MIB, Some("ntfs"));
    seed_files(&runner, SRC, "data", 20, 1024 * 1024);
    runner.corrupt_after_copy("data/file003.bin");
    let source_files = runner.files_of(SRC);

    let ui = ScriptedUi::new(vec![]);
    let journal_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &runner,
        &ui,
        journal_dir.path(),
        fresh_state(DEV, SRC, FsKind::Ext4),
    );
    let err = engine.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConvertError>(),
        Some(ConvertError::VerificationFailed(_))
    ));

    // Nothing deleted from the source; journal still at migrate_files.
    assert_eq!(runner.files_of(SRC), source_files);
    let journal = Journal::at(journal_dir.path().to_path_buf());
    let state = journal.load(DEV).unwrap().unwrap();
    assert_eq!(state.last_operation, LastOperation::MigrateFiles);
    assert!(!runner.any_mounted());
}

/// An inspector that keeps reporting the same used space trips the
/// no-progress counter on the fourth iteration; answering "abort" ends
/// the run with the journal at that iteration's start.
#[test]
fn stalled_source_prompts_and_aborts_after_three_flat_iterations() {
    let runner = DummyRunner::new();
    runner.add_disk(DEV, 100 * MIB, false);
    runner.add_partition(DEV, 1, MIB, 99 * MIB, Some("ntfs"));
    seed_files(&runner, SRC, "data", 20, 1024 * 1024);
    runner.pin_used_kb(SRC, 20 * MIB);

    // Single scripted answer: "Abort" at the no-progress prompt.
    let ui = ScriptedUi::new(vec![PromptResponse::Choice(1)]);
    let journal_dir = tempfile::tempdir().unwrap();
    let mut engine = make_engine(
        &runner,
        &ui,
        journal_dir.path(),
        fresh_state(DEV, SRC, FsKind::Ext4),
    );
    let err = engine.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConvertError>(),
        Some(ConvertError::NoProgress(_))
    ));
    assert!(ui.saw_event_containing("no measurable progress"));

    let journal = Journal::at(journal_dir.path().to_path_buf());
    let state = journal.load(DEV).unwrap().unwrap();
    assert_eq!(state.last_operation, LastOperation::IterationStart);
    assert_eq!(state.iteration, 3, "stalled on the fourth iteration");
    assert!(!runner.any_mounted());
}
