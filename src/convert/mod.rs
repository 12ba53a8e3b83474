//! In-place NTFS to Linux filesystem conversion.
//!
//! The pieces, leaves first: the process seam (`runner`, `dummy`), the
//! filesystem kind table (`fs`), the inspector and block layer, the
//! verified migrator, the state journal, and the engine that composes
//! them. This module owns the startup flow: resume offer, interactive
//! selection, preflight, and handing control to the engine.

pub mod block;
pub mod dummy;
pub mod engine;
pub mod error;
pub mod fs;
pub mod inspect;
pub mod journal;
pub mod migrate;
pub mod preflight;
pub mod runner;
pub mod ui;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use self::dummy::DummyRunner;
use self::engine::Engine;
use self::error::ConvertError;
use self::fs::FsKind;
use self::inspect::{DiskRotation, Inspector, NtfsCandidate};
use self::journal::{ConversionState, Journal, LastOperation};
use self::runner::{Runner, SystemRunner};
use self::ui::{ConsoleUi, LogLevel, PromptResponse, UiSink};

pub struct ConvertOptions {
    pub dry_run: bool,
    pub dummy_mode: bool,
    pub log_file: Option<PathBuf>,
}

pub fn run(options: &ConvertOptions) -> Result<()> {
    let runner: Box<dyn Runner> = if options.dummy_mode {
        Box::new(DummyRunner::demo())
    } else {
        Box::new(SystemRunner::new(options.dry_run, options.log_file.clone()))
    };
    let ui = ConsoleUi::new();

    if options.dry_run {
        ui.log(
            LogLevel::Info,
            "*** DRY RUN MODE ENABLED - no changes will be made ***",
        );
    }
    if options.dummy_mode {
        ui.log(
            LogLevel::Info,
            "*** DUMMY MODE - operating on a simulated disk ***",
        );
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    let journal = if options.dummy_mode {
        let home = dirs::home_dir().context("cannot determine home directory")?;
        Journal::at(home.join(".ntfs2linux").join("dummy"))
    } else {
        Journal::open_default()?
    };

    let state = match offer_resume(&journal, &ui)? {
        Some(state) => {
            ui.log(
                LogLevel::Info,
                &format!(
                    "resuming conversion of {} at checkpoint {} (iteration {})",
                    state.device,
                    state.last_operation.as_str(),
                    state.iteration
                ),
            );
            state
        }
        None => interactive_setup(runner.as_ref(), &ui)?,
    };

    let mut engine = Engine::new(runner.as_ref(), &ui, journal, state, cancel);
    engine.run()
}

/// If journals exist, ask whether to resume the newest. A journal file is
/// also the lock against converting the same device twice, so starting
/// fresh discards it explicitly.
fn offer_resume(journal: &Journal, ui: &dyn UiSink) -> Result<Option<ConversionState>> {
    let Some(state) = journal.all()?.into_iter().next() else {
        return Ok(None);
    };
    let title = format!(
        "An interrupted conversion of {} to {} was found (at {}). Resume it?",
        state.device,
        state.target_kind,
        state.last_operation.as_str()
    );
    match ui.prompt(&title, &["Resume", "Discard it and start fresh", "Quit"]) {
        PromptResponse::Choice(0) => Ok(Some(state)),
        PromptResponse::Choice(1) => {
            journal.remove(&state.device)?;
            Ok(None)
        }
        _ => Err(ConvertError::UserAborted.into()),
    }
}

fn interactive_setup(runner: &dyn Runner, ui: &dyn UiSink) -> Result<ConversionState> {
    let inspector = Inspector::new(runner, ui);

    let candidates = inspector.ntfs_candidates()?;
    if candidates.is_empty() {
        return Err(ConvertError::Preflight("no NTFS volumes found".into()).into());
    }
    let source = choose_source(ui, &candidates)?;

    let kind_names: Vec<&str> = FsKind::TARGETS.iter().map(|k| k.name()).collect();
    let kind = FsKind::TARGETS[choose(ui, "Convert to which filesystem?", &kind_names)?];

    let (target_partition, use_existing_target) = choose_target_mode(ui, &inspector, &source)?;

    if inspector.rotation(&source.device) == DiskRotation::Rotational {
        let answer = ui.prompt(
            "The source disk is rotational. Defragmenting NTFS under Windows first \
             shortens the conversion considerably. Continue without defragmenting?",
            &["Continue", "Abort"],
        );
        if answer != PromptResponse::Choice(0) {
            return Err(ConvertError::UserAborted.into());
        }
    }

    let summary = format!(
        "Convert {} ({} MiB NTFS) on {} to {}. All data will be moved in place. Proceed?",
        source.partition,
        source.size_kb / 1024,
        source.device,
        kind
    );
    if ui.prompt(&summary, &["Start conversion", "Abort"]) != PromptResponse::Choice(0) {
        return Err(ConvertError::UserAborted.into());
    }

    preflight::run_preflight(
        runner,
        ui,
        &source.device,
        &source.partition,
        kind,
        use_existing_target,
    )?;

    Ok(ConversionState {
        device: source.device.clone(),
        target_kind: kind,
        source_partition: source.partition.clone(),
        target_partition,
        use_existing_target,
        iteration: 0,
        last_operation: LastOperation::IterationStart,
        files_migrated_total: 0,
    })
}

fn choose_source(ui: &dyn UiSink, candidates: &[NtfsCandidate]) -> Result<NtfsCandidate> {
    let labels: Vec<String> = candidates
        .iter()
        .map(|c| {
            format!(
                "{} ({} MiB NTFS on {})",
                c.partition,
                c.size_kb / 1024,
                c.device
            )
        })
        .collect();
    let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
    let index = choose(ui, "Select the NTFS volume to convert", &refs)?;
    Ok(candidates[index].clone())
}

fn choose_target_mode(
    ui: &dyn UiSink,
    inspector: &Inspector,
    source: &NtfsCandidate,
) -> Result<(Option<String>, bool)> {
    let mode = choose(
        ui,
        "Where should the target volume live?",
        &[
            "Create it in space freed from the source (recommended)",
            "Use an existing partition on the same disk",
        ],
    )?;
    if mode == 0 {
        return Ok((None, false));
    }

    let others: Vec<String> = inspector
        .children(&source.device)?
        .into_iter()
        .filter(|p| p != &source.partition)
        .collect();
    if others.is_empty() {
        return Err(ConvertError::Preflight(format!(
            "{} has no other partition to use as a target",
            source.device
        ))
        .into());
    }
    let refs: Vec<&str> = others.iter().map(String::as_str).collect();
    let index = choose(
        ui,
        "Select the existing target partition (its filesystem must already be in place)",
        &refs,
    )?;
    Ok((Some(others[index].clone()), true))
}

fn choose(ui: &dyn UiSink, title: &str, options: &[&str]) -> Result<usize> {
    match ui.prompt(title, options) {
        PromptResponse::Choice(index) => Ok(index),
        PromptResponse::Cancelled => Err(ConvertError::UserAborted.into()),
    }
}
