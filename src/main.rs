use clap::Parser;
use colored::Colorize;
use sudo::RunningAs;

use ntfs2linux::convert;

use convert::ConvertOptions;
use convert::error::ConvertError;

/// In-place, non-destructive conversion of an NTFS volume to a Linux
/// filesystem (ext4, btrfs, xfs, f2fs, reiserfs or jfs).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log intended block operations without changing anything
    #[arg(long, conflicts_with = "dummy_mode")]
    dry_run: bool,

    /// Operate on a simulated disk (UI and flow testing)
    #[arg(long)]
    dummy_mode: bool,

    /// Append a timestamped command log to this file
    #[arg(long, hide = true)]
    log_file: Option<std::path::PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    // Block tools need real privileges; the simulation does not.
    if !cli.dummy_mode && !matches!(sudo::check(), RunningAs::Root) {
        eprintln!("{}", "ntfs2linux must be run as root".red());
        std::process::exit(1);
    }

    let options = ConvertOptions {
        dry_run: cli.dry_run,
        dummy_mode: cli.dummy_mode,
        log_file: cli.log_file,
    };

    if let Err(e) = convert::run(&options) {
        match e.downcast_ref::<ConvertError>() {
            Some(ConvertError::UserAborted) => {
                eprintln!("{}", "conversion aborted".yellow());
            }
            Some(ConvertError::Interrupted) => {
                eprintln!(
                    "{}",
                    "conversion interrupted; run again to resume from the journal".yellow()
                );
            }
            _ => {
                eprintln!("{} {:#}", "conversion failed:".red().bold(), e);
            }
        }
        std::process::exit(1);
    }
}
