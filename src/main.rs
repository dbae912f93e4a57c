// ============================================
// Reimager - main.rs
// ============================================
// Entry point. Parses the command line, loads the config, wires the real
// tools (7-Zip, DISM, certutil, curl) into the pipeline and runs it.
//
// The program flow is:
// 1. parse arguments, set up logging
// 2. make sure we're elevated (DISM needs it)
// 3. load + validate reimager.toml
// 4. build the Selection
// 5. run the pipeline; on a real machine it ends in a reboot
//
// Exit codes: 0 = staged (or rebooting), 1 = pipeline aborted,
// 2 = bad input or config, nothing was touched.
// ============================================

mod config;
mod dism;
mod drivers;
mod error;
mod fetch;
mod image;
mod pipeline;
mod process;
mod selection;
mod staging;
mod tools;
mod verify;

#[cfg(test)]
mod fakes;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use config::{Config, DownloaderKind, DEFAULT_CONFIG_FILE};
use dism::Dism;
use error::ReimageError;
use pipeline::{Collaborators, PipelineController, RunDirectories, RunOptions, RunState};
use process::SystemRunner;
use selection::{Mode, Selection};
use tools::{Certutil, Curl, Downloader, HttpDownloader, SevenZip};

#[derive(Parser, Debug)]
#[command(name = "reimager", version)]
#[command(about = "Reinstall Windows unattended: fetch, verify, convert, inject drivers, stage PE, reboot")]
struct Cli {
    /// Image to install
    #[arg(long = "select", value_enum)]
    mode: Mode,

    /// Custom image (.iso, .wim or .esd); required with --select custom
    #[arg(long)]
    path: Option<PathBuf>,

    /// Edition index inside a custom image (default 1)
    #[arg(long = "set", value_parser = clap::value_parser!(u32).range(1..))]
    index: Option<u32>,

    /// Carry the running system's drivers over into the new image
    #[arg(long = "backupdrive", value_name = "true|false", action = ArgAction::Set, default_value_t = false)]
    backup_drivers: bool,

    /// Run configuration
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Stage the boot medium but don't reboot into it
    #[arg(long)]
    skip_reboot: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    tracing::info!("============================================");
    tracing::info!("Reimager v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("============================================");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to set up logging: {}", e);
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<ReimageError>() {
        Some(err) if err.is_usage_error() => 2,
        _ => 1,
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_elevated()?;

    let mut config = Config::load_or_default(&cli.config)?;
    config.paths.work_dir = absolute_work_dir(&config.paths.work_dir)?;
    tracing::info!("Work directory: {}", config.paths.work_dir.display());

    let selection = Selection::new(cli.mode, cli.path, cli.index, cli.backup_drivers)?;
    if let Some(previous) = RunState::load(&config.paths.work_dir) {
        tracing::info!(
            "Previous run ({}) stopped after stage {:?}",
            previous.selection.mode,
            previous.last_completed
        );
    }

    let dirs = RunDirectories::new(&config.paths.work_dir);
    let runner = SystemRunner::new(Some(config.paths.work_dir.clone()));
    let archiver = SevenZip {
        exe: dirs.tool_path(&config.tools.seven_zip),
        runner: &runner,
    };
    let images = Dism {
        exe: dirs.tool_path(&config.tools.dism),
        runner: &runner,
    };
    let hasher = Certutil {
        exe: dirs.tool_path(&config.tools.certutil),
        algorithm: config.fetch.digest,
        runner: &runner,
    };
    let downloader: Box<dyn Downloader + '_> = match config.fetch.downloader {
        DownloaderKind::Curl => Box::new(Curl {
            exe: dirs.tool_path(&config.tools.curl),
            runner: &runner,
        }),
        DownloaderKind::Http => Box::new(HttpDownloader::new()?),
    };

    let tools = Collaborators {
        runner: &runner,
        archiver: &archiver,
        images: &images,
        hasher: &hasher,
        downloader: downloader.as_ref(),
    };
    let options = RunOptions {
        skip_reboot: cli.skip_reboot,
    };
    let image = PipelineController::new(tools, &config, options).run(&selection)?;

    tracing::info!(
        "Done: {} (index {}) staged on {}",
        image.path.display(),
        image.index,
        config.paths.boot_medium.display()
    );
    Ok(())
}

/// Spawned tools run with the work dir as their current directory, so the
/// work dir itself has to be absolute.
fn absolute_work_dir(work: &Path) -> anyhow::Result<PathBuf> {
    if work.is_absolute() {
        return Ok(work.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    Ok(cwd.join(work))
}

#[cfg(windows)]
fn ensure_elevated() -> error::Result<()> {
    // SAFETY: IsUserAnAdmin takes no arguments and only queries the token
    let elevated = unsafe { winapi::um::shlobj::IsUserAnAdmin() } != 0;
    if !elevated {
        return Err(ReimageError::Validation(
            "administrator rights are required; run from an elevated prompt".to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(windows))]
fn ensure_elevated() -> error::Result<()> {
    tracing::warn!("Not running on Windows; DISM and the staging scripts won't be available");
    Ok(())
}
