// ============================================
// Reimager - pipeline.rs
// ============================================
// The run, start to finish, strictly in order:
//
//   1. clear a mount left behind by a crashed run
//   2. purge + recreate the work directories
//   3. fetch & verify the PE base image
//   4. fetch & verify the preset ISO (skipped for custom images)
//   5. resolve the canonical install.wim
//   6. check the install index exists in it
//   7. driver backup & injection (if requested)
//   8. stage the boot medium
//   9. hand off to the reboot script
//
// The first error stops the run; nothing after it executes and nothing
// before it is rolled back. Stages talk to each other only through files
// in the work directory.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dism::{self, ImageService};
use crate::drivers::DriverStage;
use crate::error::{IoContext, ReimageError, Result};
use crate::fetch::FetchWithVerify;
use crate::image::{CanonicalImage, ImageResolver};
use crate::process::CommandRunner;
use crate::selection::Selection;
use crate::staging::Staging;
use crate::tools::{Archiver, Downloader, Hasher};
use crate::verify::ContentVerifier;

/// Diagnostic record of how far the last run got.
pub const RUN_STATE_FILE: &str = "run-state.json";

// ============================================
// RUN DIRECTORIES
// ============================================

/// The fixed directories a run owns. Two runs sharing a work dir would
/// race on install.wim and the mount point, so only one may run at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectories {
    pub work: PathBuf,
    pub sources: PathBuf,
    pub drivers: PathBuf,
    pub pe: PathBuf,
    pub mount: PathBuf,
}

impl RunDirectories {
    pub fn new(work: &Path) -> Self {
        RunDirectories {
            work: work.to_path_buf(),
            sources: work.join("sources"),
            drivers: work.join("drivers"),
            pe: work.join("pe"),
            mount: work.join("mount"),
        }
    }

    pub fn canonical_image(&self) -> PathBuf {
        self.sources.join("install.wim")
    }

    /// Remove everything a previous run produced.
    ///
    /// Entries of pe/ listed in `cached` survive: they are downloads that
    /// get re-verified against their fingerprint before use.
    pub fn purge(&self, cached: &[PathBuf]) -> Result<()> {
        for dir in [&self.sources, &self.drivers, &self.mount] {
            if dir.exists() {
                fs::remove_dir_all(dir).io_context(|| format!("remove {}", dir.display()))?;
            }
        }
        if !self.pe.is_dir() {
            return Ok(());
        }
        let entries =
            fs::read_dir(&self.pe).io_context(|| format!("read {}", self.pe.display()))?;
        for entry in entries {
            let path = entry
                .io_context(|| format!("read {}", self.pe.display()))?
                .path();
            if cached.contains(&path) {
                continue;
            }
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .io_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn create(&self) -> Result<()> {
        for dir in [&self.work, &self.sources, &self.drivers, &self.pe] {
            fs::create_dir_all(dir).io_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn recreate_mount(&self) -> Result<()> {
        if self.mount.exists() {
            fs::remove_dir_all(&self.mount)
                .io_context(|| format!("remove {}", self.mount.display()))?;
        }
        fs::create_dir_all(&self.mount)
            .io_context(|| format!("create {}", self.mount.display()))
    }

    /// Relative tool paths with a directory part ("tools\7z.exe") live
    /// under the work dir. Bare names ("dism") are left for PATH lookup.
    pub fn tool_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.components().count() <= 1 {
            path.to_path_buf()
        } else {
            self.work.join(path)
        }
    }
}

// ============================================
// RUN JOURNAL
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Started,
    Prepared,
    PeFetched,
    SourceFetched,
    ImageResolved,
    DriversInjected,
    MediumStaged,
    HandedOff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub selection: Selection,
    pub last_completed: Stage,
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
}

impl RunState {
    pub fn load(work: &Path) -> Option<RunState> {
        let content = fs::read_to_string(work.join(RUN_STATE_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

// ============================================
// CONTROLLER
// ============================================

/// The external tools a run drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Staging and reboot scripts
    pub runner: &'a dyn CommandRunner,
    /// Pulls install.wim out of ISOs, unpacks the PE onto the medium
    pub archiver: &'a dyn Archiver,
    /// DISM: mount, driver injection, ESD export, edition listing
    pub images: &'a dyn ImageService,
    /// Fingerprints downloaded files
    pub hasher: &'a dyn Hasher,
    pub downloader: &'a dyn Downloader,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stage the boot medium but don't run the reboot script.
    pub skip_reboot: bool,
}

pub struct PipelineController<'a> {
    tools: Collaborators<'a>,
    /// Validated again at the start of every run
    config: &'a Config,
    /// Derived from `config.paths.work_dir`
    dirs: RunDirectories,
    options: RunOptions,
}

impl<'a> PipelineController<'a> {
    pub fn new(tools: Collaborators<'a>, config: &'a Config, options: RunOptions) -> Self {
        PipelineController {
            tools,
            config,
            dirs: RunDirectories::new(&config.paths.work_dir),
            options,
        }
    }

    pub fn run(&self, selection: &Selection) -> Result<CanonicalImage> {
        self.config.validate_for(selection.mode)?;
        tracing::info!("Reimaging with {} (index {})", selection.mode, selection.image_index);
        self.record(selection, Stage::Started);

        self.recover_stale_mount();
        let pe_target = self.config.pe.fetch_target(&self.dirs.work);
        self.dirs.purge(std::slice::from_ref(&pe_target.local_name))?;
        self.dirs.create()?;
        self.record(selection, Stage::Prepared);

        let fetch = FetchWithVerify::new(
            self.tools.downloader,
            ContentVerifier::new(self.tools.hasher),
            self.config.fetch.retry_policy(),
        );

        tracing::info!("=== PE base image ===");
        fetch.ensure(&pe_target)?;
        self.record(selection, Stage::PeFetched);

        if selection.mode.is_preset() {
            tracing::info!("=== {} source image ===", selection.mode);
            let preset = self.config.preset(selection.mode)?;
            fetch.ensure(&preset.fetch_target(&self.dirs.work))?;
            self.record(selection, Stage::SourceFetched);
        }

        tracing::info!("=== Install image ===");
        let image = ImageResolver::new(
            self.tools.archiver,
            self.tools.images,
            self.config,
            &self.dirs,
        )
        .resolve(selection)?;
        self.check_index(&image)?;
        self.record(selection, Stage::ImageResolved);

        tracing::info!("=== Drivers ===");
        DriverStage::new(self.tools.images, &self.dirs).run(selection, &image)?;
        self.record(selection, Stage::DriversInjected);

        tracing::info!("=== Boot medium ===");
        let staging = Staging::new(
            self.tools.runner,
            self.tools.archiver,
            self.config,
            &self.dirs,
        );
        staging.stage(&image)?;
        self.record(selection, Stage::MediumStaged);

        if self.options.skip_reboot {
            tracing::info!("--skip-reboot given; boot medium is ready, not rebooting");
        } else {
            staging.handoff()?;
            self.record(selection, Stage::HandedOff);
        }
        Ok(image)
    }

    /// A crash between mount and unmount leaves the image mounted, which
    /// blocks both the purge and any new mount. Best effort: the purge
    /// that follows reports anything this couldn't fix.
    fn recover_stale_mount(&self) {
        if !dism::is_wim_mounted(&self.dirs.mount) {
            return;
        }
        tracing::warn!(
            "Found an image still mounted at {}, discarding it",
            self.dirs.mount.display()
        );
        if let Err(e) = self.tools.images.unmount(&self.dirs.mount, false) {
            tracing::warn!("Discard failed: {}", e);
        }
        if let Err(e) = self.tools.images.cleanup_mounts() {
            tracing::warn!("Mount cleanup failed: {}", e);
        }
    }

    /// Make sure the index we're about to mount and install exists.
    fn check_index(&self, image: &CanonicalImage) -> Result<()> {
        let editions = self.tools.images.image_info(&image.path)?;
        if editions.is_empty() {
            // Localized DISM output doesn't parse; nothing to check against
            tracing::warn!("Could not read the edition list of {}", image.path.display());
            return Ok(());
        }
        match editions.iter().find(|e| e.index == image.index) {
            Some(edition) => {
                tracing::info!(
                    "Installing index {}: {} ({} MB)",
                    edition.index,
                    edition.name,
                    edition.size_bytes / (1024 * 1024)
                );
                Ok(())
            }
            None => Err(ReimageError::Validation(format!(
                "{} has no image at index {} (available: {})",
                image.path.display(),
                image.index,
                editions
                    .iter()
                    .map(|e| e.index.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    fn record(&self, selection: &Selection, stage: Stage) {
        let state = RunState {
            selection: selection.clone(),
            last_completed: stage,
            updated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let path = self.dirs.work.join(RUN_STATE_FILE);
        let written = serde_json::to_string_pretty(&state)
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(&path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            tracing::warn!("Could not update {}: {}", path.display(), e);
        }
    }
}
