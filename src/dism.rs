// ============================================
// Reimager - dism.rs
// ============================================
// Everything the pipeline asks DISM to do, behind the ImageService trait:
//
// - export the running system's drivers
// - mount / unmount (commit or discard) an install.wim
// - add a folder of drivers to a mounted image
// - export one index of an ESD into a fresh WIM
// - list the editions inside a WIM
// - clean up orphaned mounts
//
// WimMountGuard makes sure a mounted image is always unmounted again,
// even when a step between mount and unmount fails.
// ============================================

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::process::{CommandLine, CommandRunner};

// ============================================
// IMAGE SERVICE
// ============================================

pub trait ImageService {
    /// Export every third-party driver of the running OS into `dest`.
    fn export_drivers(&self, dest: &Path) -> Result<()>;

    fn mount(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<()>;

    /// Add every driver found under `drivers` (recursively) to the image
    /// mounted at `mount_dir`.
    fn add_drivers(&self, mount_dir: &Path, drivers: &Path) -> Result<()>;

    /// `commit = false` throws the changes away.
    fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<()>;

    /// Clear mount points orphaned by a crash.
    fn cleanup_mounts(&self) -> Result<()>;

    /// Export `index` of `source` into a new max-compressed image at `dest`.
    fn export_image(&self, source: &Path, index: u32, dest: &Path) -> Result<()>;

    fn image_info(&self, image: &Path) -> Result<Vec<WimEdition>>;
}

pub struct Dism<'a> {
    pub exe: PathBuf,
    pub runner: &'a dyn CommandRunner,
}

impl Dism<'_> {
    fn cmd(&self) -> CommandLine {
        CommandLine::new(&self.exe)
    }
}

impl ImageService for Dism<'_> {
    fn export_drivers(&self, dest: &Path) -> Result<()> {
        // dism /online /export-driver /destination:drivers
        let cmd = self
            .cmd()
            .arg("/Online")
            .arg("/Export-Driver")
            .arg(format!("/Destination:{}", dest.display()));
        self.runner.run(&cmd)
    }

    fn mount(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<()> {
        // dism /Mount-Wim /WimFile:path /Index:N /MountDir:path
        let cmd = self
            .cmd()
            .arg("/Mount-Wim")
            .arg(format!("/WimFile:{}", image.display()))
            .arg(format!("/Index:{}", index))
            .arg(format!("/MountDir:{}", mount_dir.display()));
        self.runner.run(&cmd)
    }

    fn add_drivers(&self, mount_dir: &Path, drivers: &Path) -> Result<()> {
        let cmd = self
            .cmd()
            .arg(format!("/Image:{}", mount_dir.display()))
            .arg("/Add-Driver")
            .arg(format!("/Driver:{}", drivers.display()))
            .arg("/Recurse");
        self.runner.run(&cmd)
    }

    fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<()> {
        let cmd = self
            .cmd()
            .arg("/Unmount-Wim")
            .arg(format!("/MountDir:{}", mount_dir.display()))
            .arg(if commit { "/Commit" } else { "/Discard" });
        self.runner.run(&cmd)
    }

    fn cleanup_mounts(&self) -> Result<()> {
        self.runner.run(&self.cmd().arg("/Cleanup-Wim"))
    }

    fn export_image(&self, source: &Path, index: u32, dest: &Path) -> Result<()> {
        let cmd = self
            .cmd()
            .arg("/Export-Image")
            .arg(format!("/SourceImageFile:{}", source.display()))
            .arg(format!("/SourceIndex:{}", index))
            .arg(format!("/DestinationImageFile:{}", dest.display()))
            .arg("/Compress:max");
        self.runner.run(&cmd)
    }

    fn image_info(&self, image: &Path) -> Result<Vec<WimEdition>> {
        let cmd = self
            .cmd()
            .arg("/Get-WimInfo")
            .arg(format!("/WimFile:{}", image.display()));
        let stdout = self.runner.output(&cmd)?;
        Ok(parse_wim_editions(&stdout))
    }
}

/// A mount leaves the image's Windows folder visible under the mount dir.
pub fn is_wim_mounted(mount_dir: &Path) -> bool {
    mount_dir.join("Windows").exists()
}

// ============================================
// EDITIONS
// ============================================

/// One image inside a WIM, as listed by /Get-WimInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WimEdition {
    /// 1-based
    pub index: u32,
    pub name: String,
    pub size_bytes: u64,
}

/// Parse `dism /Get-WimInfo` output. Each image is a block like:
///
/// ```text
/// Index : 4
/// Name : Windows 10 Pro
/// Description : Windows 10 Pro
/// Size : 15,292,090,478 bytes
/// ```
///
/// Localized DISM output keeps the "Index"/"Name"/"Size" keys in English
/// only on en-US systems; any block without a parseable Index is skipped.
pub fn parse_wim_editions(stdout: &str) -> Vec<WimEdition> {
    let mut editions = Vec::new();
    let mut current: Option<WimEdition> = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Index" => {
                editions.extend(current.take());
                current = value.parse::<u32>().ok().map(|index| WimEdition {
                    index,
                    name: String::new(),
                    size_bytes: 0,
                });
            }
            "Name" => {
                if let Some(edition) = current.as_mut() {
                    edition.name = value.to_string();
                }
            }
            "Size" => {
                if let Some(edition) = current.as_mut() {
                    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
                    edition.size_bytes = digits.parse().unwrap_or(0);
                }
            }
            _ => {}
        }
    }
    editions.extend(current);
    editions
}

// ============================================
// WIM MOUNT GUARD
// ============================================
// Holding a WimMountGuard means an image is mounted at its mount dir.
//
//   let guard = WimMountGuard::mount(dism, image, index, mount_dir)?;
//   ... modify the image ...
//   guard.commit_and_disarm()?;   // /Commit, guard is done
//
// If the guard is dropped without commit (early return on error), Drop
// unmounts with /Discard. A failed mount never produces a guard, so
// nothing is unmounted for it.

pub struct WimMountGuard<'a> {
    service: &'a dyn ImageService,
    mount_dir: PathBuf,
    disarmed: bool,
}

impl<'a> WimMountGuard<'a> {
    pub fn mount(
        service: &'a dyn ImageService,
        image: &Path,
        index: u32,
        mount_dir: &Path,
    ) -> Result<Self> {
        service.mount(image, index, mount_dir)?;
        tracing::info!("Mounted {} (index {}) at {}", image.display(), index, mount_dir.display());
        Ok(WimMountGuard {
            service,
            mount_dir: mount_dir.to_path_buf(),
            disarmed: false,
        })
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    /// Unmount with /Commit. If the commit itself fails the guard stays
    /// armed and Drop still attempts a /Discard.
    pub fn commit_and_disarm(mut self) -> Result<()> {
        self.service.unmount(&self.mount_dir, true)?;
        self.disarmed = true;
        tracing::info!("Committed and unmounted {}", self.mount_dir.display());
        Ok(())
    }
}

impl Drop for WimMountGuard<'_> {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        tracing::warn!(
            "Error path: unmounting {} with /Discard (changes lost)",
            self.mount_dir.display()
        );
        if let Err(e) = self.service.unmount(&self.mount_dir, false) {
            tracing::error!("Discard failed, run 'dism /Cleanup-Wim' before retrying: {}", e);
        }
    }
}
