// ============================================
// Reimager - image.rs
// ============================================
// Turn whatever the user picked into exactly one file:
// <work>/sources/install.wim (the canonical image).
//
//   preset         -> 7-Zip pulls sources/install.wim out of the preset ISO
//   custom .iso    -> same, from the user's ISO
//   custom .wim    -> plain copy
//   custom .esd    -> DISM exports the chosen index, max compression
//
// Whatever branch ran, the canonical file must exist afterwards.
// ============================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::dism::ImageService;
use crate::error::{IoContext, ReimageError, Result};
use crate::pipeline::RunDirectories;
use crate::selection::Selection;
use crate::tools::Archiver;

/// Path of the install image inside a Windows ISO.
pub const ISO_INSTALL_MEMBER: &str = "sources/install.wim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Iso,
    Wim,
    Esd,
}

impl ImageFormat {
    /// Decide the format from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "iso" => Ok(ImageFormat::Iso),
            "wim" => Ok(ImageFormat::Wim),
            "esd" => Ok(ImageFormat::Esd),
            _ => Err(ReimageError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Iso => write!(f, "ISO"),
            ImageFormat::Wim => write!(f, "WIM"),
            ImageFormat::Esd => write!(f, "ESD"),
        }
    }
}

/// The install image every later stage works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    pub path: PathBuf,
    /// Index to mount and to install. Differs from the selection's index
    /// only for ESD sources: the export holds a single image at index 1.
    pub index: u32,
}

pub struct ImageResolver<'a> {
    archiver: &'a dyn Archiver,
    images: &'a dyn ImageService,
    config: &'a Config,
    dirs: &'a RunDirectories,
}

impl<'a> ImageResolver<'a> {
    pub fn new(
        archiver: &'a dyn Archiver,
        images: &'a dyn ImageService,
        config: &'a Config,
        dirs: &'a RunDirectories,
    ) -> Self {
        ImageResolver {
            archiver,
            images,
            config,
            dirs,
        }
    }

    pub fn resolve(&self, selection: &Selection) -> Result<CanonicalImage> {
        let canonical = self.dirs.canonical_image();
        let mut index = selection.image_index;

        match selection.custom_path() {
            None => {
                let iso = self
                    .dirs
                    .work
                    .join(&self.config.preset(selection.mode)?.local_name);
                if !iso.is_file() {
                    return Err(ReimageError::MissingSource(iso));
                }
                tracing::info!("Extracting install.wim from {}...", iso.display());
                self.extract_from_iso(&iso)?;
            }
            Some(path) => match ImageFormat::from_path(path)? {
                format if !path.is_file() => {
                    return Err(ReimageError::Validation(format!(
                        "{} image not found: {}",
                        format,
                        path.display()
                    )));
                }
                ImageFormat::Iso => {
                    tracing::info!("Extracting install.wim from {}...", path.display());
                    self.extract_from_iso(path)?;
                }
                ImageFormat::Wim => {
                    tracing::info!("Copying {} to {}", path.display(), canonical.display());
                    fs::copy(path, &canonical).io_context(|| {
                        format!("copy {} to {}", path.display(), canonical.display())
                    })?;
                }
                ImageFormat::Esd => {
                    tracing::info!(
                        "Exporting index {} of {} to {}...",
                        selection.image_index,
                        path.display(),
                        canonical.display()
                    );
                    self.images
                        .export_image(path, selection.image_index, &canonical)?;
                    index = 1;
                }
            },
        }

        if !canonical.is_file() {
            return Err(ReimageError::ConversionFailed(canonical));
        }
        tracing::info!("Canonical image ready: {} (index {})", canonical.display(), index);
        Ok(CanonicalImage {
            path: canonical,
            index,
        })
    }

    fn extract_from_iso(&self, iso: &Path) -> Result<()> {
        self.archiver
            .extract_file(iso, ISO_INSTALL_MEMBER, &self.dirs.work)
    }
}
