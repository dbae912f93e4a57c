// ============================================
// Reimager - selection.rs
// ============================================
// The one input the pipeline consumes: which image, which edition index,
// and whether to carry the current drivers over.
//
// A Selection is built once (from the command line) and passed by value.
// Nothing downstream reads global state to find out what the user picked.
// ============================================

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{ReimageError, Result};

/// Edition index every preset image is installed from.
pub const PRESET_IMAGE_INDEX: u32 = 4;

/// Index used for custom images when the user doesn't pass --set.
pub const DEFAULT_CUSTOM_INDEX: u32 = 1;

/// Which image to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Windows 10 22H2 (stock image, downloaded and verified)
    #[value(alias = "preset-a")]
    Win10,
    /// Windows 11 24H2 (stock image, downloaded and verified)
    #[value(alias = "preset-b")]
    Win11,
    /// A user-supplied .iso, .wim or .esd
    Custom,
}

impl Mode {
    pub fn is_preset(self) -> bool {
        !matches!(self, Mode::Custom)
    }

    /// Key of this mode in the `[presets]` config table.
    pub fn preset_key(self) -> Option<&'static str> {
        match self {
            Mode::Win10 => Some("win10"),
            Mode::Win11 => Some("win11"),
            Mode::Custom => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Win10 => write!(f, "Windows 10"),
            Mode::Win11 => write!(f, "Windows 11"),
            Mode::Custom => write!(f, "custom image"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub mode: Mode,
    /// Only meaningful for `Mode::Custom`.
    pub image_path: Option<PathBuf>,
    pub image_index: u32,
    pub backup_drivers: bool,
}

impl Selection {
    /// Build a validated selection from raw user input.
    ///
    /// Presets always get `PRESET_IMAGE_INDEX`, whatever index was asked for.
    /// Custom mode needs a path to an existing file and an index >= 1
    /// (defaulting to `DEFAULT_CUSTOM_INDEX`).
    pub fn new(
        mode: Mode,
        image_path: Option<PathBuf>,
        image_index: Option<u32>,
        backup_drivers: bool,
    ) -> Result<Self> {
        match mode {
            Mode::Custom => {
                let path = image_path
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| {
                        ReimageError::Validation("--path is required for custom mode".to_string())
                    })?;
                // Tools run with the work dir as their current directory
                let path = absolute_path(path)?;
                if !path.is_file() {
                    return Err(ReimageError::Validation(format!(
                        "image file not found: {}",
                        path.display()
                    )));
                }
                let index = image_index.unwrap_or(DEFAULT_CUSTOM_INDEX);
                if index < 1 {
                    return Err(ReimageError::Validation(
                        "--set value must be >= 1".to_string(),
                    ));
                }
                Ok(Selection {
                    mode,
                    image_path: Some(path),
                    image_index: index,
                    backup_drivers,
                })
            }
            _ => {
                if let Some(requested) = image_index.filter(|&i| i != PRESET_IMAGE_INDEX) {
                    tracing::info!(
                        "{} always installs index {}; ignoring --set {}",
                        mode,
                        PRESET_IMAGE_INDEX,
                        requested
                    );
                }
                Ok(Selection {
                    mode,
                    image_path: None,
                    image_index: PRESET_IMAGE_INDEX,
                    backup_drivers,
                })
            }
        }
    }

    /// The user-supplied image. `None` for presets.
    pub fn custom_path(&self) -> Option<&Path> {
        match self.mode {
            Mode::Custom => self.image_path.as_deref(),
            _ => None,
        }
    }
}

fn absolute_path(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| ReimageError::io("determine the current directory", e))?;
    Ok(cwd.join(path))
}
