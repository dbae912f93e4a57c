// ============================================
// Reimager - config.rs
// ============================================
// Run configuration, loaded from a TOML file:
//
//   reimager.toml
//   ├── [paths]      work dir + boot medium root
//   ├── [tools]      external tool locations and the staging scripts
//   ├── [fetch]      retry policy, digest algorithm, download client
//   ├── [pe]         PE base image (local name, URL, fingerprint)
//   └── [presets.*]  one entry per stock image
//
// Every field has a default, so a missing file (or a partial one) still
// yields a complete Config. URLs and fingerprints for the PE image have
// no sensible default and must come from the file.
// ============================================

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReimageError, Result};
use crate::fetch::{FetchTarget, RetryPolicy};
use crate::selection::Mode;

/// Looked up in the current directory when --config isn't given.
pub const DEFAULT_CONFIG_FILE: &str = "reimager.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub tools: ToolsConfig,
    pub fetch: FetchConfig,
    pub pe: RemoteImage,
    pub presets: Presets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for sources/, drivers/, pe/ and mount/.
    pub work_dir: PathBuf,
    /// Root of the partition the PE boots from.
    pub boot_medium: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            work_dir: PathBuf::from("."),
            boot_medium: PathBuf::from("B:\\"),
        }
    }
}

/// A file copied onto the boot medium during staging.
/// `dest` is a directory relative to the medium root ("" = root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumFile {
    pub source: PathBuf,
    #[serde(default)]
    pub dest: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub seven_zip: PathBuf,
    pub dism: PathBuf,
    pub certutil: PathBuf,
    pub curl: PathBuf,
    /// Run in order before anything is copied to the boot medium
    /// (they create and letter the PE partition).
    pub prepare_scripts: Vec<PathBuf>,
    /// Sets the PE as the next boot target and restarts.
    pub reboot_script: PathBuf,
    pub medium_files: Vec<MediumFile>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            seven_zip: PathBuf::from("tools\\7z.exe"),
            dism: PathBuf::from("dism"),
            certutil: PathBuf::from("certutil"),
            curl: PathBuf::from("curl"),
            prepare_scripts: vec![
                PathBuf::from("tools\\Rename.cmd"),
                PathBuf::from("tools\\CreatPE.cmd"),
            ],
            reboot_script: PathBuf::from("tools\\boot.cmd"),
            medium_files: vec![
                MediumFile {
                    source: PathBuf::from("tools\\script.cmd"),
                    dest: PathBuf::new(),
                },
                MediumFile {
                    source: PathBuf::from("tools\\DelPE.cmd"),
                    dest: PathBuf::from("Windows\\System32"),
                },
            ],
        }
    }
}

/// Digest algorithm handed to the checksum tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// What the published reference hashes use.
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Name certutil expects on its command line.
    pub fn certutil_name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA256",
        }
    }

    /// Length of the digest in hex characters.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 32,
            DigestAlgorithm::Sha256 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    /// curl.exe (ships with Windows 10 1803+)
    #[default]
    Curl,
    /// In-process reqwest client
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// 0 means keep trying forever.
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub digest: DigestAlgorithm,
    pub downloader: DownloaderKind,
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
            backoff: Duration::from_secs(self.backoff_secs),
        }
    }
}

/// An image that is downloaded and checked against a known fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteImage {
    /// Relative to the work dir.
    pub local_name: PathBuf,
    pub url: String,
    pub fingerprint: String,
}

impl RemoteImage {
    pub fn fetch_target(&self, work_dir: &Path) -> FetchTarget {
        FetchTarget {
            local_name: work_dir.join(&self.local_name),
            source_url: self.url.clone(),
            expected_fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Stock images keyed by mode name ("win10", "win11"). Their edition
/// index is fixed by the mode, not configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Presets(pub BTreeMap<String, RemoteImage>);

impl Default for Presets {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert(
            "win10".to_string(),
            RemoteImage {
                local_name: PathBuf::from("WIN10.iso"),
                url: "https://software.download.prss.microsoft.com/dbazure/Win10_22H2_Chinese_Simplified_x64v1.iso".to_string(),
                fingerprint: "f494b6b9335f86fa72fd541fc75aef43".to_string(),
            },
        );
        map.insert(
            "win11".to_string(),
            RemoteImage {
                local_name: PathBuf::from("WIN11.iso"),
                url: "https://software.download.prss.microsoft.com/dbazure/Win11_24H2_Chinese_Simplified_x64.iso".to_string(),
                fingerprint: "a0ef4099b38e445bb7ee62c28f6a86aa".to_string(),
            },
        );
        Presets(map)
    }
}

impl Config {
    /// Load `path`, or fall back to built-in defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using built-in defaults", path.display());
            return Ok(Config::with_pe_default(Config::default()));
        }

        let content = fs::read_to_string(path).map_err(|e| {
            ReimageError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| ReimageError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str::<Config>(content).map(Config::with_pe_default)
    }

    fn with_pe_default(mut config: Config) -> Config {
        if config.pe.local_name.as_os_str().is_empty() {
            config.pe.local_name = PathBuf::from("pe\\boot.wim");
        }
        config
    }

    pub fn preset(&self, mode: Mode) -> Result<&RemoteImage> {
        let key = mode
            .preset_key()
            .ok_or_else(|| ReimageError::Config(format!("{} has no preset entry", mode)))?;
        self.presets
            .0
            .get(key)
            .ok_or_else(|| ReimageError::Config(format!("[presets.{}] is not configured", key)))
    }

    /// Check everything a run in `mode` will need.
    ///
    /// An empty or malformed fingerprint would never match and the fetch
    /// loop would spin forever, so those are rejected here.
    pub fn validate_for(&self, mode: Mode) -> Result<()> {
        self.validate_remote("pe", &self.pe)?;
        if mode.is_preset() {
            let preset = self.preset(mode)?;
            let key = mode.preset_key().unwrap_or_default();
            self.validate_remote(&format!("presets.{}", key), preset)?;
        }
        Ok(())
    }

    fn validate_remote(&self, section: &str, image: &RemoteImage) -> Result<()> {
        if image.local_name.as_os_str().is_empty() {
            return Err(ReimageError::Config(format!("{}.local_name is empty", section)));
        }
        if image.url.trim().is_empty() {
            return Err(ReimageError::Config(format!("{}.url is not configured", section)));
        }
        let digest = self.fetch.digest;
        let fingerprint = image.fingerprint.trim();
        if fingerprint.len() != digest.hex_len()
            || !fingerprint.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ReimageError::Config(format!(
                "{}.fingerprint must be {} hex characters ({:?}), got {:?}",
                section,
                digest.hex_len(),
                digest,
                image.fingerprint
            )));
        }
        Ok(())
    }
}
