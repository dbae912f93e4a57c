// ============================================
// Reimager - tools.rs
// ============================================
// Narrow interfaces over the external helpers the pipeline drives:
//
//   Archiver   - 7-Zip: pull files out of an ISO / WIM
//   Hasher     - certutil: fingerprint a local file
//   Downloader - curl.exe, or the in-process reqwest client
//
// The pipeline only ever talks to the traits, so tests can hand it
// fakes and never touch a real binary. DISM lives in dism.rs.
// ============================================

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::DigestAlgorithm;
use crate::error::{IoContext, ReimageError, Result};
use crate::process::{CommandLine, CommandRunner};

// ============================================
// ARCHIVER (7-ZIP)
// ============================================

pub trait Archiver {
    /// Extract one member of `archive` (e.g. "sources/install.wim") into
    /// `dest_dir`, keeping its relative path.
    fn extract_file(&self, archive: &Path, member: &str, dest_dir: &Path) -> Result<()>;

    /// Extract the whole archive into `dest_dir`.
    fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

pub struct SevenZip<'a> {
    pub exe: PathBuf,
    pub runner: &'a dyn CommandRunner,
}

impl Archiver for SevenZip<'_> {
    fn extract_file(&self, archive: &Path, member: &str, dest_dir: &Path) -> Result<()> {
        // 7z x <archive> <member> -o<dir> -y
        let cmd = CommandLine::new(&self.exe)
            .arg("x")
            .arg(archive)
            .arg(member)
            .arg(format!("-o{}", dest_dir.display()))
            .arg("-y");
        self.runner.run(&cmd)
    }

    fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let cmd = CommandLine::new(&self.exe)
            .arg("x")
            .arg(archive)
            .arg(format!("-o{}", dest_dir.display()))
            .arg("-y");
        self.runner.run(&cmd)
    }
}

// ============================================
// HASHER (CERTUTIL)
// ============================================

pub trait Hasher {
    /// Hex digest of the file's content, as the tool printed it.
    fn hash_file(&self, path: &Path) -> Result<String>;
}

pub struct Certutil<'a> {
    pub exe: PathBuf,
    pub algorithm: DigestAlgorithm,
    pub runner: &'a dyn CommandRunner,
}

impl Hasher for Certutil<'_> {
    fn hash_file(&self, path: &Path) -> Result<String> {
        let cmd = CommandLine::new(&self.exe)
            .arg("-hashfile")
            .arg(path)
            .arg(self.algorithm.certutil_name());
        let stdout = self.runner.output(&cmd)?;
        parse_certutil_digest(&stdout).ok_or_else(|| ReimageError::ExternalTool {
            command: format!("{} (unparsable output)", cmd),
            status: Some(0),
        })
    }
}

/// certutil prints:
///
/// ```text
/// MD5 hash of WIN10.iso:
/// f494b6b9335f86fa72fd541fc75aef43
/// CertUtil: -hashfile command completed successfully.
/// ```
///
/// The digest is always the second line. Older builds space-separate the
/// hex pairs, so inner whitespace is dropped too.
pub fn parse_certutil_digest(stdout: &str) -> Option<String> {
    let line = stdout.lines().nth(1)?;
    let digest: String = line.split_whitespace().collect();
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(digest)
}

// ============================================
// DOWNLOADER
// ============================================

pub trait Downloader {
    /// Fetch `url` into `dest`. An error means "the file may or may not be
    /// there"; callers re-check the file rather than trusting this.
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// curl.exe - built into Windows 10 1803+.
pub struct Curl<'a> {
    pub exe: PathBuf,
    pub runner: &'a dyn CommandRunner,
}

impl Downloader for Curl<'_> {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        // -L follow redirects, -f fail on HTTP errors instead of saving the error page
        let cmd = CommandLine::new(&self.exe)
            .args(["-L", "-f", "-o"])
            .arg(dest)
            .arg(url);
        self.runner.run(&cmd)
    }
}

/// In-process download with reqwest.
///
/// Streams into a uniquely named `.part` file next to `dest` and renames it
/// only once the body has been fully written, so an interrupted transfer
/// never leaves a half-written file under the final name.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("Reimager/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            // Images are several GB; only the connect phase gets a deadline
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|e| ReimageError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(HttpDownloader { client })
    }

    fn part_path(dest: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        dest.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4()))
    }

    fn stream_to(&self, url: &str, part: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().map_err(|e| {
            tracing::warn!("request to {} failed: {}", url, e);
            http_error(url, None)
        })?;

        if !response.status().is_success() {
            return Err(http_error(url, Some(response.status().as_u16() as i32)));
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = File::create(part).io_context(|| format!("create {}", part.display()))?;
        let mut buffer = vec![0u8; 64 * 1024];
        let mut downloaded: u64 = 0;
        let mut last_logged = 0;

        loop {
            let n = response.read(&mut buffer).map_err(|e| {
                tracing::warn!("read from {} failed after {} bytes: {}", url, downloaded, e);
                http_error(url, None)
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .io_context(|| format!("write {}", part.display()))?;
            downloaded += n as u64;

            if total > 0 {
                let percent = downloaded * 100 / total;
                if percent >= last_logged + 10 {
                    last_logged = percent;
                    tracing::info!("  {}% ({} / {} bytes)", percent, downloaded, total);
                }
            }
        }

        file.flush().io_context(|| format!("flush {}", part.display()))?;
        Ok(downloaded)
    }
}

fn http_error(url: &str, status: Option<i32>) -> ReimageError {
    ReimageError::ExternalTool {
        command: format!("GET {}", url),
        status,
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!("exec: GET {} -> {}", url, dest.display());
        let part = Self::part_path(dest);

        match self.stream_to(url, &part) {
            Ok(bytes) => {
                fs::rename(&part, dest).io_context(|| {
                    format!("rename {} to {}", part.display(), dest.display())
                })?;
                tracing::info!("Download complete ({} bytes)", bytes);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                Err(e)
            }
        }
    }
}
