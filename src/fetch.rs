// ============================================
// Reimager - fetch.rs
// ============================================
// Make sure a file is on disk AND matches its published fingerprint.
//
// The loop:
// 1. File missing? Download it. A failed download just means the file is
//    still missing; we go round again.
// 2. Fingerprint it.
// 3. Match? Done.
// 4. No match? Delete it (forces a fresh download) and go round again.
//
// By default there is no attempt limit: the stage never proceeds with an
// unverified file, it only keeps trying. `[fetch] max_attempts` caps it.
// ============================================

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::error::{IoContext, ReimageError, Result};
use crate::tools::Downloader;
use crate::verify::ContentVerifier;

/// One file to acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub local_name: PathBuf,
    pub source_url: String,
    pub expected_fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// `None` = unbounded.
    pub max_attempts: Option<u32>,
    /// Pause between a failed attempt and the next one.
    pub backoff: Duration,
}

impl RetryPolicy {
    #[cfg(test)]
    pub fn unbounded() -> Self {
        RetryPolicy::default()
    }
}

pub struct FetchWithVerify<'a> {
    downloader: &'a dyn Downloader,
    verifier: ContentVerifier<'a>,
    policy: RetryPolicy,
}

impl<'a> FetchWithVerify<'a> {
    pub fn new(
        downloader: &'a dyn Downloader,
        verifier: ContentVerifier<'a>,
        policy: RetryPolicy,
    ) -> Self {
        FetchWithVerify {
            downloader,
            verifier,
            policy,
        }
    }

    pub fn ensure(&self, target: &FetchTarget) -> Result<()> {
        let local = &target.local_name;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if local.exists() {
                tracing::info!("{} already present", local.display());
            } else {
                if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .io_context(|| format!("create {}", parent.display()))?;
                }
                tracing::info!(
                    "Downloading {} (attempt {})...",
                    local.display(),
                    attempt
                );
                if let Err(e) = self.downloader.download(&target.source_url, local) {
                    tracing::warn!("Download failed: {}", e);
                }
                if !local.exists() {
                    self.before_retry(target, attempt)?;
                    continue;
                }
            }

            tracing::info!("Verifying {}...", local.display());
            let verified = match self.verifier.matches(local, &target.expected_fingerprint) {
                Ok(verified) => verified,
                // A hash tool that chokes on the file (e.g. a truncated download)
                // is an integrity failure like any other. Unreadable files aren't.
                Err(e @ ReimageError::ExternalTool { .. }) => {
                    tracing::warn!("Could not fingerprint {}: {}", local.display(), e);
                    false
                }
                Err(e) => return Err(e),
            };
            if verified {
                return Ok(());
            }

            tracing::warn!("Deleting {} and downloading again", local.display());
            fs::remove_file(local).io_context(|| format!("delete {}", local.display()))?;
            self.before_retry(target, attempt)?;
        }
    }

    fn before_retry(&self, target: &FetchTarget, attempt: u32) -> Result<()> {
        if let Some(max) = self.policy.max_attempts {
            if attempt >= max {
                return Err(ReimageError::FetchExhausted {
                    name: target.local_name.display().to_string(),
                    attempts: attempt,
                });
            }
        }
        if !self.policy.backoff.is_zero() {
            thread::sleep(self.policy.backoff);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeDownloader, FakeHasher, Journal};
    use tempfile::TempDir;

    const GOOD: &str = "f494b6b9335f86fa72fd541fc75aef43";
    const BAD: &str = "00000000000000000000000000000000";

    fn target(dir: &TempDir) -> FetchTarget {
        FetchTarget {
            local_name: dir.path().join("WIN10.iso"),
            source_url: "https://example.invalid/WIN10.iso".to_string(),
            expected_fingerprint: GOOD.to_uppercase(),
        }
    }

    #[test]
    fn test_present_and_valid_skips_download() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        fs::write(&target.local_name, GOOD).unwrap();

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[]);
        let hasher = FakeHasher::new(&journal);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );

        fetch.ensure(&target).unwrap();
        fetch.ensure(&target).unwrap();
        assert_eq!(journal.count("download"), 0);
        assert_eq!(journal.entries(), vec!["hash WIN10.iso", "hash WIN10.iso"]);
    }

    #[test]
    fn test_mismatch_deletes_and_downloads_once_more() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[Some(BAD), Some(GOOD)]);
        let hasher = FakeHasher::new(&journal);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );

        fetch.ensure(&target).unwrap();
        assert_eq!(
            journal.entries(),
            vec![
                "download WIN10.iso",
                "hash WIN10.iso",
                "download WIN10.iso",
                "hash WIN10.iso",
            ]
        );
        assert_eq!(fs::read_to_string(&target.local_name).unwrap(), GOOD);
    }

    #[test]
    fn test_stale_local_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        fs::write(&target.local_name, "partial download").unwrap();

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[Some(GOOD)]);
        let hasher = FakeHasher::new(&journal);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );

        fetch.ensure(&target).unwrap();
        assert_eq!(journal.count("download"), 1);
        assert_eq!(journal.count("hash"), 2);
    }

    #[test]
    fn test_failed_download_counts_as_absent() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[None, None, Some(GOOD)]);
        let hasher = FakeHasher::new(&journal);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );

        fetch.ensure(&target).unwrap();
        // Nothing to hash until a download actually produced a file
        assert_eq!(journal.count("download"), 3);
        assert_eq!(journal.count("hash"), 1);
    }

    #[test]
    fn test_creates_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let target = FetchTarget {
            local_name: dir.path().join("pe").join("boot.wim"),
            source_url: "https://example.invalid/boot.wim".to_string(),
            expected_fingerprint: GOOD.to_string(),
        };

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[Some(GOOD)]);
        let hasher = FakeHasher::new(&journal);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );
        fetch.ensure(&target).unwrap();
        assert!(target.local_name.is_file());
    }

    #[test]
    fn test_hash_tool_failure_counts_as_mismatch() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[Some("partial"), Some(GOOD)]);
        let hasher = FakeHasher::new(&journal);
        hasher.fail_next(1);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );

        fetch.ensure(&target).unwrap();
        assert_eq!(journal.count("download"), 2);
        assert_eq!(journal.count("hash"), 2);
        assert_eq!(fs::read_to_string(&target.local_name).unwrap(), GOOD);
    }

    #[test]
    fn test_unreadable_file_is_still_fatal() {
        let dir = TempDir::new().unwrap();
        let target = FetchTarget {
            // A directory: exists, but can't be read as a file
            local_name: dir.path().to_path_buf(),
            source_url: "https://example.invalid/x".to_string(),
            expected_fingerprint: GOOD.to_string(),
        };

        let journal = Journal::default();
        let downloader = FakeDownloader::new(&journal, &[]);
        let hasher = FakeHasher::new(&journal);
        let fetch = FetchWithVerify::new(
            &downloader,
            ContentVerifier::new(&hasher),
            RetryPolicy::unbounded(),
        );
        assert!(matches!(fetch.ensure(&target), Err(ReimageError::Io { .. })));
        assert_eq!(journal.count("download"), 0);
    }

    #[test]
    fn test_attempt_limit_gives_up_without_keeping_bad_file() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let journal = Journal::default();
        let downloader = FakeDownloader::always(&journal, BAD, 10);
        let hasher = FakeHasher::new(&journal);
        let policy = RetryPolicy {
            max_attempts: Some(3),
            backoff: Duration::ZERO,
        };
        let fetch = FetchWithVerify::new(&downloader, ContentVerifier::new(&hasher), policy);

        match fetch.ensure(&target) {
            Err(ReimageError::FetchExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected FetchExhausted, got {:?}", other),
        }
        assert_eq!(journal.count("download"), 3);
        assert!(!target.local_name.exists());
    }
}
