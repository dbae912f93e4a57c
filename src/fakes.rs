// ============================================
// Reimager - fakes.rs (test only)
// ============================================
// In-memory stand-ins for the external tools. Each fake appends a short
// entry to a shared Journal so tests can assert the exact order in which
// the pipeline drove its collaborators.
// ============================================

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use crate::dism::{ImageService, WimEdition};
use crate::error::{ReimageError, Result};
use crate::process::{CommandLine, CommandRunner};
use crate::tools::{Archiver, Downloader, Hasher};

fn tool_error(command: &str) -> ReimageError {
    ReimageError::ExternalTool {
        command: command.to_string(),
        status: Some(1),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.borrow().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }
}

// ============================================
// COMMAND RUNNER
// ============================================

#[derive(Default)]
pub struct FakeRunner {
    calls: RefCell<Vec<CommandLine>>,
    stdout: RefCell<String>,
    /// Any command whose display contains this fails.
    fail_matching: RefCell<Option<String>>,
}

impl FakeRunner {
    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.borrow().clone()
    }

    pub fn set_stdout(&self, stdout: &str) {
        *self.stdout.borrow_mut() = stdout.to_string();
    }

    pub fn fail_when(&self, needle: &str) {
        *self.fail_matching.borrow_mut() = Some(needle.to_string());
    }

    fn record(&self, cmd: &CommandLine) -> Result<()> {
        self.calls.borrow_mut().push(cmd.clone());
        let line = cmd.to_string();
        match self.fail_matching.borrow().as_deref() {
            Some(needle) if line.contains(needle) => Err(tool_error(&line)),
            _ => Ok(()),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &CommandLine) -> Result<()> {
        self.record(cmd)
    }

    fn output(&self, cmd: &CommandLine) -> Result<String> {
        self.record(cmd)?;
        Ok(self.stdout.borrow().clone())
    }
}

// ============================================
// ARCHIVER
// ============================================

pub struct FakeArchiver {
    journal: Journal,
    /// When false, extraction "succeeds" without writing anything.
    pub produce: bool,
    pub fail: bool,
}

impl FakeArchiver {
    pub fn new(journal: &Journal) -> Self {
        FakeArchiver {
            journal: journal.clone(),
            produce: true,
            fail: false,
        }
    }
}

impl Archiver for FakeArchiver {
    fn extract_file(&self, archive: &Path, member: &str, dest_dir: &Path) -> Result<()> {
        self.journal
            .push(format!("extract {} {}", file_name(archive), member));
        if self.fail {
            return Err(tool_error("7z x"));
        }
        if self.produce {
            let out = dest_dir.join(member);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&out, format!("extracted from {}", file_name(archive))).unwrap();
        }
        Ok(())
    }

    fn extract_all(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        self.journal.push(format!("extract-all {}", file_name(archive)));
        if self.fail {
            return Err(tool_error("7z x"));
        }
        fs::create_dir_all(dest_dir.join("sources")).unwrap();
        fs::write(dest_dir.join("bootmgr"), b"bootmgr").unwrap();
        Ok(())
    }
}

// ============================================
// IMAGE SERVICE
// ============================================

pub struct FakeImageService {
    journal: Journal,
    pub editions: Vec<WimEdition>,
    pub fail_export_drivers: bool,
    /// Exported driver folder comes back empty.
    pub no_drivers: bool,
    pub fail_mount: bool,
    pub fail_add_drivers: bool,
    pub fail_commit: bool,
}

impl FakeImageService {
    pub fn new(journal: &Journal) -> Self {
        FakeImageService {
            journal: journal.clone(),
            editions: (1..=6)
                .map(|index| WimEdition {
                    index,
                    name: format!("Edition {}", index),
                    size_bytes: 1 << 30,
                })
                .collect(),
            fail_export_drivers: false,
            no_drivers: false,
            fail_mount: false,
            fail_add_drivers: false,
            fail_commit: false,
        }
    }
}

impl ImageService for FakeImageService {
    fn export_drivers(&self, dest: &Path) -> Result<()> {
        self.journal.push("export-drivers");
        if self.fail_export_drivers {
            return Err(tool_error("dism /Export-Driver"));
        }
        if !self.no_drivers {
            let pkg = dest.join("oem3.inf_amd64_1234");
            fs::create_dir_all(&pkg).unwrap();
            fs::write(pkg.join("oem3.inf"), b"[Version]").unwrap();
            fs::write(pkg.join("oem3.sys"), b"sys").unwrap();
        }
        Ok(())
    }

    fn mount(&self, _image: &Path, index: u32, _mount_dir: &Path) -> Result<()> {
        self.journal.push(format!("mount {}", index));
        if self.fail_mount {
            return Err(tool_error("dism /Mount-Wim"));
        }
        Ok(())
    }

    fn add_drivers(&self, _mount_dir: &Path, _drivers: &Path) -> Result<()> {
        self.journal.push("add-drivers");
        if self.fail_add_drivers {
            return Err(tool_error("dism /Add-Driver"));
        }
        Ok(())
    }

    fn unmount(&self, _mount_dir: &Path, commit: bool) -> Result<()> {
        self.journal
            .push(if commit { "unmount commit" } else { "unmount discard" });
        if commit && self.fail_commit {
            return Err(tool_error("dism /Unmount-Wim /Commit"));
        }
        Ok(())
    }

    fn cleanup_mounts(&self) -> Result<()> {
        self.journal.push("cleanup-mounts");
        Ok(())
    }

    fn export_image(&self, source: &Path, index: u32, dest: &Path) -> Result<()> {
        self.journal
            .push(format!("export-image {} {}", file_name(source), index));
        fs::write(dest, format!("index {} of {}", index, file_name(source))).unwrap();
        Ok(())
    }

    fn image_info(&self, _image: &Path) -> Result<Vec<WimEdition>> {
        self.journal.push("image-info");
        Ok(self.editions.clone())
    }
}

// ============================================
// HASHER / DOWNLOADER
// ============================================

/// "Hashes" a file by returning its trimmed content, so a test controls
/// the fingerprint simply by choosing what the download writes.
pub struct FakeHasher {
    journal: Journal,
    /// The next N calls fail the way certutil does on unparsable output.
    failures: Cell<u32>,
}

impl FakeHasher {
    pub fn new(journal: &Journal) -> Self {
        FakeHasher {
            journal: journal.clone(),
            failures: Cell::new(0),
        }
    }

    pub fn fail_next(&self, times: u32) {
        self.failures.set(times);
    }
}

impl Hasher for FakeHasher {
    fn hash_file(&self, path: &Path) -> Result<String> {
        self.journal.push(format!("hash {}", file_name(path)));
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            return Err(tool_error("certutil (unparsable output)"));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ReimageError::io(format!("read {}", path.display()), e))?;
        Ok(content.trim().to_string())
    }
}

/// Each download takes the next scripted payload: `Some(body)` writes the
/// body to the destination, `None` fails without writing anything.
pub struct FakeDownloader {
    journal: Journal,
    payloads: RefCell<VecDeque<Option<String>>>,
}

impl FakeDownloader {
    pub fn new(journal: &Journal, payloads: &[Option<&str>]) -> Self {
        FakeDownloader {
            journal: journal.clone(),
            payloads: RefCell::new(
                payloads
                    .iter()
                    .map(|p| p.map(str::to_string))
                    .collect(),
            ),
        }
    }

    /// Every download of any file yields `body`.
    pub fn always(journal: &Journal, body: &str, times: usize) -> Self {
        let payloads: Vec<Option<&str>> = vec![Some(body); times];
        Self::new(journal, &payloads)
    }

    pub fn push(&self, payload: Option<&str>) {
        self.payloads
            .borrow_mut()
            .push_back(payload.map(str::to_string));
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.journal.push(format!("download {}", file_name(dest)));
        match self.payloads.borrow_mut().pop_front() {
            Some(Some(body)) => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(dest, body).unwrap();
                Ok(())
            }
            _ => Err(tool_error(&format!("curl {}", url))),
        }
    }
}
