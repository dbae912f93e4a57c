// ============================================
// Reimager - staging.rs
// ============================================
// Put everything the reboot-time installer needs onto the boot medium:
//
//   B:\                      <- PE base image unpacked here
//   B:\sources\install.wim   <- the canonical image
//   B:\set.data              <- install index, one line
//   B:\script.cmd ...        <- configured support files
//
// and finally hand off to the reboot script.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{IoContext, Result};
use crate::image::CanonicalImage;
use crate::pipeline::RunDirectories;
use crate::process::{CommandLine, CommandRunner};
use crate::tools::Archiver;

/// Name of the index record the post-reboot installer reads.
pub const INDEX_RECORD_FILE: &str = "set.data";

pub struct Staging<'a> {
    /// Runs the prepare and reboot scripts through `cmd /c`
    runner: &'a dyn CommandRunner,
    /// Unpacks the PE base image onto the medium
    archiver: &'a dyn Archiver,
    config: &'a Config,
    /// Scripts and support files resolve against `dirs.work`
    dirs: &'a RunDirectories,
}

impl<'a> Staging<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        archiver: &'a dyn Archiver,
        config: &'a Config,
        dirs: &'a RunDirectories,
    ) -> Self {
        Staging {
            runner,
            archiver,
            config,
            dirs,
        }
    }

    fn medium(&self) -> &Path {
        &self.config.paths.boot_medium
    }

    pub fn stage(&self, image: &CanonicalImage) -> Result<()> {
        // The prepare scripts create and letter the PE partition
        for script in &self.config.tools.prepare_scripts {
            self.run_script(script)?;
        }

        let medium = self.medium();
        let pe_image = self.dirs.work.join(&self.config.pe.local_name);
        tracing::info!("Unpacking {} onto {}...", pe_image.display(), medium.display());
        self.archiver.extract_all(&pe_image, medium)?;

        let sources = medium.join("sources");
        fs::create_dir_all(&sources).io_context(|| format!("create {}", sources.display()))?;
        let staged = sources.join("install.wim");
        tracing::info!("Copying {} to {}...", image.path.display(), staged.display());
        fs::copy(&image.path, &staged)
            .io_context(|| format!("copy {} to {}", image.path.display(), staged.display()))?;

        // For ESD sources this is 1, not the chosen index: the export holds one image
        write_index_record(&medium.join(INDEX_RECORD_FILE), image.index)?;

        for file in &self.config.tools.medium_files {
            let source = self.dirs.tool_path(&file.source);
            let dest_dir = medium.join(&file.dest);
            let Some(name) = source.file_name() else {
                continue;
            };
            fs::create_dir_all(&dest_dir)
                .io_context(|| format!("create {}", dest_dir.display()))?;
            let dest = dest_dir.join(name);
            fs::copy(&source, &dest)
                .io_context(|| format!("copy {} to {}", source.display(), dest.display()))?;
            tracing::info!("Copied {} to {}", source.display(), dest.display());
        }

        tracing::info!("Boot medium staged at {}", medium.display());
        Ok(())
    }

    /// Run the reboot script. On a real machine this doesn't come back.
    pub fn handoff(&self) -> Result<()> {
        tracing::info!("Handing off to the reboot script...");
        self.run_script(&self.config.tools.reboot_script)
    }

    fn run_script(&self, script: &Path) -> Result<()> {
        let script: PathBuf = self.dirs.tool_path(script);
        self.runner
            .run(&CommandLine::new("cmd").arg("/c").arg(script))
    }
}

/// One integer, newline-terminated.
pub fn write_index_record(path: &Path, index: u32) -> Result<()> {
    fs::write(path, format!("{}\n", index)).io_context(|| format!("write {}", path.display()))?;
    tracing::info!("Wrote install index {} to {}", index, path.display());
    Ok(())
}
