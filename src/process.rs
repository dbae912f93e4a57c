// ============================================
// Reimager - process.rs
// ============================================
// Runs external tools (7-Zip, DISM, certutil, curl, the .cmd scripts).
//
// Every invocation:
// - is logged before it starts (audit trail of exactly what ran)
// - blocks until the process exits (no timeout)
// - fails with ExternalTool if the exit status is non-zero or the
//   program can't be started
//
// The CommandRunner trait is the seam tests use to swap in a fake.
// ============================================

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{ReimageError, Result};

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<Path>) -> Self {
        CommandLine {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments as lossy strings.
    #[cfg(test)]
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", quote(&arg.to_string_lossy()))?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.contains(char::is_whitespace) {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}

pub trait CommandRunner {
    /// Run to completion; output goes straight to the console.
    fn run(&self, cmd: &CommandLine) -> Result<()>;

    /// Run to completion and return stdout.
    fn output(&self, cmd: &CommandLine) -> Result<String>;
}

/// Runs commands for real with std::process.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner {
    /// Working directory for every spawned process (None = inherit).
    pub current_dir: Option<PathBuf>,
}

impl SystemRunner {
    pub fn new(current_dir: Option<PathBuf>) -> Self {
        SystemRunner { current_dir }
    }

    fn command(&self, cmd: &CommandLine) -> Command {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandLine) -> Result<()> {
        tracing::info!("exec: {}", cmd);

        let status = self.command(cmd).status().map_err(|e| {
            tracing::error!("could not start {}: {}", cmd.program.display(), e);
            ReimageError::ExternalTool {
                command: cmd.to_string(),
                status: None,
            }
        })?;

        if !status.success() {
            return Err(ReimageError::ExternalTool {
                command: cmd.to_string(),
                status: Some(status.code().unwrap_or(-1)),
            });
        }
        Ok(())
    }

    fn output(&self, cmd: &CommandLine) -> Result<String> {
        tracing::info!("exec: {}", cmd);

        let output = self.command(cmd).output().map_err(|e| {
            tracing::error!("could not start {}: {}", cmd.program.display(), e);
            ReimageError::ExternalTool {
                command: cmd.to_string(),
                status: None,
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!("stdout:\n{}", stdout.trim());
            tracing::debug!("stderr:\n{}", stderr.trim());
            return Err(ReimageError::ExternalTool {
                command: cmd.to_string(),
                status: Some(output.status.code().unwrap_or(-1)),
            });
        }
        Ok(stdout)
    }
}
