// ============================================
// Reimager - error.rs
// ============================================
// Every fatal condition the pipeline can hit, one variant per class.
// The only recoverable condition (a failed or corrupted download) never
// becomes one of these: fetch.rs loops on it instead.
// ============================================

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReimageError>;

#[derive(Debug, Error)]
pub enum ReimageError {
    /// Malformed or missing input. The pipeline never starts.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Bad or incomplete run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external tool exited non-zero, or could not be started at all
    /// (`status` is `None` in that case).
    #[error("command failed ({}): {command}", exit_status_display(.status))]
    ExternalTool { command: String, status: Option<i32> },

    /// A preset source image that must already be on disk is missing.
    #[error("missing source image: {}", .0.display())]
    MissingSource(PathBuf),

    /// Custom image with an extension other than .iso, .wim or .esd.
    #[error("unsupported image format: {} (expected .iso, .wim or .esd)", .0.display())]
    UnsupportedFormat(PathBuf),

    /// The conversion step ran but the canonical image is not there.
    #[error("failed to generate {}", .0.display())]
    ConversionFailed(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Only reachable when `fetch.max_attempts` is finite.
    #[error("gave up on {name} after {attempts} attempt(s)")]
    FetchExhausted { name: String, attempts: u32 },
}

fn exit_status_display(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {}", code),
        None => "could not start".to_string(),
    }
}

impl ReimageError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ReimageError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors raised before any pipeline work happens.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, ReimageError::Validation(_) | ReimageError::Config(_))
    }
}

/// Attach a path-bearing message to an `io::Result`.
pub trait IoContext<T> {
    fn io_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| ReimageError::io(f(), e))
    }
}
