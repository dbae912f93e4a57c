// ============================================
// Reimager - verify.rs
// ============================================
// Compare a local file's fingerprint against a published reference value.
// ============================================

use std::path::Path;

use crate::error::Result;
use crate::tools::Hasher;

pub struct ContentVerifier<'a> {
    hasher: &'a dyn Hasher,
}

impl<'a> ContentVerifier<'a> {
    pub fn new(hasher: &'a dyn Hasher) -> Self {
        ContentVerifier { hasher }
    }

    pub fn fingerprint(&self, path: &Path) -> Result<String> {
        self.hasher.hash_file(path)
    }

    /// Case-insensitive, whitespace-trimmed comparison. An empty expected
    /// value never matches.
    pub fn matches(&self, path: &Path, expected: &str) -> Result<bool> {
        let actual = self.fingerprint(path)?;
        let ok = fingerprints_equal(&actual, expected);
        if ok {
            tracing::info!("Fingerprint OK: {}", path.display());
        } else {
            tracing::warn!(
                "Fingerprint mismatch for {}: expected {}, got {}",
                path.display(),
                expected.trim(),
                actual.trim()
            );
        }
        Ok(ok)
    }
}

pub fn fingerprints_equal(actual: &str, expected: &str) -> bool {
    let (actual, expected) = (actual.trim(), expected.trim());
    !expected.is_empty() && actual.eq_ignore_ascii_case(expected)
}
