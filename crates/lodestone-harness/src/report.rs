//! JSON evidence report types.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// One pass/fail check with supporting detail.
#[derive(Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub pass: bool,
    pub detail: String,
}

impl Check {
    #[must_use]
    pub fn new(name: &str, pass: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            pass,
            detail: detail.into(),
        }
    }
}

/// A full harness run.
#[derive(Debug, Serialize)]
pub struct Report {
    pub suite: String,
    pub checks: Vec<Check>,
    pub passed: usize,
    pub failed: usize,
    /// SHA-256 of the final flash image, for diffing runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_sha256: Option<String>,
}

impl Report {
    #[must_use]
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            checks: Vec::new(),
            passed: 0,
            failed: 0,
            flash_sha256: None,
        }
    }

    pub fn record(&mut self, check: Check) {
        if check.pass {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.checks.push(check);
    }

    pub fn attach_flash_image(&mut self, image: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(image);
        self.flash_sha256 = Some(format!("{:x}", hasher.finalize()));
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Serialise for output. Falls back to a bare failure object if
    /// serialisation itself fails.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}
