//! Result types for command execution

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result of a successful command run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Unique token identifying this run
    pub id: String,
    /// stdout output, one trailing newline removed
    pub stdout: String,
    /// stderr output, one trailing newline removed
    pub stderr: String,
    /// Files matched by the asset globs, keyed by path relative to the working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<BTreeMap<String, PathBuf>>,
    /// Files matched by the archive globs, keyed by path relative to the working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<BTreeMap<String, PathBuf>>,
    /// False for preview placeholders whose outputs are not known yet
    #[serde(default = "resolved_default")]
    pub resolved: bool,
}

fn resolved_default() -> bool {
    true
}

impl ExecutionResult {
    /// Build a result from raw captured output
    pub fn new(stdout: String, stderr: String) -> Self {
        Self {
            id: new_id(),
            stdout: trim_trailing_newline(&stdout).to_string(),
            stderr: trim_trailing_newline(&stderr).to_string(),
            assets: None,
            archive: None,
            resolved: true,
        }
    }

    /// Build a result from captured bytes, replacing invalid UTF-8
    #[must_use]
    pub fn from_output(stdout: &[u8], stderr: &[u8]) -> Self {
        Self::new(
            String::from_utf8_lossy(stdout).into_owned(),
            String::from_utf8_lossy(stderr).into_owned(),
        )
    }

    /// Result of a step that had nothing to run
    #[must_use]
    pub fn empty() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Placeholder returned by previews; outputs are unknown
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            resolved: false,
            ..Self::empty()
        }
    }
}

/// Remove exactly one trailing `\n`, if present
#[must_use]
pub fn trim_trailing_newline(s: &str) -> &str {
    s.strip_suffix('\n').unwrap_or(s)
}

/// Opaque unique identifier for a run or copy
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
