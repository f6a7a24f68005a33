//! Skill Type Definitions
//!
//! Core data structures for skill bundles: the manifest front-matter,
//! the content-addressed bundle handle, and per-step execution records.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Allowed shape for a skill identifier. The identifier is later used to
/// build filesystem and registry paths, so this pattern is the sole defense
/// against path traversal.
static SKILL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,63}$").expect("valid skill id pattern"));

/// Validate a skill identifier before any filesystem or network access.
pub fn validate_skill_id(id: &str) -> Result<(), SkillError> {
    if SKILL_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(SkillError::InvalidSkillId(id.to_string()))
    }
}

/// A fetched, locally cached skill bundle.
#[derive(Debug, Clone)]
pub struct SkillBundle {
    /// Validated identifier.
    pub id: String,
    /// Local directory holding the bundle's files.
    pub dir: PathBuf,
    /// Deterministic digest over the bundle's (path, content) pairs.
    pub content_hash: String,
}

/// One declared command step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDecl {
    /// Command template; may reference `{{input}}` and `{{output}}`.
    pub run: String,
}

/// Manifest parsed from the front-matter of a bundle's `SKILL.md`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered command steps.
    #[serde(default)]
    pub execution: Vec<ExecutionDecl>,
    /// Parent environment variables the skill needs. Declaring a name here
    /// is necessary and sufficient for it to be visible to the steps.
    #[serde(default)]
    pub requires_env: Vec<String>,
}

impl SkillManifest {
    /// Parse the YAML front-matter of a SKILL.md document.
    ///
    /// The manifest is the block between the leading `---` line and the
    /// next `---` line; everything after it is free-form documentation.
    pub fn from_markdown(content: &str) -> Result<Self, SkillError> {
        let rest = content
            .trim_start_matches('\u{feff}')
            .strip_prefix("---")
            .ok_or_else(|| SkillError::Manifest("missing front-matter delimiter".to_string()))?;
        let end = rest
            .find("\n---")
            .ok_or_else(|| SkillError::Manifest("unterminated front-matter".to_string()))?;
        serde_yaml::from_str(&rest[..end]).map_err(|e| SkillError::Manifest(e.to_string()))
    }
}

/// A recorded command step. Immutable once captured; command failures are
/// expressed through `exit_code`, never as errors.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStep {
    /// Declared command template, placeholders intact.
    pub template: String,
    /// Fully resolved command string (placeholders substituted).
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// 0 on success; 124 on timeout, 127 on spawn failure, otherwise the
    /// process-supplied status.
    pub exit_code: i32,
}

/// Result of running every declared step of a bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub skill_id: String,
    /// Last step's stdout, trimmed of surrounding whitespace.
    pub output: String,
    pub steps: Vec<ExecutionStep>,
}

/// Fatal loader/runner errors. These abort the whole skill invocation and
/// are distinct from command-step failures, which are captured in
/// `ExecutionStep::exit_code`.
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid skill ID: '{0}'")]
    InvalidSkillId(String),

    #[error("skill not found: '{0}'")]
    NotFound(String),

    #[error("content hash mismatch for '{id}': expected {expected}…, got {actual}…")]
    ContentHashMismatch {
        id: String,
        /// Truncated hash prefixes only; full digests never appear in
        /// error text.
        expected: String,
        actual: String,
    },

    #[error("missing manifest: {0} has no SKILL.md")]
    MissingManifest(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("registry error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
