//! Skill System
//!
//! Content-addressed loading and sandboxed execution of skill bundles.

pub mod loader;
pub mod runner;
pub mod types;

pub use loader::{content_hash, SkillLoader};
pub use runner::{RunnerConfig, SkillRunner};
pub use types::{
    validate_skill_id, ExecutionDecl, ExecutionResult, ExecutionStep, SkillBundle, SkillError,
    SkillManifest,
};
