//! Skills: pluggable tools, prompts, workflows, security rules and transforms
//!
//! # Directory Structure
//!
//! Skills are discovered from:
//! - Project: `.skillet/skills/` - Project-specific skills
//! - User: `~/.skillet/skills/` - Available across all projects
//! - External tool servers listed in `.mcp.json`
//! - Built-ins registered by the host
//!
//! Each skill is a directory containing a `skill.yaml` manifest:
//!
//! ```yaml
//! name: rust-lint
//! version: 1.0.0
//! description: Runs clippy and reports findings
//! types: [tool]
//! permissions: ["shell:exec"]
//! triggers:
//!   files: ["Cargo.toml"]
//! implementation:
//!   backend: process
//!   entrypoint: /usr/local/bin/rust-lint-skill
//! ```

mod approval;
mod backend;
mod loader;
mod manifest;
mod runtime;
mod sandbox;
mod skill;
mod triggers;
mod version;
mod wiring;

pub use approval::{Approval, ApprovalScope, ApprovalStore, FileApprovalStore, MemoryApprovalStore};
pub use backend::{Backend, BackendFactory};
pub use loader::{Discovery, Loader};
pub use manifest::{
    validate_name, BackendKind, Dependency, Implementation, Permission, PromptConfig,
    SkillManifest, SkillType, Triggers, MANIFEST_FILE,
};
pub use runtime::{ActivationReport, Runtime};
pub use sandbox::{PermissionChecker, Resource, Sandbox};
pub use skill::{Skill, SkillSource, SkillState};
pub use triggers::{evaluate_triggers, language_for_path, ActivationContext};
pub use version::{resolve_version, satisfies};
pub use wiring::{
    Finding, PromptFragment, RegisteredScanner, SecurityScanner, Severity, WorkflowHandler,
    SYSTEM_PROMPT_KEY,
};
