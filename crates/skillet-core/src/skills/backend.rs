//! Backend contract shared by every execution strategy
//!
//! A backend is constructed per activation through the factory registered for
//! the manifest's [`BackendKind`](super::BackendKind), loaded outside the
//! runtime lock, and unloaded on deactivation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::manifest::SkillManifest;
use super::sandbox::PermissionChecker;
use super::skill::Skill;
use crate::lifecycle::{HookHandler, Phase};
use crate::tools::Tool;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Start the backend and discover what it exposes
    async fn load(&self, manifest: &SkillManifest, checker: Arc<dyn PermissionChecker>)
        -> Result<()>;

    /// Tools exposed after a successful load
    async fn tools(&self) -> Vec<Arc<dyn Tool>>;

    /// Hook handlers exposed after a successful load
    async fn hooks(&self) -> HashMap<Phase, Arc<dyn HookHandler>>;

    /// Stop the backend. Must be safe to call when nothing is loaded.
    async fn unload(&self) -> Result<()>;
}

/// Builds a fresh, unloaded backend for a skill
pub type BackendFactory = Arc<dyn Fn(&Skill) -> Result<Arc<dyn Backend>> + Send + Sync>;
