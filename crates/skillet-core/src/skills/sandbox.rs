//! Per-skill permission and rate-limit enforcement

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::approval::ApprovalStore;
use super::manifest::{Permission, SkillManifest};
use crate::config::RateLimits;
use crate::error::SkillError;

/// Metered resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    LlmCall,
    ShellExec,
    NetFetch,
    FileRead,
    FileWrite,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::LlmCall => "llm_call",
            Resource::ShellExec => "shell_exec",
            Resource::NetFetch => "net_fetch",
            Resource::FileRead => "file_read",
            Resource::FileWrite => "file_write",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What backends see of their sandbox
pub trait PermissionChecker: Send + Sync {
    fn check_permission(&self, permission: Permission) -> Result<()>;
    fn check_rate_limit(&self, resource: Resource) -> Result<()>;
}

pub struct Sandbox {
    skill: String,
    declared: HashSet<Permission>,
    auto_approved: bool,
    approvals: Arc<dyn ApprovalStore>,
    limits: RateLimits,
    counters: Mutex<HashMap<Resource, u32>>,
}

impl Sandbox {
    pub fn new(
        manifest: &SkillManifest,
        auto_approved: bool,
        approvals: Arc<dyn ApprovalStore>,
        limits: RateLimits,
    ) -> Self {
        Self {
            skill: manifest.name.clone(),
            declared: manifest.permissions.iter().copied().collect(),
            auto_approved,
            approvals,
            limits,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn skill(&self) -> &str {
        &self.skill
    }

    pub fn is_auto_approved(&self) -> bool {
        self.auto_approved
    }

    /// Zero every counter. Called once per conversation turn.
    pub fn reset_turn_limits(&self) {
        self.counters.lock().clear();
    }

    /// Calls counted against `resource` in the current turn
    pub fn usage(&self, resource: Resource) -> u32 {
        self.counters.lock().get(&resource).copied().unwrap_or(0)
    }
}

impl PermissionChecker for Sandbox {
    fn check_permission(&self, permission: Permission) -> Result<()> {
        if !self.declared.contains(&permission) {
            warn!(skill = %self.skill, %permission, "Undeclared permission requested");
            return Err(SkillError::PermissionNotDeclared {
                skill: self.skill.clone(),
                permission,
            }
            .into());
        }
        if self.auto_approved || self.approvals.is_approved(&self.skill, permission) {
            return Ok(());
        }
        Err(SkillError::PermissionNotApproved {
            skill: self.skill.clone(),
            permission,
        }
        .into())
    }

    fn check_rate_limit(&self, resource: Resource) -> Result<()> {
        let Some(limit) = self.limits.limit_for(resource) else {
            return Ok(());
        };

        let mut counters = self.counters.lock();
        let count = counters.entry(resource).or_insert(0);
        *count = count.saturating_add(1);
        if *count > limit {
            debug!(skill = %self.skill, %resource, limit, "Rate limit hit");
            return Err(SkillError::RateLimited {
                skill: self.skill.clone(),
                resource: resource.to_string(),
                limit,
            }
            .into());
        }
        Ok(())
    }
}
