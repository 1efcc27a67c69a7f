//! Permission approvals granted to skills
//!
//! The sandbox only trusts durable (`Always`) approvals. `Session` approvals
//! are kept in memory for callers that want to track one-off grants.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::manifest::Permission;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalScope {
    Session,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub skill: String,
    pub permission: Permission,
    pub scope: ApprovalScope,
    pub granted_at: DateTime<Utc>,
}

/// Persisted approval decisions. Implementations serialize their own access.
pub trait ApprovalStore: Send + Sync {
    /// True only for a durable approval
    fn is_approved(&self, skill: &str, permission: Permission) -> bool;
    fn approve(&self, skill: &str, permission: Permission, scope: ApprovalScope) -> Result<()>;
    fn revoke(&self, skill: &str, permission: Permission) -> Result<()>;
    fn list_approvals(&self) -> Vec<Approval>;
}

fn upsert(list: &mut Vec<Approval>, skill: &str, permission: Permission, scope: ApprovalScope) {
    list.retain(|a| !(a.skill == skill && a.permission == permission));
    list.push(Approval {
        skill: skill.to_string(),
        permission,
        scope,
        granted_at: Utc::now(),
    });
    list.sort_by(|a, b| (&a.skill, a.permission).cmp(&(&b.skill, b.permission)));
}

/// In-memory store, used in tests and for ephemeral sessions
#[derive(Default)]
pub struct MemoryApprovalStore {
    approvals: Mutex<Vec<Approval>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn is_approved(&self, skill: &str, permission: Permission) -> bool {
        self.approvals.lock().iter().any(|a| {
            a.skill == skill && a.permission == permission && a.scope == ApprovalScope::Always
        })
    }

    fn approve(&self, skill: &str, permission: Permission, scope: ApprovalScope) -> Result<()> {
        upsert(&mut self.approvals.lock(), skill, permission, scope);
        Ok(())
    }

    fn revoke(&self, skill: &str, permission: Permission) -> Result<()> {
        self.approvals
            .lock()
            .retain(|a| !(a.skill == skill && a.permission == permission));
        Ok(())
    }

    fn list_approvals(&self) -> Vec<Approval> {
        self.approvals.lock().clone()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApprovalFile {
    #[serde(default)]
    approvals: Vec<Approval>,
}

/// JSON-file store at `~/.skillet/approvals.json`
pub struct FileApprovalStore {
    path: PathBuf,
    durable: Mutex<Vec<Approval>>,
    session: Mutex<Vec<Approval>>,
}

impl FileApprovalStore {
    /// Open the default store
    pub fn open_default() -> Result<Self> {
        Self::open(paths::approvals_path())
    }

    /// Open a store, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let durable = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file: ApprovalFile = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            file.approvals
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            durable: Mutex::new(durable),
            session: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, approvals: &[Approval]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = ApprovalFile {
            approvals: approvals.to_vec(),
        };
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("failed to write {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&self.path) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                let _ = fs::set_permissions(&self.path, permissions);
            }
        }
        Ok(())
    }
}

impl ApprovalStore for FileApprovalStore {
    fn is_approved(&self, skill: &str, permission: Permission) -> bool {
        self.durable
            .lock()
            .iter()
            .any(|a| a.skill == skill && a.permission == permission)
    }

    fn approve(&self, skill: &str, permission: Permission, scope: ApprovalScope) -> Result<()> {
        match scope {
            ApprovalScope::Always => {
                let mut durable = self.durable.lock();
                upsert(&mut durable, skill, permission, scope);
                self.save(&durable)
            }
            ApprovalScope::Session => {
                upsert(&mut self.session.lock(), skill, permission, scope);
                Ok(())
            }
        }
    }

    fn revoke(&self, skill: &str, permission: Permission) -> Result<()> {
        self.session
            .lock()
            .retain(|a| !(a.skill == skill && a.permission == permission));
        let mut durable = self.durable.lock();
        let before = durable.len();
        durable.retain(|a| !(a.skill == skill && a.permission == permission));
        if durable.len() != before {
            self.save(&durable)?;
        }
        Ok(())
    }

    fn list_approvals(&self) -> Vec<Approval> {
        let mut all = self.durable.lock().clone();
        all.extend(self.session.lock().iter().cloned());
        all
    }
}
