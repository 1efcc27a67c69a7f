//! Categorised runtime errors
//!
//! Most functions return `anyhow::Result` and add context on the way up.
//! The variants here are the leaf errors callers may want to match on;
//! `anyhow::Error::downcast_ref::<SkillError>()` sees through context layers.

use std::time::Duration;

use crate::skills::{Permission, SkillState};

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid manifest field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("skill '{0}' not found")]
    UnknownSkill(String),

    #[error("skill '{skill}' requires missing dependency '{dependency}'")]
    MissingDependency { skill: String, dependency: String },

    #[error("skill '{skill}' did not declare permission {permission}")]
    PermissionNotDeclared { skill: String, permission: Permission },

    #[error("skill '{skill}' has no durable approval for {permission}")]
    PermissionNotApproved { skill: String, permission: Permission },

    #[error("skill '{skill}' exceeded the per-turn limit of {limit} for {resource}")]
    RateLimited {
        skill: String,
        resource: String,
        limit: u32,
    },

    #[error("skill '{skill}': invalid state transition {from} -> {to}")]
    InvalidTransition {
        skill: String,
        from: SkillState,
        to: SkillState,
    },

    #[error("tool '{0}' is already registered")]
    ToolConflict(String),

    #[error("tool '{0}' is not registered")]
    ToolNotFound(String),

    #[error("process not running")]
    NotRunning,

    #[error("process closed stdout")]
    ProcessClosed,

    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("{method} was cancelled")]
    Cancelled { method: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl SkillError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}
