//! Skillet core
//!
//! Skill discovery, sandboxing, lifecycle hooks and execution backends for an
//! AI coding assistant. [`skills::Runtime`] is the entry point.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mcp;
pub mod paths;
pub mod process;
pub mod rpc;
pub mod skills;
pub mod tools;

pub use config::RuntimeConfig;
pub use error::SkillError;
pub use lifecycle::{HookEvent, HookHandler, HookResult, LifecycleManager, Phase};
pub use skills::{Runtime, Skill, SkillManifest, SkillSource, SkillState};
pub use tools::ToolRegistry;
