//! Type-specific activation wiring
//!
//! Each [`SkillType`] maps to one wiring function run after a skill's tools
//! and hooks are registered. Adding a type means adding a row to
//! [`wiring_for`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::manifest::SkillType;
use super::skill::Skill;
use crate::lifecycle::{HookEvent, HookHandler, HookResult, LifecycleManager, Phase};

/// Rough prompt budget: characters per token
const CHARS_PER_TOKEN: usize = 4;

/// Hook data key the prompt hook appends to
pub const SYSTEM_PROMPT_KEY: &str = "system_prompt";

/// Cached prompt content for an active prompt skill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFragment {
    pub skill: String,
    pub priority: u32,
    pub content: String,
}

/// Host-side implementation of a workflow skill
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn run(&self, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub skill: String,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub line: Option<usize>,
}

/// Host-side implementation of a security-rule skill
#[async_trait]
pub trait SecurityScanner: Send + Sync {
    async fn scan(&self, path: &Path, content: &str) -> Result<Vec<Finding>>;
}

#[derive(Clone)]
pub struct RegisteredScanner {
    pub skill: String,
    pub scanner: Arc<dyn SecurityScanner>,
}

/// Per-activation tables, keyed by skill name
#[derive(Default)]
pub(crate) struct SideTables {
    pub prompts: HashMap<String, PromptFragment>,
    pub workflows: HashMap<String, Arc<dyn WorkflowHandler>>,
    pub scanners: HashMap<String, RegisteredScanner>,
}

impl SideTables {
    /// Drop everything for `skill`, whatever its declared types
    pub fn purge(&mut self, skill: &str) {
        self.prompts.remove(skill);
        self.workflows.remove(skill);
        self.scanners.remove(skill);
    }
}

/// What a wiring function can see and touch
pub(crate) struct Wiring<'a> {
    pub skill: &'a str,
    pub priority: u32,
    /// Resolved prompt, present when the skill declares `prompt`
    pub prompt: Option<&'a str>,
    pub lifecycle: &'a LifecycleManager,
    pub tables: &'a mut SideTables,
}

pub(crate) type WireFn = fn(&mut Wiring<'_>) -> Result<()>;

pub(crate) fn wiring_for(ty: SkillType) -> WireFn {
    match ty {
        SkillType::Tool => wire_tool,
        SkillType::Prompt => wire_prompt,
        SkillType::Workflow => wire_workflow,
        SkillType::SecurityRule => wire_security_rule,
        SkillType::Transform => wire_transform,
    }
}

// Tools were registered before wiring runs
fn wire_tool(_: &mut Wiring<'_>) -> Result<()> {
    Ok(())
}

fn wire_prompt(w: &mut Wiring<'_>) -> Result<()> {
    let Some(content) = w.prompt.filter(|c| !c.is_empty()) else {
        debug!(skill = %w.skill, "Prompt skill has no prompt content");
        return Ok(());
    };
    w.tables.prompts.insert(
        w.skill.to_string(),
        PromptFragment {
            skill: w.skill.to_string(),
            priority: w.priority,
            content: content.to_string(),
        },
    );
    w.lifecycle.register(
        Phase::BeforePromptBuild,
        w.skill,
        w.priority,
        Arc::new(PromptHook {
            content: content.to_string(),
        }),
    );
    Ok(())
}

fn wire_workflow(w: &mut Wiring<'_>) -> Result<()> {
    if w.tables.workflows.contains_key(w.skill) {
        debug!(skill = %w.skill, "Workflow handler attached");
    } else {
        debug!(skill = %w.skill, "No workflow handler registered yet");
    }
    Ok(())
}

fn wire_security_rule(w: &mut Wiring<'_>) -> Result<()> {
    if w.tables.scanners.contains_key(w.skill) {
        debug!(skill = %w.skill, "Security scanner attached");
    } else {
        debug!(skill = %w.skill, "No security scanner registered yet");
    }
    Ok(())
}

// Transforms work through the hooks their backend declared
fn wire_transform(w: &mut Wiring<'_>) -> Result<()> {
    let phases: Vec<_> = Phase::all()
        .iter()
        .filter(|p| w.lifecycle.skills_for(**p).iter().any(|s| s == w.skill))
        .collect();
    if phases.is_empty() {
        debug!(skill = %w.skill, "Transform skill registered no hooks");
    }
    Ok(())
}

/// Appends a skill's prompt to the `system_prompt` being built
struct PromptHook {
    content: String,
}

#[async_trait]
impl HookHandler for PromptHook {
    async fn handle(&self, event: &HookEvent) -> Result<HookResult> {
        let current = event
            .data
            .get(SYSTEM_PROMPT_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let prompt = if current.is_empty() {
            self.content.clone()
        } else {
            format!("{}\n\n{}", current, self.content)
        };
        let mut modified = event.data.clone();
        modified.insert(SYSTEM_PROMPT_KEY.to_string(), Value::String(prompt));
        Ok(HookResult::modify(modified))
    }
}

/// Build the prompt text for a skill
///
/// With a skill directory, `system_prompt_file` and `context_files` are read
/// from it. Built-ins have no directory and their `system_prompt_file` is the
/// prompt itself.
pub(crate) async fn resolve_prompt(skill: &Skill) -> Result<Option<String>> {
    let Some(config) = &skill.manifest.prompt else {
        return Ok(None);
    };

    let mut parts = Vec::new();
    if let Some(system) = &config.system_prompt_file {
        match &skill.dir {
            Some(dir) => parts.push(read_skill_file(dir, system).await?),
            None => parts.push(system.clone()),
        }
    }
    match &skill.dir {
        Some(dir) => {
            for file in &config.context_files {
                let content = read_skill_file(dir, file).await?;
                parts.push(format!("## {}\n\n{}", file, content.trim_end()));
            }
        }
        None if !config.context_files.is_empty() => {
            debug!(skill = %skill.name(), "Ignoring context files for skill without a directory");
        }
        None => {}
    }

    let mut content = parts.join("\n\n");
    if let Some(tokens) = config.max_context_tokens {
        truncate_chars(&mut content, tokens.saturating_mul(CHARS_PER_TOKEN));
    }
    Ok(Some(content))
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}

/// Read a file that must live inside the skill directory
async fn read_skill_file(dir: &Path, file_name: &str) -> Result<String> {
    let relative = PathBuf::from(file_name);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        bail!("invalid file path '{}': must stay inside the skill directory", file_name);
    }

    let path = dir.join(&relative);
    let canonical_dir = tokio::fs::canonicalize(dir).await?;
    let canonical_file = tokio::fs::canonicalize(&path)
        .await
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    if !canonical_file.starts_with(&canonical_dir) {
        bail!("file path '{}' escapes the skill directory", file_name);
    }

    tokio::fs::read_to_string(&canonical_file)
        .await
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))
}
