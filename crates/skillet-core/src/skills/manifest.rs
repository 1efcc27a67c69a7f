//! Skill manifest parsing and validation
//!
//! A manifest is a YAML document (`skill.yaml`) at the root of a skill
//! directory. Parsing goes through a loosely typed raw form first so that
//! every failure can name the field that caused it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SkillError;

/// File name looked up inside each skill directory
pub const MANIFEST_FILE: &str = "skill.yaml";

/// Maximum allowed length for a skill name
pub const MAX_NAME_LEN: usize = 128;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").expect("valid name regex"));

/// What a skill contributes to the assistant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkillType {
    Tool,
    Prompt,
    Workflow,
    SecurityRule,
    Transform,
}

impl SkillType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillType::Tool => "tool",
            SkillType::Prompt => "prompt",
            SkillType::Workflow => "workflow",
            SkillType::SecurityRule => "security-rule",
            SkillType::Transform => "transform",
        }
    }
}

impl fmt::Display for SkillType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkillType {
    type Err = SkillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(SkillType::Tool),
            "prompt" => Ok(SkillType::Prompt),
            "workflow" => Ok(SkillType::Workflow),
            "security-rule" => Ok(SkillType::SecurityRule),
            "transform" => Ok(SkillType::Transform),
            other => Err(SkillError::validation(
                "types",
                format!("unknown skill type '{}'", other),
            )),
        }
    }
}

/// Capabilities a skill may declare. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "file:read")]
    FileRead,
    #[serde(rename = "file:write")]
    FileWrite,
    #[serde(rename = "shell:exec")]
    ShellExec,
    #[serde(rename = "net:fetch")]
    NetFetch,
    #[serde(rename = "llm:call")]
    LlmCall,
    #[serde(rename = "git:read")]
    GitRead,
    #[serde(rename = "git:write")]
    GitWrite,
    #[serde(rename = "env:read")]
    EnvRead,
    #[serde(rename = "env:write")]
    EnvWrite,
    #[serde(rename = "skill:invoke")]
    SkillInvoke,
}

impl Permission {
    pub fn all() -> &'static [Permission] {
        &[
            Permission::FileRead,
            Permission::FileWrite,
            Permission::ShellExec,
            Permission::NetFetch,
            Permission::LlmCall,
            Permission::GitRead,
            Permission::GitWrite,
            Permission::EnvRead,
            Permission::EnvWrite,
            Permission::SkillInvoke,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::FileRead => "file:read",
            Permission::FileWrite => "file:write",
            Permission::ShellExec => "shell:exec",
            Permission::NetFetch => "net:fetch",
            Permission::LlmCall => "llm:call",
            Permission::GitRead => "git:read",
            Permission::GitWrite => "git:write",
            Permission::EnvRead => "env:read",
            Permission::EnvWrite => "env:write",
            Permission::SkillInvoke => "skill:invoke",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = SkillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                SkillError::validation("permissions", format!("unknown permission '{}'", s))
            })
    }
}

/// How a skill is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Out-of-process helper speaking JSON-RPC over stdio
    Process,
    /// Embedded interpreter; requires a factory registered by the host
    Script,
    /// Tools proxied from an external MCP server
    Mcp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Script => "script",
            BackendKind::Mcp => "mcp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SkillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(BackendKind::Process),
            "script" => Ok(BackendKind::Script),
            "mcp" => Ok(BackendKind::Mcp),
            other => Err(SkillError::validation(
                "implementation.backend",
                format!("unknown backend '{}'", other),
            )),
        }
    }
}

/// Conditions under which a skill auto-activates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl Triggers {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.keywords.is_empty()
            && self.modes.is_empty()
            && self.languages.is_empty()
    }
}

/// Backend selection and launch details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub backend: BackendKind,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Semver requirement the dependency's version must satisfy
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Path relative to the skill directory, or literal content for built-ins
    #[serde(default)]
    pub system_prompt_file: Option<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub max_context_tokens: Option<usize>,
}

/// A validated skill manifest. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub types: Vec<SkillType>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub triggers: Triggers,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub implementation: Option<Implementation>,
    #[serde(default)]
    pub prompt: Option<PromptConfig>,
}

/// Loosely typed form; everything optional so errors can name the field
#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    types: Vec<String>,
    author: Option<String>,
    license: Option<String>,
    homepage: Option<String>,
    #[serde(default)]
    triggers: Triggers,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    dependencies: Vec<Dependency>,
    implementation: Option<RawImplementation>,
    prompt: Option<PromptConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImplementation {
    backend: Option<String>,
    entrypoint: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, SkillError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SkillError::validation(field, "missing required field")),
    }
}

impl SkillManifest {
    /// Parse and validate a manifest from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawManifest =
            serde_yaml::from_str(content).context("failed to parse skill manifest YAML")?;
        Ok(Self::from_raw(raw)?)
    }

    /// Read, parse and validate `dir/skill.yaml`
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid manifest {}", path.display()))
    }

    fn from_raw(raw: RawManifest) -> Result<Self, SkillError> {
        let name = required(raw.name, "name")?;
        let version = required(raw.version, "version")?;
        let description = required(raw.description, "description")?;
        if raw.types.is_empty() {
            return Err(SkillError::validation(
                "types",
                "at least one type is required",
            ));
        }

        let types = raw
            .types
            .iter()
            .map(|t| t.parse())
            .collect::<Result<Vec<SkillType>, _>>()?;
        let permissions = raw
            .permissions
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<Permission>, _>>()?;

        let implementation = match raw.implementation {
            Some(imp) => {
                let backend = match imp.backend {
                    Some(b) => b.parse::<BackendKind>()?,
                    None => {
                        return Err(SkillError::validation(
                            "implementation.backend",
                            "missing required field",
                        ))
                    }
                };
                Some(Implementation {
                    backend,
                    entrypoint: imp.entrypoint,
                    args: imp.args,
                    env: imp.env,
                })
            }
            None => None,
        };

        let manifest = SkillManifest {
            name,
            version,
            description,
            types,
            author: raw.author,
            license: raw.license,
            homepage: raw.homepage,
            triggers: raw.triggers,
            permissions,
            dependencies: raw.dependencies,
            implementation,
            prompt: raw.prompt,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check invariants. Also used for manifests built in code.
    pub fn validate(&self) -> Result<(), SkillError> {
        validate_name(&self.name, "name")?;

        if self.version.trim().is_empty() {
            return Err(SkillError::validation("version", "missing required field"));
        }
        if let Err(e) = semver::Version::parse(self.version.trim()) {
            // Only dependency constraints need semver; they fail to match instead
            warn!(skill = %self.name, version = %self.version, "Version is not semver: {}", e);
        }

        if self.description.trim().is_empty() {
            return Err(SkillError::validation(
                "description",
                "missing required field",
            ));
        }
        if self.types.is_empty() {
            return Err(SkillError::validation(
                "types",
                "at least one type is required",
            ));
        }

        if self.needs_backend() {
            let Some(imp) = &self.implementation else {
                return Err(SkillError::validation(
                    "implementation.backend",
                    format!(
                        "required for skill types other than prompt ({})",
                        self.type_list()
                    ),
                ));
            };
            if imp.entrypoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
                return Err(SkillError::validation(
                    "implementation.entrypoint",
                    format!("required for backend '{}'", imp.backend),
                ));
            }
        }

        if let Some(imp) = &self.implementation {
            if imp.backend == BackendKind::Process {
                if let Some(entry) = &imp.entrypoint {
                    if !Path::new(entry).is_absolute() {
                        return Err(SkillError::validation(
                            "implementation.entrypoint",
                            format!("process entrypoint must be an absolute path: {}", entry),
                        ));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            validate_name(&dep.name, "dependencies.name")?;
            if !seen.insert(dep.name.as_str()) {
                return Err(SkillError::validation(
                    "dependencies.name",
                    format!("duplicate dependency '{}'", dep.name),
                ));
            }
            if let Some(req) = &dep.version {
                semver::VersionReq::parse(req).map_err(|e| {
                    SkillError::validation(
                        "dependencies.version",
                        format!("'{}' for '{}': {}", req, dep.name, e),
                    )
                })?;
            }
        }

        Ok(())
    }

    /// Any declared type other than `prompt` needs a backend
    pub fn needs_backend(&self) -> bool {
        self.types.iter().any(|t| *t != SkillType::Prompt)
    }

    pub fn has_type(&self, ty: SkillType) -> bool {
        self.types.contains(&ty)
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.implementation.as_ref().map(|i| i.backend)
    }

    fn type_list(&self) -> String {
        self.types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Validate a skill name against the slug rules
pub fn validate_name(name: &str, field: &str) -> Result<(), SkillError> {
    if name.is_empty() {
        return Err(SkillError::validation(field, "missing required field"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SkillError::validation(
            field,
            format!("'{}' exceeds {} characters", name, MAX_NAME_LEN),
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(SkillError::validation(
            field,
            format!("'{}' must be a lowercase slug like 'git-commit'", name),
        ));
    }
    Ok(())
}
