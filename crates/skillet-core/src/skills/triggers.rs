//! Trigger evaluation
//!
//! Matches the current session context against each skill's declared
//! triggers. Pure and deterministic.

use std::collections::BTreeSet;
use std::path::Path;

use glob::Pattern;

use super::skill::{Skill, SkillSource};

/// Language names keyed by file extension
struct LanguageDef {
    language: &'static str,
    extensions: &'static [&'static str],
}

static LANGUAGES: &[LanguageDef] = &[
    LanguageDef {
        language: "rust",
        extensions: &["rs"],
    },
    LanguageDef {
        language: "go",
        extensions: &["go"],
    },
    LanguageDef {
        language: "python",
        extensions: &["py", "pyi"],
    },
    LanguageDef {
        language: "typescript",
        extensions: &["ts", "tsx", "mts", "cts"],
    },
    LanguageDef {
        language: "javascript",
        extensions: &["js", "jsx", "mjs", "cjs"],
    },
    LanguageDef {
        language: "c",
        extensions: &["c", "h"],
    },
    LanguageDef {
        language: "cpp",
        extensions: &["cpp", "cc", "cxx", "hpp"],
    },
    LanguageDef {
        language: "zig",
        extensions: &["zig"],
    },
    LanguageDef {
        language: "lua",
        extensions: &["lua"],
    },
    LanguageDef {
        language: "shell",
        extensions: &["sh", "bash"],
    },
    LanguageDef {
        language: "java",
        extensions: &["java"],
    },
    LanguageDef {
        language: "ruby",
        extensions: &["rb"],
    },
];

/// Language for a path, by extension
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|def| def.extensions.contains(&ext.as_str()))
        .map(|def| def.language)
}

/// Snapshot of the session used to decide auto-activation
#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    pub project_files: Vec<String>,
    pub last_user_message: String,
    pub languages: Vec<String>,
    pub mode: Option<String>,
}

impl ActivationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set project files; languages are derived from them if none were set
    pub fn with_project_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.project_files = files.into_iter().map(Into::into).collect();
        if self.languages.is_empty() {
            let detected: BTreeSet<&str> = self
                .project_files
                .iter()
                .filter_map(|f| language_for_path(f))
                .collect();
            self.languages = detected.into_iter().map(String::from).collect();
        }
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.last_user_message = message.into();
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }
}

/// Whether one skill's triggers fire for `ctx`
pub fn matches(skill: &Skill, ctx: &ActivationContext) -> bool {
    if skill.source == SkillSource::Explicit {
        return true;
    }

    let triggers = &skill.manifest.triggers;
    if triggers.is_empty() {
        return false;
    }

    let file_hit = triggers.files.iter().any(|glob| {
        // Bad patterns never match
        let Ok(pattern) = Pattern::new(glob) else {
            return false;
        };
        ctx.project_files.iter().any(|file| {
            Path::new(file)
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.matches(name))
        })
    });
    if file_hit {
        return true;
    }

    let message = ctx.last_user_message.to_lowercase();
    if !message.is_empty()
        && triggers
            .keywords
            .iter()
            .any(|kw| !kw.is_empty() && message.contains(&kw.to_lowercase()))
    {
        return true;
    }

    if triggers
        .languages
        .iter()
        .any(|lang| ctx.languages.iter().any(|l| l == lang))
    {
        return true;
    }

    match &ctx.mode {
        Some(mode) => triggers.modes.iter().any(|m| m == mode),
        None => false,
    }
}

/// Skills from `candidates` whose triggers fire, in input order
pub fn evaluate_triggers<'a>(candidates: &'a [Skill], ctx: &ActivationContext) -> Vec<&'a Skill> {
    candidates.iter().filter(|s| matches(s, ctx)).collect()
}
