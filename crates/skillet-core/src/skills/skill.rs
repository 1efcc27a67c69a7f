//! Runtime skill record and activation state machine

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::backend::Backend;
use super::manifest::SkillManifest;
use crate::error::SkillError;

/// Where a skill was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkillSource {
    /// Compiled into the host
    Builtin,
    /// `~/.skillet/skills`
    User,
    /// Requested by name for this session
    Explicit,
    /// `<project>/.skillet/skills`
    Project,
    /// Synthesised from an external tool-server config
    ExternalServer,
}

impl SkillSource {
    /// Hook dispatch priority, lower runs first
    pub fn priority(&self) -> u32 {
        match self {
            SkillSource::Builtin => 0,
            SkillSource::User | SkillSource::Explicit => 10,
            SkillSource::Project => 20,
            SkillSource::ExternalServer => 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SkillSource::Builtin => "builtin",
            SkillSource::User => "user",
            SkillSource::Explicit => "explicit",
            SkillSource::Project => "project",
            SkillSource::ExternalServer => "external-server",
        }
    }
}

impl fmt::Display for SkillSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkillState {
    Inactive,
    Activating,
    Active,
    Error,
}

impl SkillState {
    /// The only edges of the activation state machine
    pub fn can_transition_to(&self, to: SkillState) -> bool {
        matches!(
            (self, to),
            (SkillState::Inactive, SkillState::Activating)
                | (SkillState::Activating, SkillState::Active)
                | (SkillState::Activating, SkillState::Error)
                | (SkillState::Active, SkillState::Inactive)
                | (SkillState::Error, SkillState::Inactive)
        )
    }
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkillState::Inactive => "inactive",
            SkillState::Activating => "activating",
            SkillState::Active => "active",
            SkillState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One discovered skill. Owned by the runtime's skill table.
#[derive(Clone)]
pub struct Skill {
    pub manifest: Arc<SkillManifest>,
    state: SkillState,
    /// Directory the manifest came from; `None` for built-ins and server skills
    pub dir: Option<PathBuf>,
    pub source: SkillSource,
    pub(crate) backend: Option<Arc<dyn Backend>>,
}

impl fmt::Debug for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skill")
            .field("name", &self.manifest.name)
            .field("state", &self.state)
            .field("dir", &self.dir)
            .field("source", &self.source)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl Skill {
    pub fn new(manifest: SkillManifest, dir: Option<PathBuf>, source: SkillSource) -> Self {
        Self {
            manifest: Arc::new(manifest),
            state: SkillState::Inactive,
            dir,
            source,
            backend: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn state(&self) -> SkillState {
        self.state
    }

    pub fn backend(&self) -> Option<&Arc<dyn Backend>> {
        self.backend.as_ref()
    }

    /// Move to `to` if the edge exists; otherwise leave state unchanged
    pub fn transition_to(&mut self, to: SkillState) -> Result<(), SkillError> {
        if !self.state.can_transition_to(to) {
            return Err(SkillError::InvalidTransition {
                skill: self.manifest.name.clone(),
                from: self.state,
                to,
            });
        }
        tracing::debug!(skill = %self.manifest.name, from = %self.state, to = %to, "Skill state transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::manifest::SkillType;

    fn skill() -> Skill {
        let manifest = SkillManifest {
            name: "notes".to_string(),
            version: "1.0.0".to_string(),
            description: "Note taking".to_string(),
            types: vec![SkillType::Prompt],
            author: None,
            license: None,
            homepage: None,
            triggers: Default::default(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
            implementation: None,
            prompt: None,
        };
        Skill::new(manifest, None, SkillSource::Builtin)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = skill();
        assert_eq!(s.state(), SkillState::Inactive);
        s.transition_to(SkillState::Activating).unwrap();
        s.transition_to(SkillState::Active).unwrap();
        s.transition_to(SkillState::Inactive).unwrap();
        s.transition_to(SkillState::Activating).unwrap();
        s.transition_to(SkillState::Error).unwrap();
        s.transition_to(SkillState::Inactive).unwrap();
    }

    #[test]
    fn test_invalid_transition_leaves_state_unchanged() {
        let mut s = skill();
        let err = s.transition_to(SkillState::Active).unwrap_err();
        assert!(matches!(err, SkillError::InvalidTransition { .. }));
        assert_eq!(s.state(), SkillState::Inactive);

        s.transition_to(SkillState::Activating).unwrap();
        assert!(s.transition_to(SkillState::Inactive).is_err());
        assert!(s.transition_to(SkillState::Activating).is_err());
        assert_eq!(s.state(), SkillState::Activating);
    }

    #[test]
    fn test_source_priorities() {
        assert_eq!(SkillSource::Builtin.priority(), 0);
        assert_eq!(SkillSource::User.priority(), 10);
        assert_eq!(SkillSource::Explicit.priority(), 10);
        assert_eq!(SkillSource::Project.priority(), 20);
        assert!(SkillSource::ExternalServer.priority() > SkillSource::Project.priority());
    }
}
