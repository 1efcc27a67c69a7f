//! Lifecycle hooks for active skills
//!
//! The conversation loop fires a [`HookEvent`] at fixed points (before the
//! system prompt is built, around tool calls, after a response). Handlers
//! registered by active skills run in priority order, lowest first, and form
//! a chain: each handler sees the data as modified by every handler before it.
//!
//! A handler can stop the chain by returning `cancel: true`. A handler error
//! also stops the chain and is reported with the skill that produced it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Untyped payload carried by hook events
pub type HookData = serde_json::Map<String, Value>;

/// Points in the conversation loop where hooks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SessionStart,
    BeforePromptBuild,
    BeforeToolCall,
    AfterToolCall,
    AfterResponse,
    SessionEnd,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::SessionStart,
            Phase::BeforePromptBuild,
            Phase::BeforeToolCall,
            Phase::AfterToolCall,
            Phase::AfterResponse,
            Phase::SessionEnd,
        ]
    }

    /// Wire name used by the process protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::SessionStart => "session_start",
            Phase::BeforePromptBuild => "before_prompt_build",
            Phase::BeforeToolCall => "before_tool_call",
            Phase::AfterToolCall => "after_tool_call",
            Phase::AfterResponse => "after_response",
            Phase::SessionEnd => "session_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Phase::all().iter().copied().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hook firing
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub phase: Phase,
    /// Skill that triggered the event, empty when fired by the host
    pub skill: String,
    pub data: HookData,
    pub cancel: CancellationToken,
    pub deadline: Option<tokio::time::Instant>,
}

impl HookEvent {
    pub fn new(phase: Phase, data: HookData) -> Self {
        Self {
            phase,
            skill: String::new(),
            data,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = skill.into();
        self
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What a handler (or a whole dispatch) produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    #[serde(default)]
    pub modified: Option<HookData>,
    #[serde(default)]
    pub cancel: bool,
}

impl HookResult {
    pub fn modify(modified: HookData) -> Self {
        Self {
            modified: Some(modified),
            cancel: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            modified: None,
            cancel: true,
        }
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent) -> Result<HookResult>;
}

struct Registration {
    skill: String,
    priority: u32,
    handler: Arc<dyn HookHandler>,
}

/// Per-phase, priority-sorted hook registry
#[derive(Default)]
pub struct LifecycleManager {
    phases: RwLock<HashMap<Phase, Vec<Registration>>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert after every handler with the same or lower priority
    pub fn register(
        &self,
        phase: Phase,
        skill: &str,
        priority: u32,
        handler: Arc<dyn HookHandler>,
    ) {
        let mut phases = self.phases.write();
        let list = phases.entry(phase).or_default();
        let idx = list.partition_point(|r| r.priority <= priority);
        list.insert(
            idx,
            Registration {
                skill: skill.to_string(),
                priority,
                handler,
            },
        );
        debug!(skill, phase = %phase, priority, "Registered hook");
    }

    /// Remove every handler the skill registered, across all phases
    pub fn unregister(&self, skill: &str) {
        let mut phases = self.phases.write();
        for list in phases.values_mut() {
            list.retain(|r| r.skill != skill);
        }
        phases.retain(|_, list| !list.is_empty());
    }

    /// Number of handlers registered for a phase
    pub fn handler_count(&self, phase: Phase) -> usize {
        self.phases.read().get(&phase).map_or(0, Vec::len)
    }

    /// Skills with handlers for a phase, in dispatch order
    pub fn skills_for(&self, phase: Phase) -> Vec<String> {
        self.phases
            .read()
            .get(&phase)
            .map(|list| list.iter().map(|r| r.skill.clone()).collect())
            .unwrap_or_default()
    }

    /// Run the phase's handlers in priority order.
    ///
    /// Returns `Ok(None)` when nothing is registered for the phase.
    pub async fn dispatch(&self, event: HookEvent) -> Result<Option<HookResult>> {
        // Snapshot so no lock is held while handlers run
        let handlers: Vec<(String, Arc<dyn HookHandler>)> = {
            let phases = self.phases.read();
            match phases.get(&event.phase) {
                Some(list) if !list.is_empty() => list
                    .iter()
                    .map(|r| (r.skill.clone(), Arc::clone(&r.handler)))
                    .collect(),
                _ => return Ok(None),
            }
        };

        let mut data = event.data.clone();
        let mut modified: Option<HookData> = None;
        let mut cancel = false;

        for (skill, handler) in handlers {
            if event.cancel.is_cancelled() {
                bail!("{} dispatch cancelled before skill '{}'", event.phase, skill);
            }

            let step = HookEvent {
                data: data.clone(),
                ..event.clone()
            };
            let result = handler
                .handle(&step)
                .await
                .with_context(|| format!("skill '{}' failed handling {}", skill, event.phase))?;

            if let Some(changes) = result.modified {
                let acc = modified.get_or_insert_with(HookData::new);
                for (key, value) in changes {
                    data.insert(key.clone(), value.clone());
                    acc.insert(key, value);
                }
            }

            if result.cancel {
                debug!(skill = %skill, phase = %event.phase, "Hook cancelled dispatch");
                cancel = true;
                break;
            }
        }

        Ok(Some(HookResult { modified, cancel }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records its label, optionally appends to `trail`, optionally cancels
    struct Recorder {
        label: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
        cancel: bool,
        fail: bool,
    }

    impl Recorder {
        fn new(label: &'static str, calls: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                calls: Arc::clone(calls),
                cancel: false,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl HookHandler for Recorder {
        async fn handle(&self, event: &HookEvent) -> Result<HookResult> {
            self.calls.lock().push(self.label);
            if self.fail {
                bail!("boom");
            }
            let trail = event
                .data
                .get("trail")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let mut modified = HookData::new();
            modified.insert("trail".into(), json!(format!("{}{}", trail, self.label)));
            Ok(HookResult {
                modified: Some(modified),
                cancel: self.cancel,
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_in_priority_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new();
        manager.register(Phase::BeforeToolCall, "project", 20, Recorder::new("p", &calls));
        manager.register(Phase::BeforeToolCall, "builtin", 0, Recorder::new("b", &calls));
        manager.register(Phase::BeforeToolCall, "user", 10, Recorder::new("u", &calls));

        let result = manager
            .dispatch(HookEvent::new(Phase::BeforeToolCall, HookData::new()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*calls.lock(), vec!["b", "u", "p"]);
        // Each handler saw the previous handler's output
        assert_eq!(result.modified.unwrap()["trail"], json!("bup"));
        assert!(!result.cancel);
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new();
        manager.register(Phase::AfterResponse, "first", 10, Recorder::new("1", &calls));
        manager.register(Phase::AfterResponse, "second", 10, Recorder::new("2", &calls));
        manager.register(Phase::AfterResponse, "zero", 0, Recorder::new("0", &calls));

        manager
            .dispatch(HookEvent::new(Phase::AfterResponse, HookData::new()))
            .await
            .unwrap();
        assert_eq!(*calls.lock(), vec!["0", "1", "2"]);
        assert_eq!(
            manager.skills_for(Phase::AfterResponse),
            vec!["zero", "first", "second"]
        );
    }

    #[tokio::test]
    async fn test_cancel_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new();
        manager.register(
            Phase::BeforeToolCall,
            "guard",
            0,
            Arc::new(Recorder {
                label: "g",
                calls: Arc::clone(&calls),
                cancel: true,
                fail: false,
            }),
        );
        manager.register(Phase::BeforeToolCall, "later", 10, Recorder::new("l", &calls));

        let result = manager
            .dispatch(HookEvent::new(Phase::BeforeToolCall, HookData::new()))
            .await
            .unwrap()
            .unwrap();

        assert!(result.cancel);
        assert_eq!(*calls.lock(), vec!["g"]);
    }

    #[tokio::test]
    async fn test_error_stops_dispatch_and_names_skill() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new();
        manager.register(
            Phase::AfterToolCall,
            "broken-skill",
            0,
            Arc::new(Recorder {
                label: "x",
                calls: Arc::clone(&calls),
                cancel: false,
                fail: true,
            }),
        );
        manager.register(Phase::AfterToolCall, "later", 10, Recorder::new("l", &calls));

        let err = manager
            .dispatch(HookEvent::new(Phase::AfterToolCall, HookData::new()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("broken-skill"));
        assert_eq!(err.root_cause().to_string(), "boom");
        assert_eq!(*calls.lock(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_no_handlers_returns_none() {
        let manager = LifecycleManager::new();
        let result = manager
            .dispatch(HookEvent::new(Phase::SessionStart, HookData::new()))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unregister_removes_skill_from_all_phases() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = LifecycleManager::new();
        manager.register(Phase::BeforeToolCall, "gone", 0, Recorder::new("a", &calls));
        manager.register(Phase::AfterToolCall, "gone", 0, Recorder::new("b", &calls));
        manager.register(Phase::AfterToolCall, "kept", 5, Recorder::new("c", &calls));

        manager.unregister("gone");

        assert_eq!(manager.handler_count(Phase::BeforeToolCall), 0);
        assert_eq!(manager.skills_for(Phase::AfterToolCall), vec!["kept"]);
    }

    #[test]
    fn test_phase_wire_names() {
        for phase in Phase::all() {
            assert_eq!(Phase::parse(phase.as_str()), Some(*phase));
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, json!(phase.as_str()));
        }
        assert_eq!(Phase::parse("on_whatever"), None);
    }
}
