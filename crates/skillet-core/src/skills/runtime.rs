//! Skill runtime
//!
//! Owns the skill table and drives every skill through the activation state
//! machine. One lock guards the bookkeeping; it is never held while a backend
//! is constructed, loaded or unloaded.
//!
//! ```rust,ignore
//! let runtime = Runtime::new(config, Arc::new(ToolRegistry::new()), approvals);
//! runtime.discover(&[]).await?;
//! let report = runtime
//!     .evaluate_and_activate(&ActivationContext::new().with_message("review this"))
//!     .await;
//! let prompt = runtime.dispatch_hook(event).await?;
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::approval::ApprovalStore;
use super::backend::{Backend, BackendFactory};
use super::loader::Loader;
use super::manifest::{BackendKind, SkillManifest, SkillType};
use super::sandbox::{PermissionChecker, Sandbox};
use super::skill::{Skill, SkillState};
use super::triggers::{evaluate_triggers, ActivationContext};
use super::wiring::{
    resolve_prompt, wiring_for, Finding, PromptFragment, RegisteredScanner, SecurityScanner,
    SideTables, WorkflowHandler, Wiring,
};
use crate::config::RuntimeConfig;
use crate::error::SkillError;
use crate::lifecycle::{HookEvent, HookHandler, HookResult, LifecycleManager, Phase};
use crate::mcp::{McpBackend, McpServerConfig};
use crate::process::ProcessBackend;
use crate::tools::{Tool, ToolRegistry};

/// What [`Runtime::evaluate_and_activate`] did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub activated: Vec<String>,
    pub already_active: Vec<String>,
    /// Skill name and the activation error
    pub failed: Vec<(String, String)>,
}

#[derive(Default)]
struct RuntimeState {
    loader: Loader,
    skills: BTreeMap<String, Skill>,
    active: BTreeSet<String>,
    sandboxes: HashMap<String, Arc<Sandbox>>,
    /// Tool names each active skill put in the registry
    registered_tools: HashMap<String, Vec<String>>,
    tables: SideTables,
    factories: HashMap<BackendKind, BackendFactory>,
    servers: BTreeMap<String, McpServerConfig>,
    warnings: Vec<String>,
}

/// Everything built outside the lock during activation
struct Prepared {
    sandbox: Arc<Sandbox>,
    backend: Option<Arc<dyn Backend>>,
    tools: Vec<Arc<dyn Tool>>,
    hooks: HashMap<Phase, Arc<dyn HookHandler>>,
    prompt: Option<String>,
}

pub struct Runtime {
    state: Mutex<RuntimeState>,
    tools: Arc<ToolRegistry>,
    lifecycle: Arc<LifecycleManager>,
    approvals: Arc<dyn ApprovalStore>,
    config: RuntimeConfig,
}

impl Runtime {
    /// The process backend is registered up front
    pub fn new(
        config: RuntimeConfig,
        tools: Arc<ToolRegistry>,
        approvals: Arc<dyn ApprovalStore>,
    ) -> Self {
        let mut factories = HashMap::new();
        factories.insert(
            BackendKind::Process,
            ProcessBackend::factory(config.process.clone()),
        );
        let state = RuntimeState {
            loader: Loader::from_config(&config),
            factories,
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            tools,
            lifecycle: Arc::new(LifecycleManager::new()),
            approvals,
            config,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Install (or replace) the factory for a backend kind
    pub async fn register_backend(&self, kind: BackendKind, factory: BackendFactory) {
        debug!(backend = %kind, "Registered backend factory");
        self.state.lock().await.factories.insert(kind, factory);
    }

    /// Add a built-in skill; visible after the next [`discover`](Self::discover)
    pub async fn register_builtin(&self, manifest: SkillManifest) -> Result<()> {
        self.state.lock().await.loader.register_builtin(manifest)
    }

    /// Turn external tool servers into skills and route them to the MCP backend
    ///
    /// Servers are started with `working_dir` as their current directory.
    pub async fn add_external_servers(
        &self,
        servers: BTreeMap<String, McpServerConfig>,
        working_dir: PathBuf,
    ) -> Vec<String> {
        let mut state = self.state.lock().await;
        let added = state.loader.add_external_servers(&servers);
        state.servers.extend(servers);
        let factory = McpBackend::factory(state.servers.clone(), working_dir);
        state.factories.insert(BackendKind::Mcp, factory);
        added
    }

    /// Rebuild the skill table
    ///
    /// Skills that are not inactive keep their live record so they can still
    /// be deactivated. Returns the discovery warnings.
    pub async fn discover(&self, explicit: &[String]) -> Result<Vec<String>> {
        let loader = self.state.lock().await.loader.clone();
        let explicit = explicit.to_vec();
        let discovery = tokio::task::spawn_blocking(move || loader.discover(&explicit))
            .await
            .context("skill discovery task panicked")?
            .context("skill discovery failed")?;

        let mut state = self.state.lock().await;
        let mut skills: BTreeMap<String, Skill> = discovery
            .skills
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        for (name, live) in &state.skills {
            if live.state() != SkillState::Inactive {
                debug!(skill = %name, state = %live.state(), "Keeping live skill across discovery");
                skills.insert(name.clone(), live.clone());
            }
        }

        info!(
            skills = skills.len(),
            warnings = discovery.warnings.len(),
            "Discovered skills"
        );
        state.skills = skills;
        state.warnings = discovery.warnings.clone();
        Ok(discovery.warnings)
    }

    /// Activate every inactive skill whose triggers match `ctx`
    ///
    /// A failed activation is reported and does not stop the others.
    pub async fn evaluate_and_activate(&self, ctx: &ActivationContext) -> ActivationReport {
        let candidates: Vec<Skill> = self.state.lock().await.skills.values().cloned().collect();
        let matched: Vec<(String, SkillState)> = evaluate_triggers(&candidates, ctx)
            .into_iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect();

        let mut report = ActivationReport::default();
        for (name, state) in matched {
            if state == SkillState::Active {
                report.already_active.push(name);
                continue;
            }
            match self.activate(&name).await {
                Ok(()) => report.activated.push(name),
                Err(e) => {
                    warn!(skill = %name, "Activation failed: {:#}", e);
                    report.failed.push((name, format!("{:#}", e)));
                }
            }
        }
        report
    }

    /// Activate one skill. Already active is not an error.
    pub async fn activate(&self, name: &str) -> Result<()> {
        let (skill, factory) = {
            let mut state = self.state.lock().await;
            let skill = state
                .skills
                .get_mut(name)
                .ok_or_else(|| SkillError::UnknownSkill(name.to_string()))?;
            if skill.state() == SkillState::Active {
                debug!(skill = %name, "Skill already active");
                return Ok(());
            }
            skill
                .transition_to(SkillState::Activating)
                .with_context(|| format!("failed to activate skill '{}'", name))?;
            let snapshot = skill.clone();
            let factory = snapshot
                .manifest
                .backend_kind()
                .and_then(|kind| state.factories.get(&kind).cloned());
            (snapshot, factory)
        };

        let prepared = match self.prepare(&skill, factory).await {
            Ok(prepared) => prepared,
            Err(e) => {
                mark_failed(&mut *self.state.lock().await, name);
                return Err(e.context(format!("failed to activate skill '{}'", name)));
            }
        };

        let mut state = self.state.lock().await;
        if let Err(e) = self.register(&mut state, &skill, &prepared).await {
            mark_failed(&mut state, name);
            drop(state);
            if let Some(backend) = &prepared.backend {
                if let Err(unload) = backend.unload().await {
                    warn!(skill = %name, "Unload after failed activation: {:#}", unload);
                }
            }
            return Err(e.context(format!("failed to activate skill '{}'", name)));
        }

        info!(
            skill = %name,
            source = %skill.source,
            tools = prepared.tools.len(),
            hooks = prepared.hooks.len(),
            "Skill activated"
        );
        Ok(())
    }

    /// Permission checks, backend construction and load
    async fn prepare(&self, skill: &Skill, factory: Option<BackendFactory>) -> Result<Prepared> {
        let manifest = &skill.manifest;
        let auto_approved = self.config.is_auto_approved(skill.name());
        let sandbox = Arc::new(Sandbox::new(
            manifest,
            auto_approved,
            Arc::clone(&self.approvals),
            self.config.rate_limits.clone(),
        ));

        if !auto_approved {
            for permission in &manifest.permissions {
                sandbox.check_permission(*permission)?;
            }
        }

        let prompt = if manifest.has_type(SkillType::Prompt) {
            resolve_prompt(skill)
                .await
                .context("failed to resolve prompt")?
        } else {
            None
        };

        let backend = match manifest.backend_kind() {
            None => None,
            Some(kind) => {
                let factory =
                    factory.ok_or_else(|| anyhow!("no backend registered for '{}'", kind))?;
                let backend = factory(skill).context("failed to construct backend")?;
                let checker: Arc<dyn PermissionChecker> = sandbox.clone();
                backend
                    .load(manifest, checker)
                    .await
                    .with_context(|| format!("{} backend failed to load", kind))?;
                Some(backend)
            }
        };

        let (tools, hooks) = match &backend {
            Some(backend) => (backend.tools().await, backend.hooks().await),
            None => (Vec::new(), HashMap::new()),
        };

        Ok(Prepared {
            sandbox,
            backend,
            tools,
            hooks,
            prompt,
        })
    }

    /// Tools, hooks and wiring. Leaves nothing behind on error.
    async fn register(
        &self,
        state: &mut RuntimeState,
        skill: &Skill,
        prepared: &Prepared,
    ) -> Result<()> {
        let name = skill.name();
        match state.skills.get(name) {
            Some(record) if record.state() == SkillState::Activating => {}
            _ => bail!("skill '{}' changed while it was activating", name),
        }

        let mut added: Vec<String> = Vec::new();
        for tool in &prepared.tools {
            if let Err(e) = self.tools.register(Arc::clone(tool)).await {
                self.unregister_tools(&added).await;
                return Err(e).context("tool registration failed");
            }
            added.push(tool.name().to_string());
        }

        let priority = skill.source.priority();
        let mut hooks: Vec<_> = prepared.hooks.iter().collect();
        hooks.sort_by_key(|(phase, _)| **phase);
        for (phase, handler) in hooks {
            self.lifecycle
                .register(*phase, name, priority, Arc::clone(handler));
        }

        let wired = {
            let mut wiring = Wiring {
                skill: name,
                priority,
                prompt: prepared.prompt.as_deref(),
                lifecycle: &self.lifecycle,
                tables: &mut state.tables,
            };
            skill.manifest.types.iter().try_for_each(|ty| {
                wiring_for(*ty)(&mut wiring).with_context(|| format!("{} wiring failed", ty))
            })
        };
        let finished = wired.and_then(|()| {
            let record = state
                .skills
                .get_mut(name)
                .ok_or_else(|| SkillError::UnknownSkill(name.to_string()))?;
            record.transition_to(SkillState::Active)?;
            record.backend = prepared.backend.clone();
            Ok(())
        });
        if let Err(e) = finished {
            self.rollback(state, name, &added).await;
            return Err(e);
        }

        state.active.insert(name.to_string());
        state
            .sandboxes
            .insert(name.to_string(), Arc::clone(&prepared.sandbox));
        state.registered_tools.insert(name.to_string(), added);
        Ok(())
    }

    /// Undo a partial registration, same cleanup as deactivation
    async fn rollback(&self, state: &mut RuntimeState, name: &str, tools: &[String]) {
        self.unregister_tools(tools).await;
        self.lifecycle.unregister(name);
        state.tables.purge(name);
    }

    async fn unregister_tools(&self, names: &[String]) {
        for tool in names {
            if let Err(e) = self.tools.unregister(tool).await {
                warn!("Failed to unregister tool {}: {}", tool, e);
            }
        }
    }

    /// Deactivate an active skill
    ///
    /// The skill always ends up inactive. An unload failure is still returned.
    pub async fn deactivate(&self, name: &str) -> Result<()> {
        let backend = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let skill = state
                .skills
                .get_mut(name)
                .ok_or_else(|| SkillError::UnknownSkill(name.to_string()))?;
            if skill.state() != SkillState::Active {
                bail!("skill '{}' is not active", name);
            }

            let backend = skill.backend.take();
            skill.transition_to(SkillState::Inactive)?;

            let tools = state.registered_tools.remove(name).unwrap_or_default();
            self.rollback(state, name, &tools).await;
            state.sandboxes.remove(name);
            state.active.remove(name);
            backend
        };

        if let Some(backend) = backend {
            backend
                .unload()
                .await
                .with_context(|| format!("failed to unload skill '{}'", name))?;
        }
        info!(skill = %name, "Skill deactivated");
        Ok(())
    }

    /// Fire a hook across active skills
    pub async fn dispatch_hook(&self, event: HookEvent) -> Result<Option<HookResult>> {
        self.lifecycle.dispatch(event).await
    }

    /// Start a new conversation turn: every rate-limit counter goes to zero
    pub async fn begin_turn(&self) {
        let state = self.state.lock().await;
        for sandbox in state.sandboxes.values() {
            sandbox.reset_turn_limits();
        }
        debug!(sandboxes = state.sandboxes.len(), "Reset turn limits");
    }

    /// Sandbox of an active skill
    pub async fn sandbox(&self, name: &str) -> Option<Arc<Sandbox>> {
        self.state.lock().await.sandboxes.get(name).cloned()
    }

    /// Attach the host implementation of a workflow skill
    pub async fn register_workflow_handler(&self, skill: &str, handler: Arc<dyn WorkflowHandler>) {
        self.state
            .lock()
            .await
            .tables
            .workflows
            .insert(skill.to_string(), handler);
    }

    pub async fn invoke_workflow(&self, skill: &str, input: Value) -> Result<Value> {
        let handler = {
            let state = self.state.lock().await;
            let record = state
                .skills
                .get(skill)
                .ok_or_else(|| SkillError::UnknownSkill(skill.to_string()))?;
            if !record.manifest.has_type(SkillType::Workflow) {
                bail!("skill '{}' is not a workflow", skill);
            }
            if !state.active.contains(skill) {
                bail!("skill '{}' is not active", skill);
            }
            state
                .tables
                .workflows
                .get(skill)
                .cloned()
                .ok_or_else(|| anyhow!("skill '{}' has no workflow handler", skill))?
        };
        handler
            .run(input)
            .await
            .with_context(|| format!("workflow '{}' failed", skill))
    }

    /// Attach the host implementation of a security-rule skill
    pub async fn register_scanner(&self, skill: &str, scanner: Arc<dyn SecurityScanner>) {
        self.state.lock().await.tables.scanners.insert(
            skill.to_string(),
            RegisteredScanner {
                skill: skill.to_string(),
                scanner,
            },
        );
    }

    /// Run every active security-rule scanner over one file
    pub async fn scan(&self, path: &Path, content: &str) -> Result<Vec<Finding>> {
        let scanners: Vec<RegisteredScanner> = {
            let state = self.state.lock().await;
            let mut list: Vec<(u32, RegisteredScanner)> = state
                .tables
                .scanners
                .values()
                .filter_map(|reg| {
                    let skill = state.skills.get(&reg.skill)?;
                    let live = state.active.contains(&reg.skill)
                        && skill.manifest.has_type(SkillType::SecurityRule);
                    live.then(|| (skill.source.priority(), reg.clone()))
                })
                .collect();
            list.sort_by(|a, b| (a.0, &a.1.skill).cmp(&(b.0, &b.1.skill)));
            list.into_iter().map(|(_, reg)| reg).collect()
        };

        // Scanners run concurrently; results keep priority order
        let results =
            futures::future::join_all(scanners.iter().map(|reg| reg.scanner.scan(path, content)))
                .await;

        let mut findings = Vec::new();
        for (reg, result) in scanners.iter().zip(results) {
            let found = result
                .with_context(|| format!("scanner '{}' failed on {}", reg.skill, path.display()))?;
            findings.extend(found);
        }
        Ok(findings)
    }

    /// Prompt fragments of active skills, by priority then name
    pub async fn prompt_fragments(&self) -> Vec<PromptFragment> {
        let state = self.state.lock().await;
        let mut fragments: Vec<PromptFragment> = state.tables.prompts.values().cloned().collect();
        fragments.sort_by(|a, b| (a.priority, &a.skill).cmp(&(b.priority, &b.skill)));
        fragments
    }

    /// Snapshot of the skill table, sorted by name
    pub async fn skills(&self) -> Vec<Skill> {
        self.state.lock().await.skills.values().cloned().collect()
    }

    pub async fn state(&self, name: &str) -> Option<SkillState> {
        self.state.lock().await.skills.get(name).map(Skill::state)
    }

    pub async fn active_skills(&self) -> Vec<String> {
        self.state.lock().await.active.iter().cloned().collect()
    }

    /// Warnings from the last discovery
    pub async fn warnings(&self) -> Vec<String> {
        self.state.lock().await.warnings.clone()
    }
}

/// Activating -> Error -> Inactive
fn mark_failed(state: &mut RuntimeState, name: &str) {
    let Some(skill) = state.skills.get_mut(name) else {
        return;
    };
    for to in [SkillState::Error, SkillState::Inactive] {
        if let Err(e) = skill.transition_to(to) {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::HookData;
    use crate::skills::{
        ApprovalScope, MemoryApprovalStore, Permission, Resource, Severity, SkillSource,
    };
    use crate::tools::{ToolContext, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const SCRIPT: &str = "implementation:\n  backend: script\n  entrypoint: main.star\n";

    struct NamedTool(String);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            &self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(self.0.clone())
        }
    }

    struct NoopHook;

    #[async_trait]
    impl HookHandler for NoopHook {
        async fn handle(&self, _event: &HookEvent) -> Result<HookResult> {
            Ok(HookResult::default())
        }
    }

    /// Holds `load` until released
    #[derive(Default)]
    struct LoadGate {
        entered: Notify,
        release: Notify,
    }

    #[derive(Default)]
    struct FakeBackend {
        tools: Vec<&'static str>,
        hooks: Vec<Phase>,
        fail_unload: bool,
        gate: Option<Arc<LoadGate>>,
        loads: AtomicUsize,
        unloads: AtomicUsize,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn load(
            &self,
            _manifest: &SkillManifest,
            _checker: Arc<dyn PermissionChecker>,
        ) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            Ok(())
        }

        async fn tools(&self) -> Vec<Arc<dyn Tool>> {
            self.tools
                .iter()
                .map(|n| Arc::new(NamedTool(n.to_string())) as Arc<dyn Tool>)
                .collect()
        }

        async fn hooks(&self) -> HashMap<Phase, Arc<dyn HookHandler>> {
            self.hooks
                .iter()
                .map(|p| (*p, Arc::new(NoopHook) as Arc<dyn HookHandler>))
                .collect()
        }

        async fn unload(&self) -> Result<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_unload {
                bail!("helper refused to stop");
            }
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        runtime: Runtime,
        approvals: Arc<MemoryApprovalStore>,
    }

    fn fixture(configure: impl FnOnce(&mut RuntimeConfig)) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig {
            user_skills_dir: Some(temp.path().join("user")),
            project_skills_dir: Some(temp.path().join("project")),
            ..Default::default()
        };
        configure(&mut config);
        let approvals = Arc::new(MemoryApprovalStore::new());
        let runtime = Runtime::new(config, Arc::new(ToolRegistry::new()), approvals.clone());
        Fixture {
            _temp: temp,
            runtime,
            approvals,
        }
    }

    fn manifest(name: &str, types: &str, extra: &str) -> SkillManifest {
        SkillManifest::from_yaml(&format!(
            "name: {}\nversion: 1.0.0\ndescription: test skill\ntypes: [{}]\n{}",
            name, types, extra
        ))
        .unwrap()
    }

    async fn use_backend(runtime: &Runtime, backend: Arc<FakeBackend>) {
        runtime
            .register_backend(
                BackendKind::Script,
                Arc::new(move |_: &Skill| Ok(backend.clone() as Arc<dyn Backend>)),
            )
            .await;
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let f = fixture(|_| {});
        let backend = Arc::new(FakeBackend {
            tools: vec!["fmt_run"],
            hooks: vec![Phase::AfterResponse],
            ..Default::default()
        });
        use_backend(&f.runtime, backend.clone()).await;
        f.runtime
            .register_builtin(manifest("fmt", "tool, transform", SCRIPT))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        assert_eq!(f.runtime.state("fmt").await, Some(SkillState::Inactive));

        f.runtime.activate("fmt").await.unwrap();
        assert_eq!(f.runtime.state("fmt").await, Some(SkillState::Active));
        assert!(f.runtime.tools().contains("fmt_run").await);
        assert_eq!(
            f.runtime.lifecycle().skills_for(Phase::AfterResponse),
            vec!["fmt"]
        );
        assert_eq!(f.runtime.active_skills().await, vec!["fmt"]);

        // Idempotent
        f.runtime.activate("fmt").await.unwrap();
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);

        f.runtime.deactivate("fmt").await.unwrap();
        assert_eq!(f.runtime.state("fmt").await, Some(SkillState::Inactive));
        assert!(!f.runtime.tools().contains("fmt_run").await);
        assert!(f.runtime.lifecycle().skills_for(Phase::AfterResponse).is_empty());
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 1);

        assert!(f.runtime.deactivate("fmt").await.is_err());
    }

    #[tokio::test]
    async fn test_tool_collision_rolls_back() {
        let f = fixture(|_| {});
        f.runtime
            .tools()
            .register(Arc::new(NamedTool("taken".to_string())))
            .await
            .unwrap();
        let backend = Arc::new(FakeBackend {
            tools: vec!["first", "taken"],
            hooks: vec![Phase::BeforeToolCall],
            ..Default::default()
        });
        use_backend(&f.runtime, backend.clone()).await;
        f.runtime
            .register_builtin(manifest("clash", "tool", SCRIPT))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();

        let err = f.runtime.activate("clash").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SkillError>(),
            Some(SkillError::ToolConflict(name)) if name == "taken"
        ));
        assert_eq!(f.runtime.state("clash").await, Some(SkillState::Inactive));
        assert!(!f.runtime.tools().contains("first").await);
        assert!(f.runtime.tools().contains("taken").await);
        assert!(f.runtime.lifecycle().skills_for(Phase::BeforeToolCall).is_empty());
        assert!(f.runtime.active_skills().await.is_empty());
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_is_free_while_backend_loads() {
        let f = fixture(|_| {});
        let gate = Arc::new(LoadGate::default());
        let slow = Arc::new(FakeBackend {
            tools: vec!["slow_tool"],
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let fast = Arc::new(FakeBackend {
            tools: vec!["fast_tool"],
            ..Default::default()
        });
        f.runtime
            .register_backend(
                BackendKind::Script,
                Arc::new(move |skill: &Skill| {
                    let backend = if skill.name() == "slow" {
                        slow.clone()
                    } else {
                        fast.clone()
                    };
                    Ok(backend as Arc<dyn Backend>)
                }),
            )
            .await;
        for name in ["slow", "fast"] {
            f.runtime
                .register_builtin(manifest(name, "tool", SCRIPT))
                .await
                .unwrap();
        }
        f.runtime.discover(&[]).await.unwrap();

        let queries = async {
            gate.entered.notified().await;
            let limit = Duration::from_secs(2);
            assert_eq!(
                timeout(limit, f.runtime.state("slow")).await.unwrap(),
                Some(SkillState::Activating)
            );
            assert_eq!(timeout(limit, f.runtime.skills()).await.unwrap().len(), 2);
            timeout(limit, f.runtime.activate("fast"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(f.runtime.active_skills().await, vec!["fast"]);
            gate.release.notify_one();
        };
        let (activated, ()) = tokio::join!(f.runtime.activate("slow"), queries);
        activated.unwrap();

        assert_eq!(f.runtime.active_skills().await, vec!["fast", "slow"]);
        assert!(f.runtime.tools().contains("slow_tool").await);
    }

    #[tokio::test]
    async fn test_rollback_purges_side_tables() {
        let f = fixture(|_| {});
        f.runtime
            .tools()
            .register(Arc::new(NamedTool("half_tool".to_string())))
            .await
            .unwrap();
        f.runtime
            .lifecycle()
            .register(Phase::AfterResponse, "half", 10, Arc::new(NoopHook));

        let mut state = f.runtime.state.lock().await;
        state.tables.prompts.insert(
            "half".to_string(),
            PromptFragment {
                skill: "half".to_string(),
                priority: 10,
                content: "Be brief.".to_string(),
            },
        );
        state
            .tables
            .workflows
            .insert("half".to_string(), Arc::new(Echo) as Arc<dyn WorkflowHandler>);

        f.runtime
            .rollback(&mut state, "half", &["half_tool".to_string()])
            .await;
        assert!(state.tables.prompts.is_empty());
        assert!(state.tables.workflows.is_empty());
        drop(state);

        assert!(!f.runtime.tools().contains("half_tool").await);
        assert!(f.runtime.lifecycle().skills_for(Phase::AfterResponse).is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_is_unconditional() {
        let f = fixture(|_| {});
        let backend = Arc::new(FakeBackend {
            tools: vec!["stuck_tool"],
            fail_unload: true,
            ..Default::default()
        });
        use_backend(&f.runtime, backend).await;
        f.runtime
            .register_builtin(manifest("stuck", "tool", SCRIPT))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime.activate("stuck").await.unwrap();

        let err = f.runtime.deactivate("stuck").await.unwrap_err();
        assert!(format!("{:#}", err).contains("helper refused to stop"));
        assert_eq!(f.runtime.state("stuck").await, Some(SkillState::Inactive));
        assert!(f.runtime.active_skills().await.is_empty());
        assert!(!f.runtime.tools().contains("stuck_tool").await);
    }

    #[tokio::test]
    async fn test_unapproved_permission_blocks_activation() {
        let f = fixture(|_| {});
        let backend = Arc::new(FakeBackend::default());
        use_backend(&f.runtime, backend.clone()).await;
        let extra = format!("permissions: [\"net:fetch\"]\n{}", SCRIPT);
        f.runtime
            .register_builtin(manifest("fetcher", "tool", &extra))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();

        let err = f.runtime.activate("fetcher").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SkillError>(),
            Some(SkillError::PermissionNotApproved { .. })
        ));
        assert_eq!(f.runtime.state("fetcher").await, Some(SkillState::Inactive));
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);

        f.approvals
            .approve("fetcher", Permission::NetFetch, ApprovalScope::Always)
            .unwrap();
        f.runtime.activate("fetcher").await.unwrap();
        assert_eq!(f.runtime.state("fetcher").await, Some(SkillState::Active));
    }

    #[tokio::test]
    async fn test_auto_approved_skips_store() {
        let f = fixture(|c| {
            c.auto_approve.insert("fetcher".to_string());
        });
        use_backend(&f.runtime, Arc::new(FakeBackend::default())).await;
        let extra = format!("permissions: [\"net:fetch\"]\n{}", SCRIPT);
        f.runtime
            .register_builtin(manifest("fetcher", "tool", &extra))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime.activate("fetcher").await.unwrap();
        assert!(f.runtime.sandbox("fetcher").await.unwrap().is_auto_approved());
    }

    #[tokio::test]
    async fn test_missing_backend_factory() {
        let f = fixture(|_| {});
        f.runtime
            .register_builtin(manifest("orphan", "tool", SCRIPT))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        let err = f.runtime.activate("orphan").await.unwrap_err();
        assert!(format!("{:#}", err).contains("no backend registered for 'script'"));
        assert_eq!(f.runtime.state("orphan").await, Some(SkillState::Inactive));
    }

    #[tokio::test]
    async fn test_prompt_skill_injects_system_prompt() {
        let f = fixture(|_| {});
        f.runtime
            .register_builtin(manifest(
                "tabs",
                "prompt",
                "prompt:\n  system_prompt_file: Indent with tabs.\n",
            ))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime.activate("tabs").await.unwrap();

        let fragments = f.runtime.prompt_fragments().await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].content, "Indent with tabs.");
        assert_eq!(fragments[0].priority, SkillSource::Builtin.priority());

        let mut data = HookData::new();
        data.insert("system_prompt".to_string(), json!("Base."));
        let result = f
            .runtime
            .dispatch_hook(HookEvent::new(Phase::BeforePromptBuild, data))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result.modified.unwrap()["system_prompt"],
            "Base.\n\nIndent with tabs."
        );

        f.runtime.deactivate("tabs").await.unwrap();
        assert!(f.runtime.prompt_fragments().await.is_empty());
        let none = f
            .runtime
            .dispatch_hook(HookEvent::new(Phase::BeforePromptBuild, HookData::new()))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_evaluate_and_activate() {
        let f = fixture(|_| {});
        f.runtime
            .register_builtin(manifest(
                "ship",
                "prompt",
                "triggers:\n  keywords: [deploy]\n",
            ))
            .await
            .unwrap();
        f.runtime
            .register_builtin(manifest("quiet", "prompt", ""))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();

        let ctx = ActivationContext::new().with_message("please Deploy now");
        let report = f.runtime.evaluate_and_activate(&ctx).await;
        assert_eq!(report.activated, vec!["ship"]);
        assert!(report.failed.is_empty());

        let report = f.runtime.evaluate_and_activate(&ctx).await;
        assert!(report.activated.is_empty());
        assert_eq!(report.already_active, vec!["ship"]);
        assert_eq!(f.runtime.state("quiet").await, Some(SkillState::Inactive));
    }

    #[tokio::test]
    async fn test_discover_keeps_active_skills() {
        let f = fixture(|_| {});
        f.runtime
            .register_builtin(manifest("keep", "prompt", ""))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime.activate("keep").await.unwrap();

        f.runtime.discover(&["keep".to_string()]).await.unwrap();
        assert_eq!(f.runtime.state("keep").await, Some(SkillState::Active));
        f.runtime.deactivate("keep").await.unwrap();

        f.runtime.discover(&["keep".to_string()]).await.unwrap();
        let skills = f.runtime.skills().await;
        assert_eq!(skills[0].source, SkillSource::Explicit);

        let err = f.runtime.discover(&["ghost".to_string()]).await.unwrap_err();
        assert!(format!("{:#}", err).contains("ghost"));
    }

    #[tokio::test]
    async fn test_discover_reports_warnings() {
        let f = fixture(|_| {});
        f.runtime
            .register_builtin(manifest(
                "extras",
                "prompt",
                "dependencies:\n  - name: helper\n    optional: true\n",
            ))
            .await
            .unwrap();
        let warnings = f.runtime.discover(&[]).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(f.runtime.warnings().await, warnings);
    }

    struct Echo;

    #[async_trait]
    impl WorkflowHandler for Echo {
        async fn run(&self, input: Value) -> Result<Value> {
            Ok(json!({"echo": input}))
        }
    }

    #[tokio::test]
    async fn test_workflow_invocation() {
        let f = fixture(|_| {});
        use_backend(&f.runtime, Arc::new(FakeBackend::default())).await;
        f.runtime
            .register_builtin(manifest("release", "workflow", SCRIPT))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime
            .register_workflow_handler("release", Arc::new(Echo))
            .await;

        assert!(f.runtime.invoke_workflow("release", json!(1)).await.is_err());

        f.runtime.activate("release").await.unwrap();
        let out = f.runtime.invoke_workflow("release", json!(1)).await.unwrap();
        assert_eq!(out, json!({"echo": 1}));

        // Deactivation purges the handler
        f.runtime.deactivate("release").await.unwrap();
        f.runtime.activate("release").await.unwrap();
        let err = f.runtime.invoke_workflow("release", json!(1)).await.unwrap_err();
        assert!(err.to_string().contains("no workflow handler"));
    }

    struct NoUnwrap;

    #[async_trait]
    impl SecurityScanner for NoUnwrap {
        async fn scan(&self, _path: &Path, content: &str) -> Result<Vec<Finding>> {
            Ok(content
                .lines()
                .enumerate()
                .filter(|(_, l)| l.contains(".unwrap()"))
                .map(|(i, _)| Finding {
                    skill: "no-unwrap".to_string(),
                    rule: "unwrap".to_string(),
                    severity: Severity::Warning,
                    message: "avoid unwrap".to_string(),
                    line: Some(i + 1),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_scan_uses_active_scanners() {
        let f = fixture(|_| {});
        use_backend(&f.runtime, Arc::new(FakeBackend::default())).await;
        f.runtime
            .register_builtin(manifest("no-unwrap", "security-rule", SCRIPT))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime.register_scanner("no-unwrap", Arc::new(NoUnwrap)).await;

        let source = "fn main() {\n    x.unwrap();\n}\n";
        let path = Path::new("src/main.rs");
        assert!(f.runtime.scan(path, source).await.unwrap().is_empty());

        f.runtime.activate("no-unwrap").await.unwrap();
        let findings = f.runtime.scan(path, source).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, Some(2));
    }

    #[tokio::test]
    async fn test_begin_turn_resets_rate_limits() {
        let f = fixture(|_| {});
        f.runtime
            .register_builtin(manifest("chatty", "prompt", ""))
            .await
            .unwrap();
        f.runtime.discover(&[]).await.unwrap();
        f.runtime.activate("chatty").await.unwrap();

        let sandbox = f.runtime.sandbox("chatty").await.unwrap();
        for _ in 0..10 {
            sandbox.check_rate_limit(Resource::LlmCall).unwrap();
        }
        assert!(sandbox.check_rate_limit(Resource::LlmCall).is_err());

        f.runtime.begin_turn().await;
        assert!(sandbox.check_rate_limit(Resource::LlmCall).is_ok());
    }
}
