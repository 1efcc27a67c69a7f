//! Out-of-process skill backend
//!
//! Runs a skill's entrypoint as a child process and talks to it with
//! newline-delimited JSON-RPC over stdin/stdout. Methods:
//!
//! - `initialize` `{name, version}` → `{tools: [{name, description, input_schema}], hooks: [phase]}`
//! - `tool/execute` `{name, input}` → `{content, is_error}`
//! - `hook/handle` `{phase, data}` → `{modified, cancel}`
//! - `shutdown`
//!
//! An unexpected exit is not fatal: the crash monitor respawns the process
//! with exponential backoff (see [`monitor`]).

mod monitor;
mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProcessConfig;
use crate::error::SkillError;
use crate::lifecycle::{HookData, HookEvent, HookHandler, HookResult, Phase};
use crate::skills::{Backend, BackendFactory, PermissionChecker, Resource, Skill, SkillManifest};
use crate::tools::{Tool, ToolContext, ToolResult};

use session::{Launch, Session};

/// Upper bound on waiting for a killed child to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
struct Identity {
    name: String,
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct InitializeResult {
    #[serde(default)]
    tools: Vec<ToolDecl>,
    #[serde(default)]
    hooks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ToolDecl {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_schema", alias = "inputSchema")]
    input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Serialize)]
struct ExecuteParams<'a> {
    name: &'a str,
    input: Value,
}

#[derive(Debug, Deserialize)]
struct ExecuteResult {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Serialize)]
struct HookParams<'a> {
    phase: Phase,
    data: &'a HookData,
}

struct Inner {
    session: Option<Session>,
    launch: Option<Launch>,
    identity: Identity,
    tools: Vec<Arc<dyn Tool>>,
    hooks: HashMap<Phase, Arc<dyn HookHandler>>,
}

/// State shared between the backend, its wrappers, and its monitors
pub(crate) struct Shared {
    skill: String,
    config: ProcessConfig,
    inner: Mutex<Inner>,
    next_id: AtomicI64,
    generation: AtomicU64,
    monitors: AtomicUsize,
    stop: parking_lot::Mutex<CancellationToken>,
}

impl Shared {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn initialize(
        &self,
        session: &mut Session,
        identity: &Identity,
    ) -> Result<InitializeResult> {
        let result = session
            .request(
                self.next_id(),
                "initialize",
                Some(serde_json::to_value(identity)?),
                self.config.call_timeout(),
            )
            .await?;
        if result.is_null() {
            return Ok(InitializeResult::default());
        }
        serde_json::from_value(result).context("invalid initialize result")
    }

    /// One request/response exchange. Holds the backend lock for its duration.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Instant>,
    ) -> Result<Value> {
        let mut timeout = self.config.call_timeout();
        if let Some(deadline) = deadline {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }

        let mut inner = self.inner.lock().await;
        let session = inner.session.as_mut().ok_or(SkillError::NotRunning)?;
        session
            .request(self.next_id(), method, params, timeout)
            .await
            .with_context(|| format!("skill '{}' {} failed", self.skill, method))
    }
}

/// Backend for `implementation.backend: process`
pub struct ProcessBackend {
    shared: Arc<Shared>,
    dir: Option<PathBuf>,
}

impl ProcessBackend {
    pub fn new(skill: &str, dir: Option<PathBuf>, config: ProcessConfig) -> Self {
        let shared = Shared {
            skill: skill.to_string(),
            config,
            inner: Mutex::new(Inner {
                session: None,
                launch: None,
                identity: Identity {
                    name: skill.to_string(),
                    version: String::new(),
                },
                tools: Vec::new(),
                hooks: HashMap::new(),
            }),
            next_id: AtomicI64::new(1),
            generation: AtomicU64::new(0),
            monitors: AtomicUsize::new(0),
            stop: parking_lot::Mutex::new(CancellationToken::new()),
        };
        Self {
            shared: Arc::new(shared),
            dir,
        }
    }

    /// Factory registered for [`BackendKind::Process`](crate::skills::BackendKind)
    pub fn factory(config: ProcessConfig) -> BackendFactory {
        Arc::new(move |skill: &Skill| {
            Ok(Arc::new(ProcessBackend::new(
                skill.name(),
                skill.dir.clone(),
                config.clone(),
            )) as Arc<dyn Backend>)
        })
    }

    /// Restart epoch; bumped by every load and every successful restart
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Crash monitors currently running
    pub fn monitor_count(&self) -> usize {
        self.shared.monitors.load(Ordering::SeqCst)
    }

    /// PID of the attached process, if any
    pub async fn child_id(&self) -> Option<u32> {
        self.shared
            .inner
            .lock()
            .await
            .session
            .as_ref()
            .and_then(|s| s.pid())
    }

    pub async fn is_running(&self) -> bool {
        self.shared.inner.lock().await.session.is_some()
    }

    /// Raw request, for callers that speak the protocol directly
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Instant>,
    ) -> Result<Value> {
        self.shared.call(method, params, deadline).await
    }

    fn launch_for(&self, manifest: &SkillManifest) -> Result<Launch> {
        let Some(imp) = &manifest.implementation else {
            bail!("skill '{}' has no implementation", manifest.name);
        };
        let entrypoint = imp.entrypoint.as_deref().unwrap_or_default();
        if entrypoint.trim().is_empty() {
            bail!("skill '{}' has no entrypoint", manifest.name);
        }
        if !Path::new(entrypoint).is_absolute() {
            bail!(
                "skill '{}' entrypoint must be an absolute path: {}",
                manifest.name,
                entrypoint
            );
        }
        Ok(Launch {
            skill: manifest.name.clone(),
            command: entrypoint.to_string(),
            args: imp.args.clone(),
            env: imp.env.clone(),
            cwd: self.dir.clone(),
        })
    }

    fn wrap(
        &self,
        init: InitializeResult,
    ) -> (Vec<Arc<dyn Tool>>, HashMap<Phase, Arc<dyn HookHandler>>) {
        let tools = init
            .tools
            .into_iter()
            .map(|decl| {
                Arc::new(ProcessTool {
                    name: decl.name,
                    description: decl.description,
                    schema: decl.input_schema,
                    shared: Arc::downgrade(&self.shared),
                }) as Arc<dyn Tool>
            })
            .collect();

        let mut hooks: HashMap<Phase, Arc<dyn HookHandler>> = HashMap::new();
        for name in init.hooks {
            match Phase::parse(&name) {
                Some(phase) => {
                    hooks.insert(
                        phase,
                        Arc::new(ProcessHook {
                            shared: Arc::downgrade(&self.shared),
                        }),
                    );
                }
                None => {
                    warn!(skill = %self.shared.skill, hook = %name, "Ignoring unknown hook phase")
                }
            }
        }
        (tools, hooks)
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn load(
        &self,
        manifest: &SkillManifest,
        checker: Arc<dyn PermissionChecker>,
    ) -> Result<()> {
        let launch = self.launch_for(manifest)?;
        checker.check_rate_limit(Resource::ShellExec)?;

        let mut inner = self.shared.inner.lock().await;
        if inner.session.is_some() {
            bail!("skill '{}' is already loaded", manifest.name);
        }

        // Bump before the new stop token exists so older monitors see a stale tag
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = CancellationToken::new();
        *self.shared.stop.lock() = stop.clone();

        let identity = Identity {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
        };
        let (mut session, handle) = session::spawn(&launch)
            .with_context(|| format!("failed to start skill '{}'", manifest.name))?;

        let init = match self.shared.initialize(&mut session, &identity).await {
            Ok(init) => init,
            Err(e) => {
                handle.reap().await;
                return Err(
                    e.context(format!("skill '{}' failed to initialize", manifest.name))
                );
            }
        };

        let (tools, hooks) = self.wrap(init);
        info!(
            skill = %manifest.name,
            generation,
            pid = ?session.pid(),
            tools = tools.len(),
            hooks = hooks.len(),
            "Skill process loaded"
        );

        inner.session = Some(session);
        inner.launch = Some(launch);
        inner.identity = identity;
        inner.tools = tools;
        inner.hooks = hooks;
        drop(inner);

        monitor::spawn(Arc::clone(&self.shared), handle, generation, stop);
        Ok(())
    }

    async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.shared.inner.lock().await.tools.clone()
    }

    async fn hooks(&self) -> HashMap<Phase, Arc<dyn HookHandler>> {
        self.shared.inner.lock().await.hooks.clone()
    }

    async fn unload(&self) -> Result<()> {
        self.shared.stop.lock().cancel();

        let mut inner = self.shared.inner.lock().await;
        inner.tools.clear();
        inner.hooks.clear();
        inner.launch = None;
        let Some(mut session) = inner.session.take() else {
            return Ok(());
        };
        drop(inner);

        // Best effort; the process is killed either way
        let _ = session
            .request(
                self.shared.next_id(),
                "shutdown",
                None,
                self.shared.config.shutdown_timeout(),
            )
            .await;

        session
            .terminate(KILL_GRACE)
            .await
            .with_context(|| format!("failed to stop skill '{}'", self.shared.skill))?;
        info!(skill = %self.shared.skill, "Skill process unloaded");
        Ok(())
    }
}

/// Tool proxied to the helper process
struct ProcessTool {
    name: String,
    description: String,
    schema: Value,
    shared: Weak<Shared>,
}

#[async_trait]
impl Tool for ProcessTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let Some(shared) = self.shared.upgrade() else {
            return ToolResult::error(SkillError::NotRunning);
        };
        let deadline = ctx.timeout.map(|t| Instant::now() + t);
        let params = ExecuteParams {
            name: &self.name,
            input: params,
        };
        let params = match serde_json::to_value(params) {
            Ok(v) => v,
            Err(e) => return ToolResult::invalid_parameters(e),
        };

        let result = match shared.call("tool/execute", Some(params), deadline).await {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("{:#}", e)),
        };
        match serde_json::from_value::<ExecuteResult>(result) {
            Ok(ExecuteResult { content, is_error }) => {
                let output = match content {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                ToolResult { output, is_error }
            }
            Err(e) => ToolResult::error(format!("invalid tool/execute result: {}", e)),
        }
    }
}

/// Hook handler proxied to the helper process
struct ProcessHook {
    shared: Weak<Shared>,
}

#[async_trait]
impl HookHandler for ProcessHook {
    async fn handle(&self, event: &HookEvent) -> Result<HookResult> {
        let shared = self.shared.upgrade().ok_or(SkillError::NotRunning)?;
        let params = serde_json::to_value(HookParams {
            phase: event.phase,
            data: &event.data,
        })?;

        let result = tokio::select! {
            result = shared.call("hook/handle", Some(params), event.deadline) => result?,
            _ = event.cancel.cancelled() => {
                return Err(SkillError::Cancelled {
                    method: "hook/handle".to_string(),
                }
                .into());
            }
        };
        if result.is_null() {
            return Ok(HookResult::default());
        }
        serde_json::from_value(result).context("invalid hook/handle result")
    }
}
