//! Skills synthesised from external MCP servers
//!
//! Each configured server becomes one skill whose tools are the server's
//! tools, exposed as `mcp__<server>_<tool>`. These skills have no hooks.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::client::McpClient;
use super::config::McpServerConfig;
use super::protocol::McpToolDef;
use crate::lifecycle::{HookHandler, Phase};
use crate::skills::{Backend, BackendFactory, PermissionChecker, Resource, Skill, SkillManifest};
use crate::tools::{Tool, ToolContext, ToolResult};

/// Wraps an MCP tool as our Tool trait
pub struct McpTool {
    tool_name: String,
    full_name: String,
    definition: McpToolDef,
    client: Weak<McpClient>,
}

impl McpTool {
    fn new(server_name: &str, definition: McpToolDef, client: &Arc<McpClient>) -> Self {
        Self {
            tool_name: definition.name.clone(),
            full_name: format!("mcp__{}_{}", server_name, definition.name),
            definition,
            client: Arc::downgrade(client),
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn description(&self) -> &str {
        self.definition.description.as_deref().unwrap_or("MCP tool")
    }

    fn parameters_schema(&self) -> Value {
        self.definition.input_schema.clone()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let Some(client) = self.client.upgrade() else {
            return ToolResult::error("MCP server is not connected");
        };
        match client.call_tool(&self.tool_name, params).await {
            Ok(result) => ToolResult {
                output: result.text(),
                is_error: result.is_error,
            },
            Err(e) => ToolResult {
                output: format!("MCP error: {:#}", e),
                is_error: true,
            },
        }
    }
}

/// Backend for `implementation.backend: mcp`
pub struct McpBackend {
    server: String,
    config: McpServerConfig,
    working_dir: PathBuf,
    client: Mutex<Option<Arc<McpClient>>>,
    tools: Mutex<Vec<Arc<dyn Tool>>>,
}

impl McpBackend {
    pub fn new(server: &str, config: McpServerConfig, working_dir: PathBuf) -> Self {
        Self {
            server: server.to_string(),
            config,
            working_dir,
            client: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        }
    }

    /// Factory resolving a skill's entrypoint to one of `servers`
    pub fn factory(
        servers: BTreeMap<String, McpServerConfig>,
        working_dir: PathBuf,
    ) -> BackendFactory {
        Arc::new(move |skill: &Skill| {
            let server = skill
                .manifest
                .implementation
                .as_ref()
                .and_then(|i| i.entrypoint.as_deref())
                .ok_or_else(|| anyhow!("skill '{}' names no MCP server", skill.name()))?;
            let config = servers
                .get(server)
                .cloned()
                .ok_or_else(|| anyhow!("no MCP server '{}' is configured", server))?;
            Ok(Arc::new(McpBackend::new(server, config, working_dir.clone())) as Arc<dyn Backend>)
        })
    }

    pub async fn is_connected(&self) -> bool {
        match self.client.lock().await.as_ref() {
            Some(client) => client.is_alive().await,
            None => false,
        }
    }
}

#[async_trait]
impl Backend for McpBackend {
    async fn load(
        &self,
        manifest: &SkillManifest,
        checker: Arc<dyn PermissionChecker>,
    ) -> Result<()> {
        let McpServerConfig::Local { command, args, env } = &self.config else {
            bail!(
                "MCP server '{}' is remote; remote servers are reached by the provider",
                self.server
            );
        };
        checker.check_rate_limit(Resource::ShellExec)?;

        let mut slot = self.client.lock().await;
        if slot.is_some() {
            bail!("skill '{}' is already loaded", manifest.name);
        }

        let client = Arc::new(
            McpClient::connect(&self.server, command, args, env, &self.working_dir).await?,
        );
        let tools = match connect_tools(&self.server, &client).await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        };

        tracing::info!(
            skill = %manifest.name,
            server = %self.server,
            tools = tools.len(),
            "MCP server connected"
        );
        *self.tools.lock().await = tools;
        *slot = Some(client);
        Ok(())
    }

    async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.lock().await.clone()
    }

    async fn hooks(&self) -> HashMap<Phase, Arc<dyn HookHandler>> {
        HashMap::new()
    }

    async fn unload(&self) -> Result<()> {
        self.tools.lock().await.clear();
        let Some(client) = self.client.lock().await.take() else {
            return Ok(());
        };
        client
            .close()
            .await
            .with_context(|| format!("failed to stop MCP server '{}'", self.server))
    }
}

async fn connect_tools(server: &str, client: &Arc<McpClient>) -> Result<Vec<Arc<dyn Tool>>> {
    client
        .initialize()
        .await
        .with_context(|| format!("MCP server '{}' failed to initialize", server))?;
    let defs = client.list_tools().await?;
    Ok(defs
        .into_iter()
        .map(|def| Arc::new(McpTool::new(server, def, client)) as Arc<dyn Tool>)
        .collect())
}
