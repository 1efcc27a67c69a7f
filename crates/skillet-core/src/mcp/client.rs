//! MCP client for local stdio servers
//!
//! Handles JSON-RPC communication with a single MCP server.
//! Uses a background receive loop to route responses to waiting requests.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::protocol::{
    ClientInfo, InitializeParams, InitializeResult, McpToolDef, ToolCallParams, ToolCallResult,
    ToolsListResult,
};
use crate::error::SkillError;
use crate::rpc::{RpcNotification, RpcRequest, RpcResponse};

const PROTOCOL_VERSION: &str = "2024-11-05";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

/// MCP client for a local server
pub struct McpClient {
    name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    next_id: AtomicI64,
    pending: Pending,
    shutdown: CancellationToken,
}

impl McpClient {
    /// Spawn the server and start the receive loop
    pub async fn connect(
        name: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: &Path,
    ) -> Result<Self> {
        info!("Spawning MCP server {}: {} {:?}", name, command, args);
        for key in env.keys() {
            debug!("  env {} (value hidden)", key);
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(working_dir)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow!(
                    "Command not found: {}. Is it installed and in PATH?",
                    command
                )
            } else {
                anyhow!("Failed to spawn {}: {}", command, e)
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("No stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("No stdout"))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let recv_pending = Arc::clone(&pending);
        let recv_shutdown = shutdown.clone();
        let recv_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = recv_shutdown.cancelled() => {
                        debug!("MCP client {} shutting down receive loop", recv_name);
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                handle_line(&recv_name, line.trim(), &recv_pending).await
                            }
                            Ok(None) | Err(_) => {
                                error!("MCP {} closed its output", recv_name);
                                break;
                            }
                        }
                    }
                }
            }
            // Fail everything still waiting
            let mut pending = recv_pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(SkillError::ProcessClosed.into()));
            }
        });

        Ok(Self {
            name: name.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            next_id: AtomicI64::new(1),
            pending,
            shutdown,
        })
    }

    /// Initialize the MCP connection (required before using tools)
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: "skillet".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let result: InitializeResult = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        info!(
            "MCP {} initialized (protocol: {})",
            self.name, result.protocol_version
        );

        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// List available tools
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let result: ToolsListResult = self.request("tools/list", None).await?;
        info!("MCP {} has {} tools", self.name, result.tools.len());
        Ok(result.tools)
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the server process is still running
    pub async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Stop the receive loop and kill the server
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        child.start_kill()?;
        child.wait().await?;
        debug!("MCP {} stopped", self.name);
        Ok(())
    }

    /// Send a request and wait for response
    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = RpcRequest::new(id, method, params).to_line()?;
        debug!("MCP {} request [{}]: {}", self.name, id, method);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.send(&line).await?;

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(SkillError::ProcessClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SkillError::Timeout {
                    method: method.to_string(),
                    timeout: REQUEST_TIMEOUT,
                }
                .into())
            }
        }
    }

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut line = serde_json::to_string(&RpcNotification::new(method, params))?;
        line.push('\n');
        debug!("MCP {} notify: {}", self.name, method);
        self.send(&line).await
    }

    async fn send(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Route one line from the server
async fn handle_line(
    server: &str,
    line: &str,
    pending: &Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>,
) {
    // Servers sometimes print logs on stdout
    if !line.starts_with('{') {
        if !line.is_empty() {
            debug!("MCP {} skipping non-JSON line: {}", server, line);
        }
        return;
    }

    let response: RpcResponse = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            error!("MCP {} sent undecodable message: {}", server, e);
            return;
        }
    };

    match response.id {
        Some(id) => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(response.into_result().map_err(anyhow::Error::from));
            }
        }
        None => {
            if let Some(method) = &response.method {
                debug!("MCP {} notification: {}", server, method);
            }
        }
    }
}
