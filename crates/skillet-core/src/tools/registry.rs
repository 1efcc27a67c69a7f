//! Tool registry shared by the host and every active skill
//!
//! Names are unique: registering a name that is already taken fails instead of
//! replacing the existing tool, so one skill can never shadow another.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::SkillError;

/// Default tool execution timeout (2 minutes)
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Tool execution result
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a success result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create a structured error with explicit code.
    pub fn error_with_code(code: &str, msg: impl std::fmt::Display) -> Self {
        let envelope = serde_json::json!({
            "ok": false,
            "error": {
                "code": code,
                "message": msg.to_string()
            }
        });
        Self {
            output: envelope.to_string(),
            is_error: true,
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid_parameters(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", msg)
    }

    /// Create an error result, classifying the message into a code
    pub fn error(msg: impl std::fmt::Display) -> Self {
        let message = msg.to_string();
        let code = classify_error_code(&message);
        Self::error_with_code(code, message)
    }
}

/// Parse tool parameters, returning a ToolResult error on failure
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::invalid_parameters(format!("Invalid parameters: {}", e)))
}

fn classify_error_code(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid parameters") || lower.contains("missing field") {
        "invalid_parameters"
    } else if lower.contains("timed out") {
        "timeout"
    } else if lower.contains("not running") || lower.contains("closed stdout") {
        "backend_unavailable"
    } else if lower.contains("permission") || lower.contains("rate limit") {
        "permission_denied"
    } else {
        "tool_error"
    }
}

/// Context for tool execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    /// Optional per-call timeout override
    pub timeout: Option<Duration>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
        }
    }
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Trait for tool implementations
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (id)
    fn name(&self) -> &str;

    /// Tool description for AI
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value;

    /// Execute the tool
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// Tool description handed to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Default timeout for tool execution
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Register a tool; fails if the name is taken
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), SkillError> {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            return Err(SkillError::ToolConflict(name));
        }
        tracing::debug!("Registered tool: {}", name);
        tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool by name
    pub async fn unregister(&self, name: &str) -> Result<(), SkillError> {
        let mut tools = self.tools.write().await;
        match tools.remove(name) {
            Some(_) => {
                tracing::debug!("Unregistered tool: {}", name);
                Ok(())
            }
            None => Err(SkillError::ToolNotFound(name.to_string())),
        }
    }

    /// Get a tool by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of every registered tool, sorted by name
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name with a timeout
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Option<ToolResult> {
        let tool = self.get(name).await?;
        let timeout = ctx.timeout.unwrap_or(self.default_timeout);

        let result = match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tool execution timed out"
                );
                ToolResult::error_with_code(
                    "timeout",
                    format!("Tool '{}' timed out after {:?}", name, timeout),
                )
            }
        };
        Some(result)
    }
}
