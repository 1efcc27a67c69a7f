//! External tool-server configuration
//!
//! Parses `.mcp.json` files. Supports two server types:
//! - Local (stdio): spawns a local process, we act as MCP client
//! - Remote (url): handled by the model provider, never connected to here

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// MCP configuration from .mcp.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfigRaw>,
}

/// Raw server configuration from JSON
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfigRaw {
    /// Local server (spawns process, stdio transport)
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server
    Remote {
        #[serde(rename = "type")]
        server_type: String,
        url: String,
        #[serde(default)]
        authorization_token: Option<String>,
    },
}

/// Resolved server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpServerConfig {
    /// Local server - we spawn and manage the process
    Local {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    /// Remote server - reached by the provider, not by us
    Remote {
        url: String,
        authorization_token: Option<String>,
    },
}

impl McpServerConfig {
    pub fn is_local(&self) -> bool {
        matches!(self, McpServerConfig::Local { .. })
    }

    pub fn transport_type(&self) -> &'static str {
        match self {
            McpServerConfig::Local { .. } => "stdio",
            McpServerConfig::Remote { .. } => "remote",
        }
    }
}

impl McpConfig {
    /// Load config from .mcp.json in project root
    pub async fn load(working_dir: &Path) -> Result<Self> {
        let config_path = working_dir.join(".mcp.json");

        if !config_path.exists() {
            tracing::debug!("No .mcp.json found at {:?}", config_path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {:?}", config_path))?;

        let config: McpConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", config_path))?;

        tracing::info!(
            "Loaded MCP config with {} servers from {:?}",
            config.mcp_servers.len(),
            config_path
        );

        Ok(config)
    }

    /// Resolved server configurations, sorted by name, with `${VAR}` expanded
    pub fn servers(&self) -> BTreeMap<String, McpServerConfig> {
        self.mcp_servers
            .iter()
            .filter_map(|(name, raw)| {
                let config = match raw {
                    McpServerConfigRaw::Local { command, args, env } => McpServerConfig::Local {
                        command: command.clone(),
                        args: args.clone(),
                        env: env
                            .iter()
                            .map(|(k, v)| (k.clone(), expand_env_var(v)))
                            .collect(),
                    },
                    McpServerConfigRaw::Remote {
                        server_type,
                        url,
                        authorization_token,
                    } => {
                        if server_type != "url" {
                            tracing::warn!(
                                "Skipping MCP server '{}' with unsupported type '{}'",
                                name,
                                server_type
                            );
                            return None;
                        }
                        McpServerConfig::Remote {
                            url: url.clone(),
                            authorization_token: authorization_token.as_deref().map(expand_env_var),
                        }
                    }
                };
                Some((name.clone(), config))
            })
            .collect()
    }
}

/// Expand ${VAR} references from the environment; unset variables become empty
fn expand_env_var(s: &str) -> String {
    let mut result = s.to_string();

    while let Some(start) = result.find("${") {
        let Some(end_offset) = result[start..].find('}') else {
            break;
        };
        let end = start + end_offset;
        let var_name = &result[start + 2..end];
        let value = std::env::var(var_name).unwrap_or_else(|_| {
            tracing::warn!("Environment variable {} is not set", var_name);
            String::new()
        });
        result.replace_range(start..end + 1, &value);
    }

    result
}
