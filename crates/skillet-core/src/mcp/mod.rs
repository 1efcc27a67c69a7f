//! External tool servers (Model Context Protocol)
//!
//! Local stdio servers listed in `.mcp.json` are turned into skills by the
//! loader and run through [`McpBackend`].

pub mod backend;
pub mod client;
pub mod config;
pub mod protocol;

pub use backend::{McpBackend, McpTool};
pub use client::McpClient;
pub use config::{McpConfig, McpServerConfig};
