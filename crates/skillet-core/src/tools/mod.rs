//! Tool registry and the tool contract skills implement

pub mod registry;

pub use registry::{parse_params, Tool, ToolContext, ToolDefinition, ToolRegistry, ToolResult};
