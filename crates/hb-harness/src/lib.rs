//! Harness: the JSON-RPC / MCP protocol layer and the tool execution path.
//!
//! - [`mcp`]: wire types, error codes, tool descriptors and the tool registry
//! - [`dispatcher`]: method routing, tool invocation and request logging
//! - [`provider`]: blocking client for an OpenAI-compatible local model

pub mod dispatcher;
pub mod mcp;
pub mod provider;
