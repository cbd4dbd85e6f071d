//! SceneCraft Providers
//!
//! Production implementations of the core service traits:
//! - [`OllamaClient`]: [`scenecraft_core::ModelService`] over the Ollama chat API
//! - [`McpCapabilityProvider`]: [`scenecraft_core::CapabilityProvider`] over
//!   an MCP server launched as a (optionally sandboxed) child process

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod mcp;
pub mod ollama;

pub use mcp::McpCapabilityProvider;
pub use ollama::OllamaClient;
