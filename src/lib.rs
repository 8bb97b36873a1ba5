//! Toolstream drives streaming LLM chat turns in which the model can call
//! tools hosted on remote MCP servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation model, stream segmentation, tool-call
//!   directive parsing, credentials, and the round orchestrator that ties a
//!   turn together.
//! - [`mcp`] provides the tool catalog, the MCP client and its HTTP
//!   transports.
//! - [`api`] defines the chat payloads sent to providers.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
