//! Knowledge Engine Server — unified facade over the core, MCP, and HTTP crates.

pub use knowledge_engine_core as core;
pub use knowledge_engine_http as http;
pub use knowledge_engine_mcp as mcp;
