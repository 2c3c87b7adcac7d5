//! MCP JSON-RPC transport: tool dispatch for the eight retrieval primitives
//! (spec.md §4.7), protocol version negotiation, and the stdio server loop.

use knowledge_engine_core::query_engine::QueryEngine;
use knowledge_engine_core::response::Envelope;
use knowledge_engine_core::storage::{FileFilters, FileOrder};
use serde_json::Value;
use std::io::{self, BufRead, Write as IoWrite};

const SUPPORTED_VERSIONS: &[&str] = &["2025-11-25", "2025-06-18"];
const LATEST_VERSION: &str = "2025-11-25";

fn negotiate_version(client_version: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|&&v| v == client_version)
        .copied()
        .unwrap_or(LATEST_VERSION)
}

/// Tool definitions served by `tools/list`, annotated per the MCP
/// read-only/destructive/idempotent/open-world hints. Every tool here is a
/// read-only query against the already-indexed corpus — none mutate state.
fn tool_definitions() -> Value {
    let ro = serde_json::json!({
        "readOnlyHint": true,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": false
    });

    serde_json::json!([
        {
            "name": "search_full_text",
            "annotations": ro,
            "description": "Full-text search over indexed chunks using FTS5 match syntax (quoted phrases, AND/OR/NOT, term* prefixes). Returns chunk envelopes ranked by BM25 relevance with a highlighted snippet.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "FTS5 query string" },
                    "limit": { "type": "integer", "description": "Max results (default and hard cap apply server-side)" },
                    "context": { "type": "integer", "description": "Adjacent chunks to include on either side of each hit. Default 0." }
                },
                "required": ["query"]
            }
        },
        {
            "name": "search_semantic",
            "annotations": ro,
            "description": "Embedding-similarity search over indexed chunks. Requires the semantic index to be built; falls back to an empty, non-error result if it is not yet available.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Natural-language query to embed" },
                    "top_k": { "type": "integer", "description": "Number of nearest neighbors to return" },
                    "context": { "type": "integer", "description": "Adjacent chunks to include on either side of each hit. Default 0." }
                },
                "required": ["query"]
            }
        },
        {
            "name": "search_keywords",
            "annotations": ro,
            "description": "Search files by precomputed TF-IDF keywords. Returns the first chunk of each matching file, ranked by summed keyword score.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "keywords": { "type": "array", "items": { "type": "string" }, "description": "Keywords to match" },
                    "limit": { "type": "integer", "description": "Max results" }
                },
                "required": ["keywords"]
            }
        },
        {
            "name": "list_files",
            "annotations": ro,
            "description": "List indexed files by predicate: path prefix, name glob, file type, size range, or modified-time range.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path_prefix": { "type": "string" },
                    "name_pattern": { "type": "string", "description": "Glob, e.g. '*.rs'" },
                    "file_type": { "type": "string" },
                    "size_min": { "type": "integer" },
                    "size_max": { "type": "integer" },
                    "modified_after": { "type": "number", "description": "Unix timestamp" },
                    "modified_before": { "type": "number", "description": "Unix timestamp" },
                    "order": { "type": "string", "enum": ["path_asc", "size_desc", "modified_desc"] },
                    "limit": { "type": "integer" }
                }
            }
        },
        {
            "name": "list_directories",
            "annotations": ro,
            "description": "List indexed directories with per-directory file count and total size.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "root": { "type": "string", "description": "Restrict to subtree under this path" },
                    "limit": { "type": "integer" }
                }
            }
        },
        {
            "name": "get_file_info",
            "annotations": ro,
            "description": "File-level metadata: size, mtime, content hash, chunk count, top keywords, freshness relative to disk/git.",
            "inputSchema": {
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }
        },
        {
            "name": "get_file_chunks",
            "annotations": ro,
            "description": "Retrieve a file's chunk envelopes in order, optionally restricted to an index range.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "start": { "type": "integer" },
                    "end": { "type": "integer" }
                },
                "required": ["path"]
            }
        },
        {
            "name": "get_stats",
            "annotations": ro,
            "description": "Corpus-wide statistics: total files/chunks/embeddings, size, per-extension breakdown, vector index state.",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn usize_arg(args: &Value, key: &str, default: usize) -> usize {
    args.get(key).and_then(|v| v.as_u64()).map(|n| n as usize).unwrap_or(default)
}

fn file_order_arg(args: &Value) -> FileOrder {
    match str_arg(args, "order") {
        Some("size_desc") => FileOrder::SizeDesc,
        Some("modified_desc") => FileOrder::ModifiedDesc,
        _ => FileOrder::PathAsc,
    }
}

/// Dispatch one tool call to the query engine and serialize its envelope.
pub fn handle_tool_call(engine: &QueryEngine, tool_name: &str, args: &Value) -> (String, bool) {
    let envelope: Envelope = match tool_name {
        "search_full_text" => {
            let Some(query) = str_arg(args, "query") else {
                return (r#"{"error":"missing required field \"query\""}"#.into(), true);
            };
            engine.full_text_search(query, usize_arg(args, "limit", 0), usize_arg(args, "context", 0))
        }
        "search_semantic" => {
            let Some(query) = str_arg(args, "query") else {
                return (r#"{"error":"missing required field \"query\""}"#.into(), true);
            };
            engine.semantic_search(query, usize_arg(args, "top_k", 0), usize_arg(args, "context", 0))
        }
        "search_keywords" => {
            let keywords: Vec<String> = args
                .get("keywords")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            if keywords.is_empty() {
                return (r#"{"error":"missing required field \"keywords\""}"#.into(), true);
            }
            engine.search_by_keywords(&keywords, usize_arg(args, "limit", 0))
        }
        "list_files" => {
            let filters = FileFilters {
                path_prefix: str_arg(args, "path_prefix").map(str::to_string),
                name_pattern: str_arg(args, "name_pattern").map(str::to_string),
                file_type: str_arg(args, "file_type").map(str::to_string),
                size_min: args.get("size_min").and_then(|v| v.as_u64()),
                size_max: args.get("size_max").and_then(|v| v.as_u64()),
                modified_after: args.get("modified_after").and_then(|v| v.as_f64()),
                modified_before: args.get("modified_before").and_then(|v| v.as_f64()),
            };
            engine.search_files(filters, usize_arg(args, "limit", 0), file_order_arg(args))
        }
        "list_directories" => engine.list_directories(str_arg(args, "root"), usize_arg(args, "limit", 0)),
        "get_file_info" => {
            let Some(path) = str_arg(args, "path") else {
                return (r#"{"error":"missing required field \"path\""}"#.into(), true);
            };
            engine.get_file_info(path)
        }
        "get_file_chunks" => {
            let Some(path) = str_arg(args, "path") else {
                return (r#"{"error":"missing required field \"path\""}"#.into(), true);
            };
            let range = match (args.get("start").and_then(|v| v.as_u64()), args.get("end").and_then(|v| v.as_u64())) {
                (Some(s), Some(e)) => Some((s as usize, e as usize)),
                _ => None,
            };
            engine.get_file_chunks(path, range)
        }
        "get_stats" => engine.get_stats(),
        other => {
            return (format!("{{\"error\":\"unknown tool '{other}'\"}}"), true);
        }
    };

    let is_error = matches!(envelope.status, knowledge_engine_core::response::Status::Error);
    let text = serde_json::to_string(&envelope).unwrap_or_else(|e| format!("{{\"error\":\"serialization failed: {e}\"}}"));
    (text, is_error)
}

/// Process one JSON-RPC request, returning `None` for notifications.
pub fn dispatch_jsonrpc(engine: &QueryEngine, msg: &Value) -> Option<Value> {
    let method = msg["method"].as_str().unwrap_or("");
    let id = msg.get("id").cloned();

    if id.is_none() || method.starts_with("notifications/") {
        return None;
    }

    let response = match method {
        "initialize" => {
            let client_version = msg["params"]["protocolVersion"].as_str().unwrap_or("");
            let negotiated = negotiate_version(client_version);
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": negotiated,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": "knowledge-engine", "version": env!("CARGO_PKG_VERSION") },
                    "instructions": "A personal knowledge retrieval engine for an indexed corpus. Use search_full_text for exact/phrase matches, search_semantic for conceptual similarity, search_keywords for TF-IDF-ranked topic matches, and list_files/list_directories/get_file_info/get_file_chunks/get_stats to browse and inspect the corpus."
                }
            })
        }
        "tools/list" => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tool_definitions() } }),
        "tools/call" => {
            let tool_name = msg["params"]["name"].as_str().unwrap_or("");
            let arguments = msg["params"].get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));
            let (text, is_error) = handle_tool_call(engine, tool_name, &arguments);
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{ "type": "text", "text": text }], "isError": is_error }
            })
        }
        "ping" => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
        _ => serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32601, "message": "Method not found" } }),
    };

    Some(response)
}

/// Run the MCP stdio server loop: read JSON-RPC requests from stdin, write
/// responses to stdout, one per line.
pub fn run_stdio(engine: &QueryEngine) {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let reader = stdin.lock();
    let mut initialized = false;

    tracing::info!("MCP stdio server ready");

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = serde_json::json!({ "jsonrpc": "2.0", "id": null, "error": { "code": -32700, "message": "Parse error" } });
                let mut out = stdout.lock();
                let _ = writeln!(out, "{err}");
                let _ = out.flush();
                continue;
            }
        };

        let method = msg["method"].as_str().unwrap_or("");
        if method == "notifications/initialized" || method == "notifications/cancelled" {
            continue;
        }

        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32002, "message": "Server not initialized. Send 'initialize' first." }
                });
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", serde_json::to_string(&err).unwrap());
                let _ = out.flush();
            }
            continue;
        }

        if let Some(response) = dispatch_jsonrpc(engine, &msg) {
            if method == "initialize" {
                initialized = true;
            }
            let mut out = stdout.lock();
            let _ = writeln!(out, "{}", serde_json::to_string(&response).unwrap());
            let _ = out.flush();
        }
    }
}
