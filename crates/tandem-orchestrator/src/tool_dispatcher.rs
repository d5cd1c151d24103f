//! L2 Tool Dispatcher: executes a named tool with structured input, returns
//! a string result or error (spec §1, §6.2). The actual tool backend (file
//! I/O, code execution, shell, search, image gen) is deliberately out of
//! scope — this module only fixes the wire contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Closed set of recognized tool names (spec §6.2 table). Pods are granted a
/// subset via `Pod::tool_whitelist`.
pub const KNOWN_TOOLS: &[&str] = &[
    "file_read",
    "file_write",
    "file_list",
    "scan_directory",
    "code_search",
    "execute_code",
    "run_command",
    "git",
    "edit_file",
    "web_search",
    "generate_image",
    "memory_store",
    "memory_recall",
    "system_status",
    "request_clarification",
];

pub fn is_file_mutation_tool(tool: &str) -> bool {
    matches!(tool, "file_write" | "edit_file")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub result: Value,
    pub duration_ms: u64,
}

/// The external tool-backend boundary (spec §6.2). Implementations route
/// `file_*`/`edit_file` through a workspace endpoint when one is active, or
/// confine paths under `output/<slug>/` otherwise (spec §6.2 closing note) —
/// that routing decision belongs to the concrete dispatcher, not this trait.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, request: ToolRequest) -> Result<ToolResponse>;
}

/// Extracts a file path from a tool's input, if present — used by the pod's
/// rewrite-loop guard and by contract path validation (spec §4.3 step 5,
/// §4.7).
pub fn extract_path(input: &Value) -> Option<String> {
    input
        .get("path")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}
