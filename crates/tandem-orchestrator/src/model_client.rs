//! Model client boundary: abstracted as a streaming text + tool-use callback
//! interface. The engine composes these callbacks; it does not own its own
//! event loop. The concrete provider SDK is deliberately out of scope here —
//! a host binary supplies a real implementation.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::ModelConfig;

#[derive(Debug, Clone)]
pub struct ToolUseRequest {
    pub id: String,
    pub tool: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct ToolResultMessage {
    pub tool_use_id: String,
    pub output: String,
    pub is_error: bool,
}

/// Callbacks a `ModelClient` invokes while streaming a single completion:
/// `{on_text, on_thinking, on_tool_use, on_error, on_complete}`.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_text(&self, chunk: &str);
    async fn on_thinking(&self, chunk: &str);
    async fn on_tool_use(&self, request: ToolUseRequest);
    async fn on_error(&self, message: &str);
    async fn on_complete(&self, tokens_used: u64);
}

#[derive(Debug, Clone)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
}

/// The external model-provider boundary. `stream` drives one turn of
/// conversation, invoking `sink` for each event, and returns any pending
/// tool-use requests collected into a list while text chunks are appended
/// to the running transcript. Cancellation is by dropping/cancelling the
/// returned future — the engine must be able to tear down an in-flight
/// stream without the model client's cooperation.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        config: &ModelConfig,
        history: &[ModelMessage],
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>>;

    /// Continues a turn after a tool result was produced, resuming the
    /// model with that result and returning any further tool-use requests.
    async fn continue_with_tool_result(
        &self,
        config: &ModelConfig,
        history: &[ModelMessage],
        result: ToolResultMessage,
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>>;
}
