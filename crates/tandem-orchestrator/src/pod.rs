//! Pod: per-role agent wrapping a model-client session, a tool whitelist, a
//! task queue, health/metrics, and a pluggable output extractor.
//!
//! Role-specific behavior is confined to three methods on `PodRoleBehavior`,
//! implemented by one small struct per role and selected by a `role_behavior`
//! factory — a pod is one structure plus a role-selected behavior rather
//! than a role-specific subclass hierarchy. Prompt *content* is out of
//! scope here; the strings below are the composition contract only, not
//! authored copy.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{
    ARTIFACT_SLICE_BUDGET_BYTES, INBOX_INJECT_LIMIT, RECENT_ERROR_WARNING_COUNT,
    TOOL_LOOP_MAX_ITERATIONS,
};
use crate::contract::{ActionRequest, ContractService};
use crate::error::{OrchestratorError, Result};
use crate::model_client::{ModelClient, ModelMessage, StreamSink, ToolResultMessage, ToolUseRequest};
use crate::tool_dispatcher::{extract_path, is_file_mutation_tool, ToolDispatcher, ToolRequest};
use crate::types::{
    new_id, Artifact, ArtifactContent, ArtifactStatus, ArtifactType, ContractId, Phase, Pod,
    PodId, PodRole, PodStatus, Task, TaskId, WorkOrderId,
};

// ============================================================================
// Role behavior
// ============================================================================

pub trait PodRoleBehavior: Send + Sync {
    fn role(&self) -> PodRole;

    /// The base system prompt for this role (composition contract only).
    fn system_prompt(&self) -> String {
        format!("You are the {:?} pod of a work-order execution engine.", self.role())
    }

    /// Tool schemas this pod is allowed/encouraged to use.
    fn specialized_tools(&self) -> Vec<String>;

    /// Parses textual output into typed artifact drafts (name, type,
    /// content). A generic fallback wraps the whole output as one note.
    fn process_task_output(&self, task: &Task, text: &str) -> Vec<ArtifactDraft> {
        vec![ArtifactDraft {
            name: format!("{}-output", task.id),
            artifact_type: ArtifactType::Document,
            content: ArtifactContent::Text(text.to_string()),
            path: None,
        }]
    }

    /// QA pods see every artifact regardless of phase/pod adjacency.
    fn sees_all_artifacts(&self) -> bool {
        matches!(self.role(), PodRole::Qa)
    }
}

pub struct ArtifactDraft {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub content: ArtifactContent,
    pub path: Option<String>,
}

pub struct FrontendBehavior;
impl PodRoleBehavior for FrontendBehavior {
    fn role(&self) -> PodRole {
        PodRole::Frontend
    }
    fn specialized_tools(&self) -> Vec<String> {
        vec!["file_read", "file_write", "edit_file", "file_list"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

pub struct BackendBehavior;
impl PodRoleBehavior for BackendBehavior {
    fn role(&self) -> PodRole {
        PodRole::Backend
    }
    fn specialized_tools(&self) -> Vec<String> {
        vec![
            "file_read",
            "file_write",
            "edit_file",
            "code_search",
            "execute_code",
            "run_command",
            "git",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

pub struct QaBehavior;
impl PodRoleBehavior for QaBehavior {
    fn role(&self) -> PodRole {
        PodRole::Qa
    }
    fn specialized_tools(&self) -> Vec<String> {
        vec!["file_read", "code_search", "execute_code", "run_command"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

pub struct ResearchBehavior;
impl PodRoleBehavior for ResearchBehavior {
    fn role(&self) -> PodRole {
        PodRole::Research
    }
    fn specialized_tools(&self) -> Vec<String> {
        vec!["web_search", "memory_recall", "memory_store"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

pub struct OrchestratorBehavior;
impl PodRoleBehavior for OrchestratorBehavior {
    fn role(&self) -> PodRole {
        PodRole::Orchestrator
    }
    fn specialized_tools(&self) -> Vec<String> {
        vec!["system_status", "memory_recall"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

pub fn role_behavior(role: PodRole) -> Box<dyn PodRoleBehavior> {
    match role {
        PodRole::Frontend => Box::new(FrontendBehavior),
        PodRole::Backend => Box::new(BackendBehavior),
        PodRole::Qa => Box::new(QaBehavior),
        PodRole::Research => Box::new(ResearchBehavior),
        PodRole::Orchestrator => Box::new(OrchestratorBehavior),
    }
}

// ============================================================================
// 4.3.1 Artifact context slice
// ============================================================================

/// A pod "sees" artifacts from: other pods active in the same phase, all
/// pods of the previous phase, any orchestrator pod across all phases, and
/// (for QA) every artifact. Sorted newest-first, truncated at the total
/// budget with an omission marker.
pub fn build_artifact_context_slice(
    behavior: &dyn PodRoleBehavior,
    current_phase_order: i64,
    phases: &[Phase],
    artifacts: &[Artifact],
    pod_role_by_id: &std::collections::HashMap<PodId, PodRole>,
) -> String {
    let visible_pod_ids: std::collections::HashSet<PodId> = if behavior.sees_all_artifacts() {
        pod_role_by_id.keys().cloned().collect()
    } else {
        let same_phase_pods: std::collections::HashSet<PodId> = phases
            .iter()
            .find(|p| p.order == current_phase_order)
            .map(|p| p.assigned_pods.iter().cloned().collect())
            .unwrap_or_default();
        let previous_phase_pods: std::collections::HashSet<PodId> = phases
            .iter()
            .find(|p| p.order == current_phase_order - 1)
            .map(|p| p.assigned_pods.iter().cloned().collect())
            .unwrap_or_default();
        let orchestrator_pods: std::collections::HashSet<PodId> = pod_role_by_id
            .iter()
            .filter(|(_, role)| **role == PodRole::Orchestrator)
            .map(|(id, _)| id.clone())
            .collect();
        same_phase_pods
            .into_iter()
            .chain(previous_phase_pods)
            .chain(orchestrator_pods)
            .collect()
    };

    let mut visible: Vec<&Artifact> = artifacts
        .iter()
        .filter(|a| behavior.sees_all_artifacts() || visible_pod_ids.contains(&a.created_by))
        .collect();
    visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut out = String::new();
    let mut omitted = 0usize;
    for artifact in &visible {
        let rendered = render_artifact_for_context(artifact);
        if out.len() + rendered.len() > ARTIFACT_SLICE_BUDGET_BYTES {
            omitted += 1;
            continue;
        }
        out.push_str(&rendered);
    }
    if omitted > 0 {
        out.push_str(&format!("\n(... {omitted} more artifacts omitted)\n"));
    }
    out
}

fn render_artifact_for_context(artifact: &Artifact) -> String {
    let preview = match &artifact.content {
        ArtifactContent::Text(t) => t.chars().take(2000).collect::<String>(),
        ArtifactContent::Structured(v) => v.to_string().chars().take(2000).collect(),
    };
    format!(
        "--- artifact: {} ({:?}, v{}) ---\n{}\n",
        artifact.path.clone().unwrap_or_else(|| artifact.name.clone()),
        artifact.artifact_type,
        artifact.version,
        preview
    )
}

// ============================================================================
// Per-task execution
// ============================================================================

/// Routes a `request_clarification` tool call out of the pod's tool loop.
/// Implemented by `pause::PauseClarificationBroker`; kept as a trait here so
/// `pod.rs` does not depend on the broker's concrete WorkOrder access.
#[async_trait]
pub trait ClarificationSink: Send + Sync {
    async fn resolve(
        &self,
        work_order_id: &WorkOrderId,
        question: &str,
        context: &str,
        options: &[String],
    ) -> Result<String>;
}

pub struct TaskExecutionOutcome {
    pub artifacts: Vec<Artifact>,
    pub output_text: String,
    pub tokens_used: u64,
    pub tool_calls: u64,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

pub struct NullSink;

#[async_trait]
impl StreamSink for NullSink {
    async fn on_text(&self, _chunk: &str) {}
    async fn on_thinking(&self, _chunk: &str) {}
    async fn on_tool_use(&self, _request: ToolUseRequest) {}
    async fn on_error(&self, _message: &str) {}
    async fn on_complete(&self, _tokens_used: u64) {}
}

/// Decorates a caller-supplied sink, accumulating streamed text and the
/// final token count while still forwarding every callback, so the live
/// streaming message visible on the update stream can be composed with
/// local bookkeeping.
struct CollectingSink<'a> {
    inner: &'a dyn StreamSink,
    text: tokio::sync::Mutex<String>,
    tokens: std::sync::atomic::AtomicU64,
}

impl<'a> CollectingSink<'a> {
    fn new(inner: &'a dyn StreamSink) -> Self {
        Self {
            inner,
            text: tokio::sync::Mutex::new(String::new()),
            tokens: std::sync::atomic::AtomicU64::new(0),
        }
    }

    async fn take_text(&self) -> String {
        std::mem::take(&mut *self.text.lock().await)
    }

    fn tokens_used(&self) -> u64 {
        self.tokens.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl<'a> StreamSink for CollectingSink<'a> {
    async fn on_text(&self, chunk: &str) {
        self.text.lock().await.push_str(chunk);
        self.inner.on_text(chunk).await;
    }
    async fn on_thinking(&self, chunk: &str) {
        self.inner.on_thinking(chunk).await;
    }
    async fn on_tool_use(&self, request: ToolUseRequest) {
        self.inner.on_tool_use(request).await;
    }
    async fn on_error(&self, message: &str) {
        self.inner.on_error(message).await;
    }
    async fn on_complete(&self, tokens_used: u64) {
        self.tokens
            .fetch_add(tokens_used, std::sync::atomic::Ordering::SeqCst);
        self.inner.on_complete(tokens_used).await;
    }
}

/// Executes one task on one pod through the model client: streams the
/// turn, runs any requested tool calls, and resumes the model with each
/// tool result until the model completes without further tool use.
#[allow(clippy::too_many_arguments)]
pub async fn execute_task(
    pod: &mut Pod,
    behavior: &dyn PodRoleBehavior,
    task: &Task,
    prompt: String,
    model_client: &dyn ModelClient,
    tool_dispatcher: &dyn ToolDispatcher,
    contract_service: &ContractService,
    contract_id: &ContractId,
    clarification_sink: &dyn ClarificationSink,
    work_order_id: &WorkOrderId,
    sink: &dyn StreamSink,
) -> TaskExecutionOutcome {
    pod.status = PodStatus::Working;
    pod.current_task = Some(task.id.clone());

    let collecting_sink = CollectingSink::new(sink);
    let start = std::time::Instant::now();
    let mut history = vec![ModelMessage {
        role: "user".to_string(),
        content: prompt,
    }];
    let mut written_paths = std::collections::HashSet::new();
    let mut tool_calls = 0u64;
    let mut artifacts = Vec::new();

    let pending = match model_client
        .stream(&pod.model_config, &history, &collecting_sink)
        .await
    {
        Ok(pending) => pending,
        Err(err) => {
            pod.health.record_failure(err.to_string());
            pod.status = PodStatus::Idle;
            pod.current_task = None;
            return TaskExecutionOutcome {
                artifacts,
                output_text: collecting_sink.take_text().await,
                tokens_used: collecting_sink.tokens_used(),
                tool_calls,
                execution_time_ms: start.elapsed().as_millis() as u64,
                success: false,
                error: Some(err.to_string()),
            };
        }
    };
    let mut pending = pending;

    for _ in 0..TOOL_LOOP_MAX_ITERATIONS {
        if pending.is_empty() {
            break;
        }
        let request = pending.remove(0);
        tool_calls += 1;

        let tool_result_text = match run_one_tool_call(
            pod,
            &request,
            tool_dispatcher,
            contract_service,
            contract_id,
            clarification_sink,
            work_order_id,
            &mut written_paths,
            &mut artifacts,
            task,
        )
        .await
        {
            Ok(text) => text,
            Err(err) => err.to_string(),
        };

        history.push(ModelMessage {
            role: "tool".to_string(),
            content: tool_result_text.clone(),
        });

        let continuation = model_client
            .continue_with_tool_result(
                &pod.model_config,
                &history,
                ToolResultMessage {
                    tool_use_id: request.id.clone(),
                    output: tool_result_text,
                    is_error: false,
                },
                &collecting_sink,
            )
            .await;
        match continuation {
            Ok(mut more) => pending.append(&mut more),
            Err(err) => {
                pod.health.record_failure(err.to_string());
                pod.status = PodStatus::Idle;
                pod.current_task = None;
                return TaskExecutionOutcome {
                    artifacts,
                    output_text: collecting_sink.take_text().await,
                    tokens_used: collecting_sink.tokens_used(),
                    tool_calls,
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    success: false,
                    error: Some(err.to_string()),
                };
            }
        }
    }

    let output_text = collecting_sink.take_text().await;
    let tokens_used = collecting_sink.tokens_used();
    // Only fall back to the role's catch-all output extractor when the task
    // produced no artifacts via its tool calls; otherwise a task that already
    // wrote a file would also get a second, redundant document artifact.
    if artifacts.is_empty() {
        let extracted = behavior.process_task_output(task, &output_text);
        for draft in extracted {
            artifacts.push(Artifact {
                id: new_id("artifact"),
                work_order_id: work_order_id.clone(),
                name: draft.name,
                artifact_type: draft.artifact_type,
                description: String::new(),
                content: draft.content,
                path: draft.path,
                created_by: pod.id.clone(),
                created_at: chrono::Utc::now(),
                version: 1,
                status: ArtifactStatus::Draft,
                previous_version: None,
            });
        }
    }

    pod.health.record_success();
    pod.status = PodStatus::Idle;
    pod.current_task = None;
    pod.completed_tasks.push(task.id.clone());
    pod.resource_usage.tokens_used += tokens_used;
    pod.resource_usage.api_calls += tool_calls + 1;
    pod.resource_usage.execution_time_ms += start.elapsed().as_millis() as u64;

    TaskExecutionOutcome {
        artifacts,
        output_text,
        tokens_used,
        tool_calls,
        execution_time_ms: start.elapsed().as_millis() as u64,
        success: true,
        error: None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_tool_call(
    pod: &mut Pod,
    request: &ToolUseRequest,
    tool_dispatcher: &dyn ToolDispatcher,
    contract_service: &ContractService,
    contract_id: &ContractId,
    clarification_sink: &dyn ClarificationSink,
    work_order_id: &WorkOrderId,
    written_paths: &mut std::collections::HashSet<String>,
    artifacts: &mut Vec<Artifact>,
    task: &Task,
) -> Result<String> {
    if request.tool == "request_clarification" {
        let question = request
            .input
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let context = request
            .input
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let options: Vec<String> = request
            .input
            .get("options")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        return clarification_sink
            .resolve(work_order_id, question, context, &options)
            .await;
    }

    let path = extract_path(&request.input);
    let action = ActionRequest {
        tool: Some(request.tool.clone()),
        path: path.clone(),
        operation: None,
    };
    let outcome = contract_service.validate_action(contract_id, &action).await?;
    if !outcome.allowed {
        return Ok(format!(
            "Contract violation: {}",
            outcome.violations.join("; ")
        ));
    }

    if request.tool == "file_write" {
        if let Some(path) = &path {
            let normalized = crate::types::normalize_artifact_path(path);
            if !written_paths.insert(normalized) {
                return Ok(
                    "This file was already written in this task; refusing to rewrite it."
                        .to_string(),
                );
            }
        }
    }

    let response = tool_dispatcher
        .dispatch(ToolRequest {
            tool: request.tool.clone(),
            input: request.input.clone(),
        })
        .await
        .map_err(|e| OrchestratorError::ToolFailure(e.to_string()))?;

    if is_file_mutation_tool(&request.tool) {
        if let Some(path) = path {
            // `file_write` carries the full content in its own input; the
            // dispatcher's response shape is only `{path, size, ...}` (spec
            // §6.2) and is not guaranteed to echo it back. `edit_file` has
            // no single "new content" input, so fall back to whatever the
            // response happens to carry.
            let content = request
                .input
                .get("content")
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| {
                    response
                        .result
                        .get("content")
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or_default();
            artifacts.push(Artifact {
                id: new_id("artifact"),
                work_order_id: work_order_id.clone(),
                name: path.clone(),
                artifact_type: ArtifactType::File,
                description: format!("produced by task {}", task.id),
                content: ArtifactContent::Text(content),
                path: Some(path),
                created_by: pod.id.clone(),
                created_at: chrono::Utc::now(),
                version: 1,
                status: ArtifactStatus::Draft,
                previous_version: None,
            });
        }
    }

    Ok(response.result.to_string())
}

/// Builds the base task prompt: name + description + objective + quality
/// target + time-remaining + budget warning, plus artifact slice, inbox
/// items, and recent error summary.
#[allow(clippy::too_many_arguments)]
pub fn build_task_prompt(
    task: &Task,
    objective: &str,
    quality_target: &str,
    remaining_minutes: f64,
    artifact_slice: &str,
    inbox_messages: &[String],
    recent_errors: &[String],
) -> String {
    let mut prompt = format!(
        "Task: {}\nDescription: {}\nObjective: {}\nQuality target: {}\nTime remaining: {:.1} minutes\n",
        task.name, task.description, objective, quality_target, remaining_minutes
    );
    if remaining_minutes < 5.0 {
        prompt.push_str("WARNING: the work order is nearly out of time budget.\n");
    }
    if !artifact_slice.is_empty() {
        prompt.push_str("\n## Prior artifacts\n");
        prompt.push_str(artifact_slice);
    }
    if !inbox_messages.is_empty() {
        prompt.push_str("\n## Messages\n");
        for message in inbox_messages.iter().take(INBOX_INJECT_LIMIT) {
            prompt.push_str(&format!("- {message}\n"));
        }
    }
    if !recent_errors.is_empty() {
        prompt.push_str("\n## Recent errors\n");
        for err in recent_errors.iter().rev().take(RECENT_ERROR_WARNING_COUNT) {
            prompt.push_str(&format!("- {err}\n"));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qa_behavior_sees_all_artifacts() {
        assert!(QaBehavior.sees_all_artifacts());
        assert!(!BackendBehavior.sees_all_artifacts());
    }

    #[test]
    fn artifact_slice_omission_marker_appears_when_budget_exceeded() {
        let behavior = QaBehavior;
        let mut artifacts = Vec::new();
        for i in 0..5 {
            artifacts.push(Artifact {
                id: format!("a{i}"),
                work_order_id: "wo".into(),
                name: format!("f{i}"),
                artifact_type: ArtifactType::File,
                description: String::new(),
                content: ArtifactContent::Text("x".repeat(ARTIFACT_SLICE_BUDGET_BYTES)),
                path: Some(format!("f{i}.txt")),
                created_by: "pod_1".into(),
                created_at: chrono::Utc::now(),
                version: 1,
                status: ArtifactStatus::Draft,
                previous_version: None,
            });
        }
        let phases = vec![];
        let roles = std::collections::HashMap::new();
        let slice = build_artifact_context_slice(&behavior, 0, &phases, &artifacts, &roles);
        assert!(slice.contains("more artifacts omitted"));
    }

    #[test]
    fn rewrite_guard_tracks_normalized_paths() {
        let mut written = std::collections::HashSet::new();
        assert!(written.insert(crate::types::normalize_artifact_path("src/lib.rs")));
        assert!(!written.insert(crate::types::normalize_artifact_path("./src/lib.rs")));
    }
}
