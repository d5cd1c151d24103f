//! End-to-end scenarios driving `ExecutionEngine` through a full
//! register -> execute -> completion cycle with scripted model/tool
//! backends, one test per seed scenario.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use tandem_orchestrator::checkpoint::CheckpointStatus;
use tandem_orchestrator::error::{OrchestratorError, Result};
use tandem_orchestrator::model_client::{
    ModelClient, ModelMessage, StreamSink, ToolResultMessage, ToolUseRequest,
};
use tandem_orchestrator::tool_dispatcher::{ToolDispatcher, ToolRequest, ToolResponse};
use tandem_orchestrator::types::{
    Authority, CheckpointAction, CheckpointDecision, ModelConfig, Phase, Plan, PodRole,
    PodStrategy, PodStrategyMode, QualityTarget, ScopePattern, Task, WorkOrder, WorkOrderStatus,
};
use tandem_orchestrator::{ExecuteOptions, ExecutionEngine};

// ============================================================================
// Shared test doubles
// ============================================================================

/// Streams one line of text and no tool calls; ends every task immediately.
struct EchoModelClient;

#[async_trait]
impl ModelClient for EchoModelClient {
    async fn stream(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        sink.on_text("done").await;
        sink.on_complete(10).await;
        Ok(Vec::new())
    }

    async fn continue_with_tool_result(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        _result: ToolResultMessage,
        _sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        Ok(Vec::new())
    }
}

/// Never dispatches successfully; every call records the request it saw.
struct RecordingToolDispatcher {
    calls: Arc<AsyncMutex<Vec<ToolRequest>>>,
}

impl RecordingToolDispatcher {
    fn new() -> Self {
        Self {
            calls: Arc::new(AsyncMutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ToolDispatcher for RecordingToolDispatcher {
    async fn dispatch(&self, request: ToolRequest) -> Result<ToolResponse> {
        self.calls.lock().await.push(request.clone());
        let size = request
            .input
            .get("content")
            .and_then(serde_json::Value::as_str)
            .map(str::len)
            .unwrap_or(0);
        Ok(ToolResponse {
            result: json!({ "path": request.input.get("path"), "size": size }),
            duration_ms: 1,
        })
    }
}

/// Issues a single `file_write` tool call on its first turn, then ends.
struct FileWriteModelClient {
    path: &'static str,
    content: &'static str,
}

#[async_trait]
impl ModelClient for FileWriteModelClient {
    async fn stream(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        sink.on_text("writing the file").await;
        sink.on_complete(20).await;
        Ok(vec![ToolUseRequest {
            id: "tool_1".to_string(),
            tool: "file_write".to_string(),
            input: json!({ "path": self.path, "content": self.content }),
        }])
    }

    async fn continue_with_tool_result(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        _result: ToolResultMessage,
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        sink.on_text("done").await;
        sink.on_complete(5).await;
        Ok(Vec::new())
    }
}

/// Fails (as a model failure, not a tool failure) any task whose prompt
/// contains `fail_marker`; every other task completes like `EchoModelClient`.
struct ConditionalFailureModelClient {
    fail_marker: &'static str,
}

#[async_trait]
impl ModelClient for ConditionalFailureModelClient {
    async fn stream(
        &self,
        _config: &ModelConfig,
        history: &[ModelMessage],
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        if history.first().map(|m| m.content.contains(self.fail_marker)) == Some(true) {
            return Err(OrchestratorError::ModelFailure(
                "simulated model failure".to_string(),
            ));
        }
        sink.on_text("done").await;
        sink.on_complete(10).await;
        Ok(Vec::new())
    }

    async fn continue_with_tool_result(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        _result: ToolResultMessage,
        _sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        Ok(Vec::new())
    }
}

/// Issues a single `file_write` tool call to a forbidden path, then ends
/// regardless of the tool result text it receives back.
struct ForbiddenWriteModelClient;

#[async_trait]
impl ModelClient for ForbiddenWriteModelClient {
    async fn stream(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        sink.on_text("touching a system file").await;
        sink.on_complete(10).await;
        Ok(vec![ToolUseRequest {
            id: "tool_1".to_string(),
            tool: "file_write".to_string(),
            input: json!({ "path": "/etc/passwd", "content": "nope" }),
        }])
    }

    async fn continue_with_tool_result(
        &self,
        _config: &ModelConfig,
        _history: &[ModelMessage],
        _result: ToolResultMessage,
        sink: &dyn StreamSink,
    ) -> Result<Vec<ToolUseRequest>> {
        sink.on_text("gave up after the refusal").await;
        sink.on_complete(5).await;
        Ok(Vec::new())
    }
}

fn single_frontend_plan(phase: Phase) -> Plan {
    Plan {
        phases: vec![phase],
        pod_strategy: PodStrategy {
            mode: PodStrategyMode::Parallel,
            max_concurrent: 1,
            priority_order: vec![PodRole::Frontend],
            dependencies: HashMap::new(),
        },
        requires_approval: false,
        approved_at: None,
    }
}

fn base_work_order(authority: Authority, total_minutes: f64) -> WorkOrder {
    let mut wo = WorkOrder::new("Ship the landing page", total_minutes);
    wo.authority = authority;
    wo.quality_target = QualityTarget::Standard;
    wo.scope = ScopePattern::default();
    wo
}

// ============================================================================
// S1 - empty plan
// ============================================================================

#[tokio::test]
async fn s1_empty_plan_completes_immediately_with_no_artifacts() {
    let engine = ExecutionEngine::new(
        Arc::new(EchoModelClient),
        Arc::new(RecordingToolDispatcher::new()),
        None,
    );
    let mut wo = base_work_order(Authority::Autonomous, 30.0);
    wo.plan = Some(single_frontend_plan(Phase::new("p0", "Empty phase", 0)));
    // Drop the only task so the plan has a phase but no tasks to run.
    wo.plan.as_mut().unwrap().phases[0].tasks.clear();
    let id = engine.register(wo).await;

    engine.execute(&id, ExecuteOptions::default()).await.unwrap();

    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, WorkOrderStatus::Completed);
    assert_eq!(state.progress, 100);
    assert!(state.artifacts.is_empty());
    assert!(state.receipt.unwrap().executive.unfinished_items.is_empty());
}

// ============================================================================
// S2 - single-task file_write produces a matching artifact
// ============================================================================

#[tokio::test]
async fn s2_file_write_task_produces_artifact_with_written_content() {
    let dispatcher = RecordingToolDispatcher::new();
    let calls = dispatcher.calls.clone();
    let engine = ExecutionEngine::new(
        Arc::new(FileWriteModelClient {
            path: "output/hello.txt",
            content: "hello world",
        }),
        Arc::new(dispatcher),
        None,
    );

    let mut phase = Phase::new("p0", "Build", 0);
    phase.tasks.push(Task::new("t0", "Write hello.txt"));
    let mut wo = base_work_order(Authority::Autonomous, 30.0);
    wo.plan = Some(single_frontend_plan(phase));
    let id = engine.register(wo).await;

    engine.execute(&id, ExecuteOptions::default()).await.unwrap();

    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, WorkOrderStatus::Completed);
    assert_eq!(state.artifacts.len(), 1);
    let artifact = &state.artifacts[0];
    assert_eq!(artifact.path.as_deref(), Some("output/hello.txt"));
    assert_eq!(artifact.content.as_text(), Some("hello world"));

    // The dispatcher's response never echoed the content back; the artifact
    // content must have come from the tool request's own input.
    assert_eq!(calls.lock().await.len(), 1);
}

// ============================================================================
// S3 - a failed task within a phase is tolerated
// ============================================================================

#[tokio::test]
async fn s3_task_failure_is_tolerated_when_outnumbered_by_successes() {
    let engine = ExecutionEngine::new(
        Arc::new(ConditionalFailureModelClient {
            fail_marker: "TRIGGER_FAILURE",
        }),
        Arc::new(RecordingToolDispatcher::new()),
        None,
    );

    let mut phase = Phase::new("p0", "Build", 0);
    phase.tasks.push(Task::new("t0", "Write index.html"));
    phase.tasks.push(Task::new("t1", "Write style.css"));
    let mut failing = Task::new("t2", "Break on purpose");
    failing.description = "TRIGGER_FAILURE".to_string();
    phase.tasks.push(failing);

    let mut wo = base_work_order(Authority::Autonomous, 30.0);
    wo.plan = Some(single_frontend_plan(phase));
    let id = engine.register(wo).await;

    engine.execute(&id, ExecuteOptions::default()).await.unwrap();

    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, WorkOrderStatus::Completed);
    let phase = &state.plan.unwrap().phases[0];
    assert_eq!(
        phase.tasks.iter().filter(|t| t.status == tandem_orchestrator::types::TaskStatus::Complete).count(),
        2
    );
    assert_eq!(
        phase.tasks.iter().filter(|t| t.status == tandem_orchestrator::types::TaskStatus::Failed).count(),
        1
    );
}

// ============================================================================
// S4 - checkpoint wait under supervised authority
// ============================================================================

#[tokio::test]
async fn s4_checkpoint_blocks_and_resumes_under_supervised_authority() {
    let engine = ExecutionEngine::new(
        Arc::new(EchoModelClient),
        Arc::new(RecordingToolDispatcher::new()),
        None,
    );

    let mut phase_1 = Phase::new("p0", "Design", 0);
    phase_1.tasks.push(Task::new("t0", "Sketch the layout"));
    let mut phase_2 = Phase::new("p1", "Build", 1);
    phase_2.tasks.push(Task::new("t1", "Implement the layout"));

    let mut wo = base_work_order(Authority::Supervised, 60.0);
    wo.plan = Some(Plan {
        phases: vec![phase_1, phase_2],
        pod_strategy: PodStrategy {
            mode: PodStrategyMode::Sequential,
            max_concurrent: 1,
            priority_order: vec![PodRole::Frontend],
            dependencies: HashMap::new(),
        },
        requires_approval: false,
        approved_at: None,
    });
    let id = engine.register(wo).await;

    let background_engine = engine.clone();
    let background_id = id.clone();
    let handle = tokio::spawn(async move {
        background_engine
            .execute(&background_id, ExecuteOptions::default())
            .await
    });

    let checkpoint_id = loop {
        let state = engine.get_state(&id).await.unwrap();
        if let Some(cp) = state
            .checkpoints
            .iter()
            .find(|c| c.status == CheckpointStatus::Reached)
        {
            break cp.id.clone();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };

    engine
        .submit_checkpoint_decision(
            &id,
            &checkpoint_id,
            CheckpointDecision {
                action: CheckpointAction::Pause,
                feedback: Some("let me look first".to_string()),
                decided_by: "user-1".to_string(),
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    loop {
        let state = engine.get_state(&id).await.unwrap();
        if state.status == WorkOrderStatus::Paused {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    engine.resume(&id).await.unwrap();
    handle.await.unwrap().unwrap();

    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, WorkOrderStatus::Completed);
    assert_eq!(state.checkpoints[0].status, CheckpointStatus::Approved);
    assert_eq!(
        state.checkpoints[0].decision.as_ref().unwrap().decided_by,
        "user-1"
    );
}

// ============================================================================
// S5 - contract violation on a forbidden path never reaches the dispatcher
// ============================================================================

#[tokio::test]
async fn s5_forbidden_path_write_is_blocked_before_dispatch() {
    let dispatcher = RecordingToolDispatcher::new();
    let calls = dispatcher.calls.clone();
    let engine = ExecutionEngine::new(Arc::new(ForbiddenWriteModelClient), Arc::new(dispatcher), None);

    let mut phase = Phase::new("p0", "Build", 0);
    phase.tasks.push(Task::new("t0", "Attempt a system write"));
    let mut wo = base_work_order(Authority::Autonomous, 30.0);
    wo.scope = ScopePattern {
        forbidden_path_prefixes: vec!["/etc".to_string()],
        ..Default::default()
    };
    wo.plan = Some(single_frontend_plan(phase));
    let id = engine.register(wo).await;

    engine.execute(&id, ExecuteOptions::default()).await.unwrap();

    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, WorkOrderStatus::Completed);
    assert!(state.artifacts.is_empty());
    assert!(calls.lock().await.is_empty());
}

// ============================================================================
// S6 - a work order starting with an already-exhausted budget completes
// after the first boundary check instead of running any phase.
// ============================================================================

#[tokio::test]
async fn s6_zero_budget_on_start_completes_with_every_phase_unfinished() {
    let engine = ExecutionEngine::new(
        Arc::new(EchoModelClient),
        Arc::new(RecordingToolDispatcher::new()),
        None,
    );

    let mut phase_1 = Phase::new("p0", "Design", 0);
    phase_1.tasks.push(Task::new("t0", "Sketch the layout"));
    let mut phase_2 = Phase::new("p1", "Build", 1);
    phase_2.tasks.push(Task::new("t1", "Implement the layout"));
    let mut phase_3 = Phase::new("p2", "Polish", 2);
    phase_3.tasks.push(Task::new("t2", "Final pass"));

    let mut wo = base_work_order(Authority::Autonomous, 0.0);
    wo.plan = Some(Plan {
        phases: vec![phase_1, phase_2, phase_3],
        pod_strategy: PodStrategy {
            mode: PodStrategyMode::Sequential,
            max_concurrent: 1,
            priority_order: vec![PodRole::Frontend],
            dependencies: HashMap::new(),
        },
        requires_approval: false,
        approved_at: None,
    });
    let id = engine.register(wo).await;

    engine.execute(&id, ExecuteOptions::default()).await.unwrap();

    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, WorkOrderStatus::Completed);
    // Invariant (spec "monotone progress"): progress == 100 on completion
    // regardless of how many phases actually ran.
    assert_eq!(state.progress, 100);
    let receipt = state.receipt.unwrap();
    assert_eq!(receipt.executive.unfinished_items.len(), 3);
    assert!(state.artifacts.is_empty());
}
