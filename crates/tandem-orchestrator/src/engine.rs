//! Execution engine: the front door (`execute`/`pause`/`resume`/`cancel`/
//! `get_state`/`is_running`) that drives a WorkOrder through its phases.
//!
//! Structured like `src-tauri/src/orchestrator/engine.rs`'s
//! `OrchestratorEngine`: an `Arc<RwLock<WorkOrder>>` per work order for
//! committed state, a `CancellationToken` for cancellation, a
//! `watch::Sender<bool>` for the pause signal, and a `JoinSet` to run a
//! task group's tasks in parallel with all-settled semantics.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::config::{
    INBOX_INJECT_LIMIT, MAX_PAUSE_WINDOW, RECENT_ERROR_WARNING_COUNT, TICKER_PERIOD,
    WORKSPACE_CLEANUP_DELAY_FAILURE, WORKSPACE_CLEANUP_DELAY_SUCCESS,
};
use crate::contract::ContractService;
use crate::error::{OrchestratorError, Result};
use crate::model_client::{ModelClient, StreamSink, ToolUseRequest};
use crate::pause::{AuxiliaryModel, ClarificationBroker};
use crate::pod::{build_artifact_context_slice, build_task_prompt, execute_task, role_behavior};
use crate::pod_pool::{PodPool, PoolContext};
use crate::receipt::{generate_receipt, PodTaskOutcomes};
use crate::scheduler::{build_task_groups, select_pod_for_task};
use crate::tool_dispatcher::ToolDispatcher;
use crate::types::{
    new_id, BusMessage, BusMessageType, BusPriority, BusRecipient, BusSender, Checkpoint,
    ContractId, Phase, PhaseStatus, Pod, PodId, PodRole, PodStatus, Task, TaskId, TaskStatus,
    UpdateEventType, WorkOrder, WorkOrderId, WorkOrderStatus,
};
use crate::updates::UpdateStream;

/// Renders an inbox message for injection into a pod's next task prompt.
fn format_bus_message(message: &BusMessage) -> String {
    let sender = match &message.from {
        BusSender::Pod(id) => id.clone(),
        BusSender::Engine => "engine".to_string(),
    };
    format!("[{:?} from {sender}] {}", message.message_type, message.payload)
}

/// Options accepted by `ExecutionEngine::execute`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub resume: bool,
}

struct RunningHandle {
    execution_attempt_id: String,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    paused_at: Arc<StdMutex<Option<Instant>>>,
    checkpoint: Arc<crate::checkpoint::CheckpointController>,
    clarification: Arc<ClarificationBroker>,
}

/// Forwards streamed pod output onto the update stream as `pod_message`/
/// `error` events, giving external subscribers a live view of a pod's
/// turn as it streams.
struct EngineStreamSink {
    updates: UpdateStream,
    work_order_id: WorkOrderId,
    pod_id: PodId,
}

#[async_trait]
impl StreamSink for EngineStreamSink {
    async fn on_text(&self, chunk: &str) {
        self.updates
            .emit(
                self.work_order_id.clone(),
                UpdateEventType::PodMessage,
                json!({ "podId": self.pod_id, "text": chunk }),
            )
            .await;
    }

    async fn on_thinking(&self, _chunk: &str) {}

    async fn on_tool_use(&self, request: ToolUseRequest) {
        self.updates
            .emit(
                self.work_order_id.clone(),
                UpdateEventType::PodMessage,
                json!({ "podId": self.pod_id, "tool": request.tool }),
            )
            .await;
    }

    async fn on_error(&self, message: &str) {
        self.updates
            .emit(
                self.work_order_id.clone(),
                UpdateEventType::Error,
                json!({ "podId": self.pod_id, "message": message }),
            )
            .await;
    }

    async fn on_complete(&self, _tokens_used: u64) {}
}

/// A snapshot of a task execution's result, owned so it can cross a spawned
/// task boundary and be folded back into committed state by the caller.
struct GroupTaskResult {
    pod_id: PodId,
    pod: Pod,
    task: Task,
    phase_id: String,
    outcome: crate::pod::TaskExecutionOutcome,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    work_orders: Arc<RwLock<HashMap<WorkOrderId, Arc<RwLock<WorkOrder>>>>>,
    running: Arc<RwLock<HashMap<WorkOrderId, Arc<RunningHandle>>>>,
    updates: UpdateStream,
    pod_pool: PodPool,
    contract_service: ContractService,
    model_client: Arc<dyn ModelClient>,
    tool_dispatcher: Arc<dyn ToolDispatcher>,
    auxiliary_model: Option<AuxiliaryModel>,
}

impl ExecutionEngine {
    pub fn new(
        model_client: Arc<dyn ModelClient>,
        tool_dispatcher: Arc<dyn ToolDispatcher>,
        auxiliary_model: Option<AuxiliaryModel>,
    ) -> Self {
        Self {
            work_orders: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(HashMap::new())),
            updates: UpdateStream::new(),
            pod_pool: PodPool::new(),
            contract_service: ContractService::new(),
            model_client,
            tool_dispatcher,
            auxiliary_model,
        }
    }

    /// Registers a WorkOrder with the engine (plumbing ahead of `execute`;
    /// WorkOrder creation/planning lives upstream of this crate).
    pub async fn register(&self, work_order: WorkOrder) -> WorkOrderId {
        let id = work_order.id.clone();
        self.work_orders
            .write()
            .await
            .insert(id.clone(), Arc::new(RwLock::new(work_order)));
        id
    }

    pub fn updates(&self) -> &UpdateStream {
        &self.updates
    }

    pub async fn is_running(&self, work_order_id: &WorkOrderId) -> bool {
        self.running.read().await.contains_key(work_order_id)
    }

    /// Returns a snapshot of the current work order state. A registered
    /// but not-yet-executing (or already-terminal) work order still returns
    /// its snapshot; callers combine this with `is_running` to distinguish
    /// "not running" from "unknown".
    pub async fn get_state(&self, work_order_id: &WorkOrderId) -> Result<WorkOrder> {
        let wo = self.get_work_order_arc(work_order_id).await?;
        Ok(wo.read().await.clone())
    }

    async fn get_work_order_arc(
        &self,
        work_order_id: &WorkOrderId,
    ) -> Result<Arc<RwLock<WorkOrder>>> {
        self.work_orders
            .read()
            .await
            .get(work_order_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("work order {work_order_id}")))
    }

    /// Requests a pause. Only valid while the work order is `executing`.
    pub async fn pause(&self, work_order_id: &WorkOrderId) -> Result<()> {
        let handle = self.running_handle(work_order_id).await?;
        let wo = self.get_work_order_arc(work_order_id).await?;
        {
            let mut w = wo.write().await;
            if w.status != WorkOrderStatus::Executing {
                return Err(OrchestratorError::PreconditionFailed(
                    "pause is only valid while executing".to_string(),
                ));
            }
            w.status = WorkOrderStatus::Paused;
            w.touch();
        }
        *handle.paused_at.lock().unwrap() = Some(Instant::now());
        let _ = handle.pause_tx.send(true);
        Ok(())
    }

    /// `resume(id)`.
    pub async fn resume(&self, work_order_id: &WorkOrderId) -> Result<()> {
        let handle = self.running_handle(work_order_id).await?;
        let wo = self.get_work_order_arc(work_order_id).await?;
        {
            let mut w = wo.write().await;
            if w.status != WorkOrderStatus::Paused {
                return Err(OrchestratorError::PreconditionFailed(
                    "work order is not paused".to_string(),
                ));
            }
            w.status = WorkOrderStatus::Executing;
            w.touch();
        }
        *handle.paused_at.lock().unwrap() = None;
        let _ = handle.pause_tx.send(false);
        Ok(())
    }

    /// Cancels a work order. Valid in any non-terminal state, idempotent.
    pub async fn cancel(&self, work_order_id: &WorkOrderId) -> Result<()> {
        if let Some(handle) = self.running.read().await.get(work_order_id) {
            handle.cancel.cancel();
        }
        if let Ok(wo) = self.get_work_order_arc(work_order_id).await {
            let mut w = wo.write().await;
            if !w.status.is_terminal() {
                w.status = WorkOrderStatus::Cancelled;
                w.completed_at = Some(Utc::now());
                w.touch();
            }
        }
        Ok(())
    }

    async fn running_handle(&self, work_order_id: &WorkOrderId) -> Result<Arc<RunningHandle>> {
        self.running
            .read()
            .await
            .get(work_order_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::PreconditionFailed(format!(
                    "work order {work_order_id} is not executing"
                ))
            })
    }

    /// Starts (or resumes) execution of a registered work order.
    /// Idempotent: a call against a work order already running is a no-op.
    /// A work order whose
    /// persisted status reads `executing` but has no internal execution
    /// state (e.g. after a host restart) is "stale-executing" and a fresh
    /// `executionAttemptId` is minted to recover it.
    pub async fn execute(&self, work_order_id: &WorkOrderId, opts: ExecuteOptions) -> Result<()> {
        if self.is_running(work_order_id).await {
            return Ok(());
        }

        let wo = self.get_work_order_arc(work_order_id).await?;
        self.validate_preconditions(&wo).await?;

        if opts.resume {
            tracing::info!(work_order_id, "resuming execution");
        }

        let execution_attempt_id = new_id("exec");
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let paused_at = Arc::new(StdMutex::new(None));
        let checkpoint_controller =
            Arc::new(crate::checkpoint::CheckpointController::new(wo.clone(), self.updates.clone()));
        let clarification_broker = Arc::new(ClarificationBroker::new(
            wo.clone(),
            self.updates.clone(),
            self.auxiliary_model.clone(),
            cancel.clone(),
        ));

        self.running.write().await.insert(
            work_order_id.clone(),
            Arc::new(RunningHandle {
                execution_attempt_id: execution_attempt_id.clone(),
                cancel: cancel.clone(),
                pause_tx: pause_tx.clone(),
                paused_at: paused_at.clone(),
                checkpoint: checkpoint_controller.clone(),
                clarification: clarification_broker.clone(),
            }),
        );

        let result = self
            .run_phases(
                wo,
                work_order_id.clone(),
                execution_attempt_id,
                cancel,
                pause_rx,
                paused_at,
                checkpoint_controller,
                clarification_broker,
            )
            .await;

        self.running.write().await.remove(work_order_id);
        result
    }

    /// Submits an externally-decided `CheckpointDecision` for a checkpoint
    /// currently blocking the named work order's execution (spec §6.4).
    /// Returns `PreconditionFailed` if the work order isn't running, or if
    /// no checkpoint with that id is currently awaiting a decision.
    pub async fn submit_checkpoint_decision(
        &self,
        work_order_id: &WorkOrderId,
        checkpoint_id: &crate::types::CheckpointId,
        decision: crate::types::CheckpointDecision,
    ) -> Result<()> {
        let handle = self.running_handle(work_order_id).await?;
        if handle.checkpoint.submit_decision(checkpoint_id, decision).await {
            Ok(())
        } else {
            Err(OrchestratorError::PreconditionFailed(format!(
                "no checkpoint '{checkpoint_id}' is currently awaiting a decision"
            )))
        }
    }

    /// Submits a user's reply to a pending clarification request for the
    /// named work order (spec §6.4). Returns `PreconditionFailed` if the
    /// work order isn't running, or if no clarification with that id is
    /// currently awaiting a reply (e.g. it auto-resolved already).
    pub async fn submit_clarification_reply(
        &self,
        work_order_id: &WorkOrderId,
        pause_request_id: &crate::types::PauseRequestId,
        reply: String,
    ) -> Result<()> {
        let handle = self.running_handle(work_order_id).await?;
        if handle
            .clarification
            .submit_user_reply(pause_request_id, reply)
            .await
        {
            Ok(())
        } else {
            Err(OrchestratorError::PreconditionFailed(format!(
                "no clarification '{pause_request_id}' is currently awaiting a reply"
            )))
        }
    }

    async fn validate_preconditions(&self, wo: &Arc<RwLock<WorkOrder>>) -> Result<()> {
        let w = wo.read().await;
        let plan = w
            .plan
            .as_ref()
            .ok_or_else(|| OrchestratorError::PreconditionFailed("work order has no plan".to_string()))?;
        if !plan.is_approved_for_execution() {
            return Err(OrchestratorError::PreconditionFailed(
                "plan requires approval before execution".to_string(),
            ));
        }
        if w.status.is_terminal() {
            return Err(OrchestratorError::PreconditionFailed(format!(
                "work order is already in terminal status {:?}",
                w.status
            )));
        }
        Ok(())
    }

    /// Cooperative wait while paused: blocks until the work order's status
    /// clears `Paused` or it is cancelled. Keyed off the WorkOrder's own
    /// status rather than `pause_rx` alone, since a checkpoint decision of
    /// `pause` sets that status without necessarily driving the pause watch
    /// channel; `pause_rx` is still used to wake promptly on `resume()`.
    /// Auto-resumes after `MAX_PAUSE_WINDOW`.
    async fn wait_while_paused(
        &self,
        wo: &Arc<RwLock<WorkOrder>>,
        pause_rx: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
        paused_at: &Arc<StdMutex<Option<Instant>>>,
    ) -> Result<()> {
        loop {
            if wo.read().await.status != WorkOrderStatus::Paused {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled(
                    "work order cancelled while paused".to_string(),
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled(
                        "work order cancelled while paused".to_string(),
                    ));
                }
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            let exceeded = paused_at
                .lock()
                .unwrap()
                .map(|at| at.elapsed() > MAX_PAUSE_WINDOW)
                .unwrap_or(false);
            if exceeded {
                tracing::warn!("max pause window exceeded; auto-resuming");
                *paused_at.lock().unwrap() = None;
                let mut w = wo.write().await;
                w.status = WorkOrderStatus::Executing;
                w.touch();
                return Ok(());
            }
        }
    }

    /// The main phase loop: activates the contract, spawns pods, runs each
    /// phase's task groups to completion, and resolves the phase's
    /// checkpoint before moving on.
    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        wo: Arc<RwLock<WorkOrder>>,
        work_order_id: WorkOrderId,
        execution_attempt_id: String,
        cancel: CancellationToken,
        mut pause_rx: watch::Receiver<bool>,
        paused_at: Arc<StdMutex<Option<Instant>>>,
        checkpoint_controller: Arc<crate::checkpoint::CheckpointController>,
        clarification_broker: Arc<ClarificationBroker>,
    ) -> Result<()> {
        let (scope, total_minutes) = {
            let w = wo.read().await;
            (w.scope.clone(), w.time_budget.total_minutes)
        };
        let deadline = Utc::now() + chrono::Duration::minutes(total_minutes.ceil().max(1.0) as i64);
        let contract = self
            .contract_service
            .create_contract(work_order_id.clone(), scope, u64::MAX, deadline)
            .await;
        self.contract_service.activate_contract(&contract.id).await?;

        {
            let mut w = wo.write().await;
            w.status = WorkOrderStatus::Executing;
            w.started_at = Some(Utc::now());
            w.execution_attempt_id = Some(execution_attempt_id);
            w.touch();
        }

        let (priority_order, max_concurrent) = {
            let w = wo.read().await;
            let plan = w.plan.as_ref().expect("validated above");
            (
                plan.pod_strategy.priority_order.clone(),
                plan.pod_strategy.max_concurrent.max(1) as usize,
            )
        };

        let mut active_pod_order: Vec<PodId> = Vec::new();
        let mut pods: HashMap<PodId, Pod> = HashMap::new();
        let mut pod_roles: HashMap<PodId, PodRole> = HashMap::new();
        let mut pod_contexts: HashMap<PodId, PoolContext> = HashMap::new();
        let mut pod_outcomes: HashMap<PodId, PodTaskOutcomes> = HashMap::new();
        let bus = MessageBus::new();
        let mut bus_rx: HashMap<PodId, mpsc::UnboundedReceiver<BusMessage>> = HashMap::new();

        for role in priority_order.iter().take(max_concurrent) {
            let (mut pod, context) = match self
                .pod_pool
                .reactivate_for_work_order(*role, &work_order_id)
                .await
            {
                Some(existing) => existing,
                None => {
                    self.pod_pool
                        .get_or_create_pod(*role, format!("{role:?}-pod"), work_order_id.clone())
                        .await
                }
            };
            pod.status = PodStatus::Idle;
            let behavior = role_behavior(*role);
            pod.model_config.system_prompt =
                format!("{}\n{}", behavior.system_prompt(), context.render());

            bus_rx.insert(pod.id.clone(), bus.subscribe(pod.id.clone()).await);
            active_pod_order.push(pod.id.clone());
            pod_roles.insert(pod.id.clone(), pod.role);
            pod_outcomes.insert(
                pod.id.clone(),
                PodTaskOutcomes {
                    time_allocated_minutes: total_minutes / priority_order.len().max(1) as f64,
                    ..Default::default()
                },
            );
            pod_contexts.insert(pod.id.clone(), context);
            pods.insert(pod.id.clone(), pod);
        }

        {
            let mut w = wo.write().await;
            w.active_pod_ids = active_pod_order.iter().cloned().collect();
            for (id, pod) in &pods {
                w.pods.insert(id.clone(), pod.clone());
            }
            w.touch();
        }

        let ticker_cancel = cancel.child_token();
        let ticker_wo = wo.clone();
        let ticker = crate::clock::Ticker::new(TICKER_PERIOD, ticker_cancel.clone());
        let ticker_handle = ticker.spawn(move || {
            let ticker_wo = ticker_wo.clone();
            tokio::spawn(async move {
                let mut w = ticker_wo.write().await;
                if w.status == WorkOrderStatus::Executing {
                    let delta = TICKER_PERIOD.as_secs_f64() / 60.0;
                    w.time_budget.tick(delta, None);
                }
            });
        });


        let phase_orders: Vec<i64> = {
            let w = wo.read().await;
            let mut orders: Vec<i64> = w
                .plan
                .as_ref()
                .expect("validated above")
                .phases
                .iter()
                .map(|p| p.order)
                .collect();
            orders.sort_unstable();
            orders
        };
        let phase_count = phase_orders.len().max(1);

        let mut completed_task_ids: HashSet<TaskId> = {
            let w = wo.read().await;
            w.plan
                .as_ref()
                .expect("validated above")
                .phases
                .iter()
                .flat_map(|p| &p.tasks)
                .filter(|t| t.status == TaskStatus::Complete)
                .map(|t| t.id.clone())
                .collect()
        };
        let mut total_tool_calls: u64 = 0;

        let run_result: Result<()> = async {
            for (phase_index, phase_order) in phase_orders.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(OrchestratorError::Cancelled("cancelled before phase start".to_string()));
                }
                self.wait_while_paused(&wo, &mut pause_rx, &cancel, &paused_at).await?;
                if wo.read().await.time_budget.is_exhausted() {
                    break;
                }

                let (phase_id, tasks_snapshot) = {
                    let w = wo.read().await;
                    let phase = w
                        .plan
                        .as_ref()
                        .expect("validated above")
                        .phases
                        .iter()
                        .find(|p| p.order == *phase_order)
                        .expect("phase order came from this same plan");
                    (phase.id.clone(), phase.tasks.clone())
                };

                {
                    let mut w = wo.write().await;
                    if let Some(phase) = w
                        .plan
                        .as_mut()
                        .unwrap()
                        .phases
                        .iter_mut()
                        .find(|p| p.id == phase_id)
                    {
                        phase.status = PhaseStatus::InProgress;
                    }
                    w.touch();
                }
                self.updates
                    .emit(
                        work_order_id.clone(),
                        UpdateEventType::PhaseStart,
                        json!({ "phaseId": phase_id, "order": phase_order }),
                    )
                    .await;

                let groups = build_task_groups(&tasks_snapshot, &completed_task_ids);
                let mut tasks_completed_in_phase = 0usize;
                let mut tasks_failed_in_phase = 0usize;

                for group in groups {
                    if cancel.is_cancelled() {
                        return Err(OrchestratorError::Cancelled("cancelled mid-phase".to_string()));
                    }
                    self.wait_while_paused(&wo, &mut pause_rx, &cancel, &paused_at).await?;
                    if wo.read().await.time_budget.is_exhausted() {
                        break;
                    }

                    let results = self
                        .run_task_group(
                            &wo,
                            &work_order_id,
                            &phase_id,
                            *phase_order,
                            &group,
                            &tasks_snapshot,
                            &mut pods,
                            &active_pod_order,
                            &pod_roles,
                            &contract,
                            clarification_broker.clone(),
                        )
                        .await;

                    for result in results {
                        total_tool_calls += result.outcome.tool_calls;
                        let entry = pod_outcomes.entry(result.pod_id.clone()).or_default();
                        if result.outcome.success {
                            entry.tasks_completed += 1;
                            tasks_completed_in_phase += 1;
                            completed_task_ids.insert(result.task.id.clone());
                            self.updates
                                .emit(
                                    work_order_id.clone(),
                                    UpdateEventType::TaskComplete,
                                    json!({ "taskId": result.task.id, "podId": result.pod_id }),
                                )
                                .await;
                        } else {
                            entry.tasks_failed += 1;
                            tasks_failed_in_phase += 1;
                            self.updates
                                .emit(
                                    work_order_id.clone(),
                                    UpdateEventType::TaskFailed,
                                    json!({ "taskId": result.task.id, "podId": result.pod_id, "error": result.outcome.error }),
                                )
                                .await;
                        }

                        let mut created_artifacts: Vec<(crate::types::ArtifactId, Option<String>)> =
                            Vec::new();
                        {
                            let mut w = wo.write().await;
                            for artifact in result.outcome.artifacts {
                                let path = artifact.path.clone();
                                let artifact_id = w.upsert_artifact(artifact);
                                created_artifacts.push((artifact_id, path));
                            }
                            if let Some(phase) = w.plan.as_mut().unwrap().phases.iter_mut().find(|p| p.id == result.phase_id) {
                                if let Some(t) = phase.tasks.iter_mut().find(|t| t.id == result.task.id) {
                                    t.status = if result.outcome.success {
                                        TaskStatus::Complete
                                    } else {
                                        TaskStatus::Failed
                                    };
                                    t.actual_duration_minutes =
                                        Some(result.outcome.execution_time_ms as f64 / 60_000.0);
                                    t.output = Some(result.outcome.output_text.clone());
                                }
                            }
                            w.pods.insert(result.pod_id.clone(), result.pod.clone());
                            w.time_budget.tick(
                                result.outcome.execution_time_ms as f64 / 60_000.0,
                                Some(&result.phase_id),
                            );
                            w.touch();
                        }
                        for (artifact_id, path) in created_artifacts {
                            self.updates
                                .emit(
                                    work_order_id.clone(),
                                    UpdateEventType::ArtifactCreated,
                                    json!({ "artifactId": artifact_id, "path": path }),
                                )
                                .await;
                            bus.publish(BusMessage {
                                id: new_id("bus"),
                                from: BusSender::Pod(result.pod_id.clone()),
                                to: BusRecipient::Broadcast,
                                message_type: BusMessageType::ArtifactReady,
                                payload: json!({ "artifactId": artifact_id, "path": path }),
                                priority: BusPriority::Normal,
                                timestamp: Utc::now(),
                            })
                            .await;
                        }
                        pods.insert(result.pod_id.clone(), result.pod);
                        self.contract_service
                            .record_usage(&contract.id, 0.0, result.outcome.tokens_used)
                            .await
                            .ok();
                    }
                }

                // A phase with no tasks at all (nothing attempted, nothing failed)
                // counts as succeeded rather than failed (spec §8 boundary case).
                let phase_success = tasks_completed_in_phase > tasks_failed_in_phase
                    || (tasks_completed_in_phase == 0 && tasks_failed_in_phase == 0);
                {
                    let mut w = wo.write().await;
                    if let Some(phase) = w
                        .plan
                        .as_mut()
                        .unwrap()
                        .phases
                        .iter_mut()
                        .find(|p| p.id == phase_id)
                    {
                        phase.status = if phase_success {
                            PhaseStatus::Complete
                        } else {
                            PhaseStatus::Failed
                        };
                        phase.completed_at = Some(Utc::now());
                    }
                    w.touch();
                }
                self.updates
                    .emit(
                        work_order_id.clone(),
                        UpdateEventType::PhaseComplete,
                        json!({ "phaseId": phase_id, "success": phase_success }),
                    )
                    .await;

                let checkpoint_id = {
                    let mut w = wo.write().await;
                    let checkpoint =
                        Checkpoint::for_phase_complete(format!("phase {phase_order} complete"));
                    let id = checkpoint.id.clone();
                    w.checkpoints.push(checkpoint);
                    w.touch();
                    id
                };
                let checkpoint_outcome = checkpoint_controller
                    .resolve(&work_order_id, &checkpoint_id, &cancel)
                    .await?;
                match checkpoint_outcome {
                    crate::checkpoint::CheckpointOutcome::Continue => {}
                    crate::checkpoint::CheckpointOutcome::Pause => {
                        {
                            let mut w = wo.write().await;
                            w.status = WorkOrderStatus::Paused;
                            w.touch();
                        }
                        *paused_at.lock().unwrap() = Some(Instant::now());
                        self.wait_while_paused(&wo, &mut pause_rx, &cancel, &paused_at).await?;
                    }
                    crate::checkpoint::CheckpointOutcome::Cancel => {
                        return Err(OrchestratorError::Cancelled(
                            "cancelled at checkpoint decision".to_string(),
                        ));
                    }
                }

                let progress = (((phase_index + 1) as f64 / phase_count as f64) * 100.0).round() as u8;
                {
                    let mut w = wo.write().await;
                    w.progress = progress;
                    w.touch();
                }
                self.updates
                    .emit(
                        work_order_id.clone(),
                        UpdateEventType::ProgressUpdate,
                        json!({ "progress": progress }),
                    )
                    .await;

                if wo.read().await.time_budget.is_exhausted() {
                    break;
                }
            }
            Ok(())
        }
        .await;

        ticker_cancel.cancel();
        let _ = ticker_handle.await;

        match run_result {
            Ok(()) => {
                self.finish_successfully(
                    &wo,
                    &work_order_id,
                    &contract.id,
                    pods,
                    pod_contexts,
                    &pod_outcomes,
                    total_tool_calls,
                )
                .await
            }
            Err(OrchestratorError::Cancelled(reason)) => {
                tracing::info!(work_order_id, reason, "execution cancelled");
                self.finish_cancelled(&wo, &work_order_id, &contract.id, pods, pod_contexts)
                    .await;
                Ok(())
            }
            Err(err) => {
                self.finish_with_failure(
                    &wo,
                    &work_order_id,
                    &contract.id,
                    pods,
                    pod_contexts,
                    &pod_outcomes,
                    total_tool_calls,
                    &err,
                )
                .await;
                Err(err)
            }
        }
    }

    /// Runs one task group: selects a pod per task, builds its prompt, and
    /// executes all tasks in the group concurrently, all-settled (one
    /// task's failure doesn't abort its siblings). Tasks that select the
    /// same pod (spec §4.2 selection step 3's "first active pod regardless
    /// of status — it will queue") are queued onto that pod and run
    /// serially on it, rather than one silently replacing another; distinct
    /// pods still run fully concurrently with each other.
    #[allow(clippy::too_many_arguments)]
    async fn run_task_group(
        &self,
        wo: &Arc<RwLock<WorkOrder>>,
        work_order_id: &WorkOrderId,
        phase_id: &str,
        phase_order: i64,
        group: &[TaskId],
        tasks_snapshot: &[Task],
        pods: &mut HashMap<PodId, Pod>,
        active_pod_order: &[PodId],
        pod_roles: &HashMap<PodId, PodRole>,
        contract: &crate::types::Contract,
        clarification_broker: Arc<ClarificationBroker>,
    ) -> Vec<GroupTaskResult> {
        // Assignment pass: pick a pod per task without removing any pod from
        // `pods` yet. Removing eagerly would make `select_pod_for_task`'s
        // idle-pod fallback blind to a pod already claimed earlier in this
        // same group, so a second task needing it would find nothing and be
        // dropped. Tasks landing on the same pod are collected, in group
        // order, to run one after another on it.
        let mut pod_order: Vec<PodId> = Vec::new();
        let mut tasks_by_pod: HashMap<PodId, Vec<Task>> = HashMap::new();
        for task_id in group {
            let Some(task) = tasks_snapshot.iter().find(|t| &t.id == task_id).cloned() else {
                continue;
            };
            let Some(selected_pod_id) =
                select_pod_for_task(&task, active_pod_order, pods).map(|p| p.id.clone())
            else {
                continue;
            };
            if !tasks_by_pod.contains_key(&selected_pod_id) {
                pod_order.push(selected_pod_id.clone());
            }
            tasks_by_pod.entry(selected_pod_id).or_default().push(task);
        }

        let mut join_set: JoinSet<Vec<GroupTaskResult>> = JoinSet::new();

        for selected_pod_id in pod_order {
            let Some(mut pod) = pods.remove(&selected_pod_id) else {
                continue;
            };
            let queued_tasks = tasks_by_pod.remove(&selected_pod_id).unwrap_or_default();

            let model_client = self.model_client.clone();
            let tool_dispatcher = self.tool_dispatcher.clone();
            let contract_service = self.contract_service.clone();
            let contract_id = contract.id.clone();
            let clarification_broker = clarification_broker.clone();
            let updates = self.updates.clone();
            let wo = wo.clone();
            let pod_roles = pod_roles.clone();
            let work_order_id_owned = work_order_id.clone();
            let phase_id_owned = phase_id.to_string();

            join_set.spawn(async move {
                let mut results = Vec::with_capacity(queued_tasks.len());
                for task in queued_tasks {
                    let (artifacts_snapshot, phases_snapshot, remaining_minutes, objective, quality_target) = {
                        let w = wo.read().await;
                        (
                            w.artifacts.clone(),
                            w.plan.as_ref().map(|p| p.phases.clone()).unwrap_or_default(),
                            w.time_budget.remaining_minutes,
                            w.objective.clone(),
                            format!("{:?}", w.quality_target),
                        )
                    };

                    let behavior = role_behavior(pod.role);
                    let artifact_slice = build_artifact_context_slice(
                        behavior.as_ref(),
                        phase_order,
                        &phases_snapshot,
                        &artifacts_snapshot,
                        &pod_roles,
                    );
                    let inbox_messages: Vec<String> = pod
                        .message_log
                        .iter()
                        .rev()
                        .take(INBOX_INJECT_LIMIT)
                        .cloned()
                        .collect();
                    pod.message_log.clear();
                    let recent_errors: Vec<String> = pod
                        .health
                        .warnings
                        .iter()
                        .rev()
                        .take(RECENT_ERROR_WARNING_COUNT)
                        .cloned()
                        .collect();

                    let prompt = build_task_prompt(
                        &task,
                        &objective,
                        &quality_target,
                        remaining_minutes,
                        &artifact_slice,
                        &inbox_messages,
                        &recent_errors,
                    );

                    updates
                        .emit(
                            work_order_id_owned.clone(),
                            UpdateEventType::TaskStart,
                            json!({ "taskId": task.id, "podId": selected_pod_id.clone() }),
                        )
                        .await;

                    let sink = EngineStreamSink {
                        updates: updates.clone(),
                        work_order_id: work_order_id_owned.clone(),
                        pod_id: selected_pod_id.clone(),
                    };

                    let outcome = execute_task(
                        &mut pod,
                        behavior.as_ref(),
                        &task,
                        prompt,
                        model_client.as_ref(),
                        tool_dispatcher.as_ref(),
                        &contract_service,
                        &contract_id,
                        clarification_broker.as_ref(),
                        &work_order_id_owned,
                        &sink,
                    )
                    .await;

                    results.push(GroupTaskResult {
                        pod_id: selected_pod_id.clone(),
                        pod: pod.clone(),
                        task,
                        phase_id: phase_id_owned.clone(),
                        outcome,
                    });
                }
                results
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(chain_results) => results.extend(chain_results),
                Err(err) => tracing::error!(error = %err, "task group join failed"),
            }
        }
        results
    }

    /// Completion path: receipt, contract fulfillment, pods returned to the
    /// pool, terminal transition.
    #[allow(clippy::too_many_arguments)]
    async fn finish_successfully(
        &self,
        wo: &Arc<RwLock<WorkOrder>>,
        work_order_id: &WorkOrderId,
        contract_id: &ContractId,
        pods: HashMap<PodId, Pod>,
        pod_contexts: HashMap<PodId, PoolContext>,
        pod_outcomes: &HashMap<PodId, PodTaskOutcomes>,
        total_tool_calls: u64,
    ) -> Result<()> {
        {
            let mut w = wo.write().await;
            w.status = WorkOrderStatus::Completing;
            w.touch();
        }

        let unfinished_items: Vec<String> = {
            let w = wo.read().await;
            w.plan
                .as_ref()
                .map(|p| {
                    p.phases
                        .iter()
                        .filter(|phase| phase.status != PhaseStatus::Complete)
                        .map(|phase| phase.name.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let receipt = {
            let w = wo.read().await;
            generate_receipt(
                &w,
                pod_outcomes,
                &unfinished_items,
                total_tool_calls,
                self.auxiliary_model.as_ref(),
            )
            .await
        };

        self.contract_service.fulfill_contract(contract_id).await.ok();
        self.return_pods_to_pool(pods, pod_contexts).await;

        {
            let mut w = wo.write().await;
            w.receipt = Some(receipt);
            w.status = WorkOrderStatus::Completed;
            w.completed_at = Some(Utc::now());
            w.progress = 100;
            w.touch();
        }
        self.updates
            .emit(
                work_order_id.clone(),
                UpdateEventType::ExecutionComplete,
                json!({ "success": true }),
            )
            .await;
        self.schedule_workspace_cleanup(WORKSPACE_CLEANUP_DELAY_SUCCESS);
        Ok(())
    }

    /// Failure path: any unrecoverable error bubbles to the engine.
    /// Partially delivered artifacts already live on the
    /// WorkOrder from each task-completion handler.
    #[allow(clippy::too_many_arguments)]
    async fn finish_with_failure(
        &self,
        wo: &Arc<RwLock<WorkOrder>>,
        work_order_id: &WorkOrderId,
        contract_id: &ContractId,
        pods: HashMap<PodId, Pod>,
        pod_contexts: HashMap<PodId, PoolContext>,
        pod_outcomes: &HashMap<PodId, PodTaskOutcomes>,
        total_tool_calls: u64,
        error: &OrchestratorError,
    ) {
        let unfinished_items: Vec<String> = {
            let w = wo.read().await;
            w.plan
                .as_ref()
                .map(|p| {
                    p.phases
                        .iter()
                        .filter(|phase| phase.status != PhaseStatus::Complete)
                        .map(|phase| phase.name.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        let receipt = {
            let w = wo.read().await;
            generate_receipt(
                &w,
                pod_outcomes,
                &unfinished_items,
                total_tool_calls,
                self.auxiliary_model.as_ref(),
            )
            .await
        };

        self.contract_service.fulfill_contract(contract_id).await.ok();
        self.return_pods_to_pool(pods, pod_contexts).await;

        {
            let mut w = wo.write().await;
            w.receipt = Some(receipt);
            w.status = WorkOrderStatus::Failed;
            w.completed_at = Some(Utc::now());
            w.touch();
        }
        self.updates
            .emit(
                work_order_id.clone(),
                UpdateEventType::Error,
                json!({ "message": error.to_string(), "kind": error.kind() }),
            )
            .await;
        self.updates
            .emit(
                work_order_id.clone(),
                UpdateEventType::ExecutionComplete,
                json!({ "success": false }),
            )
            .await;
        self.schedule_workspace_cleanup(WORKSPACE_CLEANUP_DELAY_FAILURE);
    }

    async fn finish_cancelled(
        &self,
        wo: &Arc<RwLock<WorkOrder>>,
        work_order_id: &WorkOrderId,
        contract_id: &ContractId,
        pods: HashMap<PodId, Pod>,
        pod_contexts: HashMap<PodId, PoolContext>,
    ) {
        self.contract_service.fulfill_contract(contract_id).await.ok();
        self.return_pods_to_pool(pods, pod_contexts).await;

        {
            let mut w = wo.write().await;
            w.status = WorkOrderStatus::Cancelled;
            w.completed_at = Some(Utc::now());
            w.touch();
        }
        self.updates
            .emit(
                work_order_id.clone(),
                UpdateEventType::ExecutionComplete,
                json!({ "success": false, "reason": "cancelled" }),
            )
            .await;
        // A cancel deletes any workspace immediately; this crate has no
        // workspace of its own, so there is nothing further to do here.
    }

    async fn return_pods_to_pool(
        &self,
        pods: HashMap<PodId, Pod>,
        mut pod_contexts: HashMap<PodId, PoolContext>,
    ) {
        for (pod_id, pod) in pods {
            let context = pod_contexts.remove(&pod_id).unwrap_or_default();
            let summary = format!(
                "completed {} task(s), used {} token(s)",
                pod.completed_tasks.len(),
                pod.resource_usage.tokens_used
            );
            let completed_task_descriptions: Vec<String> = pod.completed_tasks.clone();
            self.pod_pool
                .return_pod_to_pool(pod, context, summary, &completed_task_descriptions)
                .await;
        }
    }

    /// Schedules workspace cleanup after a delay. This crate owns no
    /// workspace lifecycle itself; the delay is surfaced so a host binary
    /// can wire in the actual teardown call.
    fn schedule_workspace_cleanup(&self, delay: Duration) {
        tracing::debug!(delay_secs = delay.as_secs(), "workspace cleanup scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_client::{ModelMessage, ToolResultMessage};
    use crate::tool_dispatcher::{ToolRequest, ToolResponse};
    use crate::types::{
        Authority, Phase, Plan, PodStrategy, PodStrategyMode, QualityTarget, ScopePattern, Task,
        WorkOrder,
    };
    use async_trait::async_trait;

    struct EchoModelClient;

    #[async_trait]
    impl ModelClient for EchoModelClient {
        async fn stream(
            &self,
            _config: &crate::types::ModelConfig,
            _history: &[ModelMessage],
            sink: &dyn StreamSink,
        ) -> Result<Vec<ToolUseRequest>> {
            sink.on_text("working on it").await;
            sink.on_complete(42).await;
            Ok(Vec::new())
        }

        async fn continue_with_tool_result(
            &self,
            _config: &crate::types::ModelConfig,
            _history: &[ModelMessage],
            _result: ToolResultMessage,
            _sink: &dyn StreamSink,
        ) -> Result<Vec<ToolUseRequest>> {
            Ok(Vec::new())
        }
    }

    struct NoopToolDispatcher;

    #[async_trait]
    impl ToolDispatcher for NoopToolDispatcher {
        async fn dispatch(&self, request: ToolRequest) -> Result<ToolResponse> {
            Ok(ToolResponse {
                result: json!({ "ok": true, "tool": request.tool }),
                duration_ms: 1,
            })
        }
    }

    fn single_phase_work_order() -> WorkOrder {
        let mut wo = WorkOrder::new("Ship a landing page", 30.0);
        wo.authority = Authority::Autonomous;
        let mut phase = Phase::new("phase_1", "Build", 0);
        phase.tasks.push(Task::new("task_1", "Write index.html"));
        phase.tasks.push(Task::new("task_2", "Write style.css"));
        let plan = Plan {
            phases: vec![phase],
            pod_strategy: PodStrategy {
                mode: PodStrategyMode::Parallel,
                max_concurrent: 2,
                priority_order: vec![PodRole::Frontend],
                dependencies: HashMap::new(),
            },
            requires_approval: false,
            approved_at: None,
        };
        wo.plan = Some(plan);
        wo.quality_target = QualityTarget::Standard;
        wo.scope = ScopePattern::default();
        wo
    }

    #[tokio::test]
    async fn execute_runs_to_completion_and_is_idempotent() {
        let engine = ExecutionEngine::new(Arc::new(EchoModelClient), Arc::new(NoopToolDispatcher), None);
        let work_order_id = engine.register(single_phase_work_order()).await;

        engine
            .execute(&work_order_id, ExecuteOptions::default())
            .await
            .unwrap();

        let state = engine.get_state(&work_order_id).await.unwrap();
        assert_eq!(state.status, WorkOrderStatus::Completed);
        assert_eq!(state.progress, 100);
        assert!(state.receipt.is_some());
        assert!(!engine.is_running(&work_order_id).await);

        // A second execute against a completed work order fails preconditions
        // (terminal state), not a silent idempotent no-op, since it is not
        // mid-flight.
        let second = engine.execute(&work_order_id, ExecuteOptions::default()).await;
        assert!(matches!(second, Err(OrchestratorError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn execute_without_plan_fails_precondition() {
        let engine = ExecutionEngine::new(Arc::new(EchoModelClient), Arc::new(NoopToolDispatcher), None);
        let work_order_id = engine.register(WorkOrder::new("objective", 10.0)).await;
        let result = engine.execute(&work_order_id, ExecuteOptions::default()).await;
        assert!(matches!(result, Err(OrchestratorError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn pause_outside_running_execution_fails() {
        let engine = ExecutionEngine::new(Arc::new(EchoModelClient), Arc::new(NoopToolDispatcher), None);
        let work_order_id = engine.register(single_phase_work_order()).await;
        let result = engine.pause(&work_order_id).await;
        assert!(matches!(result, Err(OrchestratorError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn cancel_before_execute_transitions_non_terminal_work_order() {
        let engine = ExecutionEngine::new(Arc::new(EchoModelClient), Arc::new(NoopToolDispatcher), None);
        let work_order_id = engine.register(single_phase_work_order()).await;
        engine.cancel(&work_order_id).await.unwrap();
        let state = engine.get_state(&work_order_id).await.unwrap();
        assert_eq!(state.status, WorkOrderStatus::Cancelled);
        // idempotent: cancelling an already-cancelled work order is a no-op.
        engine.cancel(&work_order_id).await.unwrap();
    }

    #[tokio::test]
    async fn requires_approval_without_approval_blocks_execute() {
        let engine = ExecutionEngine::new(Arc::new(EchoModelClient), Arc::new(NoopToolDispatcher), None);
        let mut wo = single_phase_work_order();
        wo.plan.as_mut().unwrap().requires_approval = true;
        let work_order_id = engine.register(wo).await;
        let result = engine.execute(&work_order_id, ExecuteOptions::default()).await;
        assert!(matches!(result, Err(OrchestratorError::PreconditionFailed(_))));
    }
}
