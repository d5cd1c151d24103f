//! Data model for the work-order execution engine (spec §3).
//!
//! Entities are stored in flat, id-keyed tables; every cross-entity
//! reference is an id, never an owning reference, so the cyclic
//! WorkOrder <-> Pod <-> Artifact <-> Task graph the spec describes stays
//! representable in safe Rust (spec §9 "Cyclic object graphs").

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WorkOrderId = String;
pub type PhaseId = String;
pub type TaskId = String;
pub type PodId = String;
pub type ArtifactId = String;
pub type CheckpointId = String;
pub type PauseRequestId = String;
pub type ContractId = String;
pub type EventId = String;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4())
}

// ============================================================================
// WorkOrder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Draft,
    Planning,
    AwaitingApproval,
    Executing,
    Paused,
    PausedWaitingForUser,
    Checkpoint,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTarget {
    Draft,
    Standard,
    Premium,
    AppleLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    NoAutonomy,
    Guided,
    Supervised,
    Autonomous,
}

impl Authority {
    pub fn is_autonomous(self) -> bool {
        matches!(self, Self::Autonomous)
    }

    /// `autonomous` or `supervised` resolve clarifications with an auxiliary
    /// model session instead of waiting on a human (spec §4.6).
    pub fn auto_resolves_clarification(self) -> bool {
        matches!(self, Self::Autonomous | Self::Supervised)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBudget {
    pub total_minutes: f64,
    pub elapsed_minutes: f64,
    pub remaining_minutes: f64,
    /// Per-phase sub-ledger: phase id -> minutes spent.
    #[serde(default)]
    pub per_phase_minutes: HashMap<PhaseId, f64>,
}

impl TimeBudget {
    pub fn new(total_minutes: f64) -> Self {
        Self {
            total_minutes,
            elapsed_minutes: 0.0,
            remaining_minutes: total_minutes,
            per_phase_minutes: HashMap::new(),
        }
    }

    /// Invariant: `elapsed + remaining == total` and both are >= 0 (spec §8 prop 2).
    pub fn is_consistent(&self) -> bool {
        self.elapsed_minutes >= 0.0
            && self.remaining_minutes >= 0.0
            && (self.elapsed_minutes + self.remaining_minutes - self.total_minutes).abs() < 1e-6
    }

    pub fn tick(&mut self, delta_minutes: f64, phase: Option<&PhaseId>) {
        let delta = delta_minutes.max(0.0).min(self.remaining_minutes);
        self.elapsed_minutes += delta;
        self.remaining_minutes -= delta;
        if let Some(phase) = phase {
            *self.per_phase_minutes.entry(phase.clone()).or_insert(0.0) += delta;
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_minutes <= 0.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopePattern {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
    #[serde(default)]
    pub allowed_path_prefixes: Vec<String>,
    #[serde(default)]
    pub forbidden_path_prefixes: Vec<String>,
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
    #[serde(default)]
    pub max_concurrent_pods: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStrategy {
    pub mode: PodStrategyMode,
    pub max_concurrent: u32,
    pub priority_order: Vec<PodRole>,
    /// role -> roles it depends on.
    #[serde(default)]
    pub dependencies: HashMap<PodRole, Vec<PodRole>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStrategyMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub phases: Vec<Phase>,
    pub pod_strategy: PodStrategy,
    pub requires_approval: bool,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Plan {
    /// `requiresApproval ⇒ approvedAt != null` before execution may start (spec §3).
    pub fn is_approved_for_execution(&self) -> bool {
        !self.requires_approval || self.approved_at.is_some()
    }

    /// Invariant: every `dependsOn` id refers to a phase with a strictly smaller `order`.
    pub fn validate_phase_ordering(&self) -> crate::error::Result<()> {
        let order_by_id: HashMap<&PhaseId, i64> =
            self.phases.iter().map(|p| (&p.id, p.order)).collect();
        for phase in &self.phases {
            for dep in &phase.depends_on {
                match order_by_id.get(dep) {
                    Some(dep_order) if *dep_order < phase.order => {}
                    Some(_) => {
                        return Err(crate::error::OrchestratorError::PreconditionFailed(format!(
                            "phase '{}' depends on phase '{dep}' which does not precede it",
                            phase.id
                        )))
                    }
                    None => {
                        return Err(crate::error::OrchestratorError::PreconditionFailed(format!(
                            "phase '{}' depends on unknown phase '{dep}'",
                            phase.id
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub name: String,
    pub order: i64,
    pub description: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub depends_on: HashSet<PhaseId>,
    #[serde(default)]
    pub assigned_pods: HashSet<PodId>,
    pub status: PhaseStatus,
    pub progress: u8,
    pub estimated_duration_minutes: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order,
            description: String::new(),
            tasks: Vec::new(),
            depends_on: HashSet::new(),
            assigned_pods: HashSet::new(),
            status: PhaseStatus::Pending,
            progress: 0,
            estimated_duration_minutes: 0.0,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub estimated_duration_minutes: f64,
    #[serde(default)]
    pub assigned_pod: Option<PodId>,
    #[serde(default)]
    pub depends_on: HashSet<TaskId>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub actual_duration_minutes: Option<f64>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            estimated_duration_minutes: 0.0,
            assigned_pod: None,
            depends_on: HashSet::new(),
            output: None,
            actual_duration_minutes: None,
        }
    }
}

// ============================================================================
// Pod
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodRole {
    Frontend,
    Backend,
    Qa,
    Research,
    Orchestrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    Initializing,
    Idle,
    Working,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodHealth {
    pub status: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub warnings: Vec<String>,
}

impl PodHealth {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_heartbeat: Utc::now(),
            error_count: 0,
            consecutive_failures: 0,
            warnings: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_heartbeat = Utc::now();
        self.recompute_status();
    }

    pub fn record_failure(&mut self, warning: impl Into<String>) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.last_heartbeat = Utc::now();
        self.warnings.push(warning.into());
        self.recompute_status();
    }

    fn recompute_status(&mut self) {
        use crate::config::{
            POD_HEALTH_CRITICAL_CONSECUTIVE_FAILURES, POD_HEALTH_WARNING_CONSECUTIVE_FAILURES,
        };
        self.status = if self.status == HealthStatus::Dead {
            HealthStatus::Dead
        } else if self.consecutive_failures >= POD_HEALTH_CRITICAL_CONSECUTIVE_FAILURES {
            HealthStatus::Critical
        } else if self.consecutive_failures >= POD_HEALTH_WARNING_CONSECUTIVE_FAILURES {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
    }

    pub fn mark_dead(&mut self) {
        self.status = HealthStatus::Dead;
    }
}

impl Default for PodHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub tokens_used: u64,
    pub api_calls: u64,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodOutput {
    pub task_id: TaskId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub role: PodRole,
    pub name: String,
    pub status: PodStatus,
    pub health: PodHealth,
    pub model_config: ModelConfig,
    /// Empty set means "all tools permitted".
    #[serde(default)]
    pub tool_whitelist: HashSet<String>,
    pub memory_scope: String,
    pub current_task: Option<TaskId>,
    pub task_queue: std::collections::VecDeque<TaskId>,
    pub completed_tasks: Vec<TaskId>,
    pub outputs: Vec<PodOutput>,
    pub resource_usage: ResourceUsage,
    pub message_log: std::collections::VecDeque<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owning_work_order_id: WorkOrderId,
}

impl Pod {
    pub fn new(role: PodRole, name: impl Into<String>, work_order_id: WorkOrderId) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("pod"),
            role,
            name: name.into(),
            status: PodStatus::Initializing,
            health: PodHealth::new(),
            model_config: ModelConfig {
                provider: "default".to_string(),
                model: "default".to_string(),
                temperature: 0.2,
                max_tokens: 4096,
                system_prompt: String::new(),
            },
            tool_whitelist: HashSet::new(),
            memory_scope: String::new(),
            current_task: None,
            task_queue: std::collections::VecDeque::new(),
            completed_tasks: Vec::new(),
            outputs: Vec::new(),
            resource_usage: ResourceUsage::default(),
            message_log: std::collections::VecDeque::new(),
            created_at: now,
            updated_at: now,
            owning_work_order_id: work_order_id,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, PodStatus::Idle)
    }

    pub fn log_message(&mut self, message: impl Into<String>) {
        self.message_log.push_back(message.into());
        while self.message_log.len() > crate::config::POD_MESSAGE_LOG_CAP {
            self.message_log.pop_front();
        }
    }
}

// ============================================================================
// Artifact
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Code,
    Document,
    Design,
    File,
    Data,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Final,
    Review,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArtifactContent {
    Text(String),
    Structured(serde_json::Value),
}

impl ArtifactContent {
    pub fn line_count(&self) -> usize {
        match self {
            ArtifactContent::Text(s) => s.lines().count(),
            ArtifactContent::Structured(_) => 0,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArtifactContent::Text(s) => Some(s.as_str()),
            ArtifactContent::Structured(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub work_order_id: WorkOrderId,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub description: String,
    pub content: ArtifactContent,
    pub path: Option<String>,
    pub created_by: PodId,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    pub status: ArtifactStatus,
    pub previous_version: Option<ArtifactId>,
}

/// Normalizes a path for the artifact-uniqueness invariant (spec §3, §8 prop 4).
pub fn normalize_artifact_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches("./");
    let mut normalized = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized.join("/")
}

// ============================================================================
// Checkpoint
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    PhaseComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Reached,
    Approved,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointAction {
    Continue,
    ContinueWithChanges,
    Pause,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDecision {
    pub action: CheckpointAction,
    pub feedback: Option<String>,
    pub decided_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub name: String,
    pub trigger_condition: TriggerCondition,
    pub status: CheckpointStatus,
    pub reached_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision: Option<CheckpointDecision>,
}

impl Checkpoint {
    pub fn for_phase_complete(name: impl Into<String>) -> Self {
        Self {
            id: new_id("checkpoint"),
            name: name.into(),
            trigger_condition: TriggerCondition::PhaseComplete,
            status: CheckpointStatus::Pending,
            reached_at: None,
            decided_at: None,
            decision: None,
        }
    }
}

// ============================================================================
// PauseRequest
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseRequestStatus {
    Pending,
    Answered,
    Inferred,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRequest {
    pub id: PauseRequestId,
    pub reason: String,
    pub question: String,
    pub options: Vec<String>,
    pub context: String,
    pub status: PauseRequestStatus,
    pub user_response: Option<String>,
    pub inferred_values: Option<String>,
    pub content_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PauseRequest {
    pub fn new(question: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: new_id("pause"),
            reason: reason.into(),
            question: question.into(),
            options: Vec::new(),
            context: String::new(),
            status: PauseRequestStatus::Pending,
            user_response: None,
            inferred_values: None,
            content_tag: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

// ============================================================================
// BusMessage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMessageType {
    TaskAssignment,
    StatusUpdate,
    Question,
    Result,
    Error,
    ArtifactReady,
    ClarificationRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusRecipient {
    Pod(PodId),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusSender {
    Pod(PodId),
    Engine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub from: BusSender,
    pub to: BusRecipient,
    pub message_type: BusMessageType,
    pub payload: serde_json::Value,
    pub priority: BusPriority,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// UpdateEvent
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateEventType {
    PhaseStart,
    PhaseComplete,
    TaskStart,
    TaskComplete,
    TaskFailed,
    PodMessage,
    ArtifactCreated,
    CheckpointReached,
    ProgressUpdate,
    Error,
    ExecutionComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub id: EventId,
    pub work_order_id: WorkOrderId,
    #[serde(rename = "type")]
    pub event_type: UpdateEventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

// ============================================================================
// Contract
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Draft,
    Active,
    Fulfilled,
    Violated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLedger {
    pub tokens_used: u64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractBudget {
    pub max_tokens: u64,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub work_order_id: WorkOrderId,
    pub created_at: DateTime<Utc>,
    pub scope: ScopePattern,
    pub budget: ContractBudget,
    pub status: ContractStatus,
    pub usage: UsageLedger,
}

// ============================================================================
// Receipt
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub summary: String,
    pub accomplishments: Vec<String>,
    pub unfinished_items: Vec<String>,
    pub files_created: usize,
    pub total_lines: usize,
    pub tokens_used: u64,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodReceipt {
    pub pod_id: PodId,
    pub role: PodRole,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tokens_used: u64,
    pub time_allocated_minutes: f64,
    pub time_used_minutes: f64,
    pub success_rate: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalReceipt {
    pub build_status: BuildStatus,
    pub pod_receipts: HashMap<PodId, PodReceipt>,
    pub total_tokens: u64,
    pub total_tool_calls: u64,
    pub total_execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseEventRecord {
    pub pause_request_id: PauseRequestId,
    pub reason: String,
    pub question: String,
    pub status: PauseRequestStatus,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    Revert,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub order: u32,
    pub artifact_id: ArtifactId,
    pub path: Option<String>,
    pub action: RollbackAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub can_rollback: bool,
    pub entries: Vec<RollbackEntry>,
    pub limitations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub executive: ExecutiveSummary,
    pub technical: TechnicalReceipt,
    pub pause_events: Vec<PauseEventRecord>,
    pub rollback: RollbackPlan,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// WorkOrder (root entity)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: WorkOrderId,
    pub type_tag: String,
    pub status: WorkOrderStatus,
    pub objective: String,
    pub time_budget: TimeBudget,
    pub quality_target: QualityTarget,
    pub scope: ScopePattern,
    pub authority: Authority,
    pub plan: Option<Plan>,
    pub pods: HashMap<PodId, Pod>,
    pub active_pod_ids: HashSet<PodId>,
    pub artifacts: Vec<Artifact>,
    pub checkpoints: Vec<Checkpoint>,
    pub pause_requests: Vec<PauseRequest>,
    pub active_pause_id: Option<PauseRequestId>,
    pub progress: u8,
    pub receipt: Option<Receipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_attempt_id: Option<String>,
}

impl WorkOrder {
    pub fn new(objective: impl Into<String>, total_minutes: f64) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("wo"),
            type_tag: "work_order".to_string(),
            status: WorkOrderStatus::Draft,
            objective: objective.into(),
            time_budget: TimeBudget::new(total_minutes),
            quality_target: QualityTarget::Standard,
            scope: ScopePattern::default(),
            authority: Authority::Guided,
            plan: None,
            pods: HashMap::new(),
            active_pod_ids: HashSet::new(),
            artifacts: Vec::new(),
            checkpoints: Vec::new(),
            pause_requests: Vec::new(),
            active_pause_id: None,
            progress: 0,
            receipt: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            execution_attempt_id: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Merges or inserts an artifact by normalized path, incrementing `version`
    /// on collision (spec §3 Artifact invariant, §8 prop 4).
    pub fn upsert_artifact(&mut self, mut artifact: Artifact) -> ArtifactId {
        let normalized = artifact.path.as_deref().map(normalize_artifact_path);
        if let Some(normalized) = normalized {
            if let Some(existing) = self.artifacts.iter_mut().find(|a| {
                a.path
                    .as_deref()
                    .map(normalize_artifact_path)
                    .as_deref()
                    == Some(normalized.as_str())
            }) {
                artifact.version = existing.version + 1;
                artifact.previous_version = Some(existing.id.clone());
                artifact.id = existing.id.clone();
                *existing = artifact;
                return existing_id(&self.artifacts, &normalized);
            }
        }
        let id = artifact.id.clone();
        self.artifacts.push(artifact);
        id
    }
}

fn existing_id(artifacts: &[Artifact], normalized_path: &str) -> ArtifactId {
    artifacts
        .iter()
        .find(|a| {
            a.path.as_deref().map(normalize_artifact_path).as_deref() == Some(normalized_path)
        })
        .map(|a| a.id.clone())
        .expect("artifact just upserted must exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_budget_consistent_after_tick() {
        let mut budget = TimeBudget::new(60.0);
        budget.tick(20.0, None);
        assert!(budget.is_consistent());
        assert_eq!(budget.elapsed_minutes, 20.0);
        assert_eq!(budget.remaining_minutes, 40.0);
    }

    #[test]
    fn time_budget_clamps_overshoot() {
        let mut budget = TimeBudget::new(10.0);
        budget.tick(100.0, None);
        assert!(budget.is_consistent());
        assert!(budget.is_exhausted());
    }

    #[test]
    fn normalize_artifact_path_collapses_dot_segments() {
        assert_eq!(normalize_artifact_path("./src/../src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_artifact_path("src/lib.rs"), "src/lib.rs");
    }

    #[test]
    fn upsert_artifact_increments_version_on_path_collision() {
        let mut wo = WorkOrder::new("build thing", 60.0);
        let a1 = Artifact {
            id: new_id("artifact"),
            work_order_id: wo.id.clone(),
            name: "index.html".into(),
            artifact_type: ArtifactType::File,
            description: String::new(),
            content: ArtifactContent::Text("<html></html>".into()),
            path: Some("index.html".into()),
            created_by: "pod_1".into(),
            created_at: Utc::now(),
            version: 1,
            status: ArtifactStatus::Draft,
            previous_version: None,
        };
        wo.upsert_artifact(a1);
        let a2 = Artifact {
            id: new_id("artifact"),
            work_order_id: wo.id.clone(),
            name: "index.html".into(),
            artifact_type: ArtifactType::File,
            description: String::new(),
            content: ArtifactContent::Text("<html>v2</html>".into()),
            path: Some("./index.html".into()),
            created_by: "pod_1".into(),
            created_at: Utc::now(),
            version: 1,
            status: ArtifactStatus::Draft,
            previous_version: None,
        };
        wo.upsert_artifact(a2);
        assert_eq!(wo.artifacts.len(), 1);
        assert_eq!(wo.artifacts[0].version, 2);
    }

    #[test]
    fn plan_phase_ordering_rejects_forward_dependency() {
        let mut p1 = Phase::new("p1", "Phase 1", 1);
        let p0 = Phase::new("p0", "Phase 0", 0);
        p1.depends_on.insert("p2".to_string());
        let plan = Plan {
            phases: vec![p0, p1, Phase::new("p2", "Phase 2", 2)],
            pod_strategy: PodStrategy {
                mode: PodStrategyMode::Sequential,
                max_concurrent: 1,
                priority_order: vec![],
                dependencies: HashMap::new(),
            },
            requires_approval: false,
            approved_at: None,
        };
        assert!(plan.validate_phase_ordering().is_err());
    }
}
