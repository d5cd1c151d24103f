//! Receipt generator: summarizes an execution into executive, technical,
//! pause-event, and rollback sections.

use std::collections::HashMap;

use chrono::Utc;

use crate::config::RECEIPT_SUCCESS_QUALITY_THRESHOLD;
use crate::model_client::{ModelMessage, StreamSink, ToolUseRequest};
use crate::pause::AuxiliaryModel;
use crate::types::{
    ArtifactContent, ArtifactType, BuildStatus, ExecutiveSummary, PauseEventRecord, PauseRequestStatus,
    PodId, PodReceipt, Receipt, RollbackAction, RollbackEntry, RollbackPlan, TechnicalReceipt,
    WorkOrder,
};

/// Per-pod task outcome counts the engine tracks during execution (the Pod
/// entity itself only records `completed_tasks`; failures are attributed
/// here since a pod's state is reset to idle after a failed task).
#[derive(Debug, Clone, Default)]
pub struct PodTaskOutcomes {
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub time_allocated_minutes: f64,
}

struct TextCollectingSink(tokio::sync::Mutex<String>);

#[async_trait::async_trait]
impl StreamSink for TextCollectingSink {
    async fn on_text(&self, chunk: &str) {
        self.0.lock().await.push_str(chunk);
    }
    async fn on_thinking(&self, _chunk: &str) {}
    async fn on_tool_use(&self, _request: ToolUseRequest) {}
    async fn on_error(&self, _message: &str) {}
    async fn on_complete(&self, _tokens_used: u64) {}
}

/// Builds the final receipt for a work order. `unfinished_items` is
/// supplied by the engine (e.g. phases never reached because the time
/// budget ran out). `pod_outcomes` supplies the per-pod completed/failed
/// task counts and allocated time the engine tracked during execution.
pub async fn generate_receipt(
    work_order: &WorkOrder,
    pod_outcomes: &HashMap<PodId, PodTaskOutcomes>,
    unfinished_items: &[String],
    total_tool_calls: u64,
    auxiliary_model: Option<&AuxiliaryModel>,
) -> Receipt {
    let file_artifacts: Vec<_> = work_order
        .artifacts
        .iter()
        .filter(|a| a.artifact_type == ArtifactType::File && a.content.as_text().is_some())
        .collect();
    let files_created = file_artifacts.len();
    let total_lines: usize = file_artifacts.iter().map(|a| a.content.line_count()).sum();

    let total_tasks_completed: usize = pod_outcomes.values().map(|o| o.tasks_completed).sum();
    let total_tasks_failed: usize = pod_outcomes.values().map(|o| o.tasks_failed).sum();
    let quality_score = compute_quality_score(total_tasks_completed, total_tasks_failed);

    let accomplishments: Vec<String> = file_artifacts
        .iter()
        .map(|a| format!("Produced {}", a.path.clone().unwrap_or_else(|| a.name.clone())))
        .collect();

    let summary = match auxiliary_model {
        Some(aux) => draft_summary(work_order, total_tasks_completed, total_tasks_failed, aux)
            .await
            .unwrap_or_else(|| fallback_summary(work_order, total_tasks_completed, total_tasks_failed)),
        None => fallback_summary(work_order, total_tasks_completed, total_tasks_failed),
    };

    let executive = ExecutiveSummary {
        summary,
        accomplishments,
        unfinished_items: unfinished_items.to_vec(),
        files_created,
        total_lines,
        tokens_used: work_order.pods.values().map(|p| p.resource_usage.tokens_used).sum(),
        quality_score,
    };

    let pod_receipts: HashMap<PodId, PodReceipt> = work_order
        .pods
        .iter()
        .map(|(id, pod)| {
            let outcome = pod_outcomes.get(id).cloned().unwrap_or_default();
            let attempted = outcome.tasks_completed + outcome.tasks_failed;
            let success_rate = if attempted == 0 {
                1.0
            } else {
                outcome.tasks_completed as f64 / attempted as f64
            };
            (
                id.clone(),
                PodReceipt {
                    pod_id: id.clone(),
                    role: pod.role,
                    tasks_completed: outcome.tasks_completed,
                    tasks_failed: outcome.tasks_failed,
                    tokens_used: pod.resource_usage.tokens_used,
                    time_allocated_minutes: outcome.time_allocated_minutes,
                    time_used_minutes: pod.resource_usage.execution_time_ms as f64 / 60_000.0,
                    success_rate,
                    warnings: pod.health.warnings.clone(),
                },
            )
        })
        .collect();

    let technical = TechnicalReceipt {
        build_status: if quality_score >= RECEIPT_SUCCESS_QUALITY_THRESHOLD {
            BuildStatus::Success
        } else {
            BuildStatus::Partial
        },
        pod_receipts,
        total_tokens: executive.tokens_used,
        total_tool_calls,
        total_execution_time_ms: work_order
            .pods
            .values()
            .map(|p| p.resource_usage.execution_time_ms)
            .sum(),
    };

    let pause_events: Vec<PauseEventRecord> = work_order
        .pause_requests
        .iter()
        .map(|pr| PauseEventRecord {
            pause_request_id: pr.id.clone(),
            reason: pr.reason.clone(),
            question: pr.question.clone(),
            status: pr.status,
            duration_seconds: pr
                .resolved_at
                .map(|resolved| (resolved - pr.created_at).num_seconds()),
        })
        .collect();

    let rollback = build_rollback_plan(work_order);

    Receipt {
        executive,
        technical,
        pause_events,
        rollback,
        generated_at: Utc::now(),
    }
}

fn compute_quality_score(completed: usize, failed: usize) -> f64 {
    let attempted = completed + failed;
    if attempted == 0 {
        return 100.0;
    }
    (completed as f64 / attempted as f64) * 100.0
}

fn fallback_summary(work_order: &WorkOrder, completed: usize, failed: usize) -> String {
    format!(
        "Work order '{}' finished with {completed} task(s) completed and {failed} failed, producing {} artifact(s).",
        work_order.objective,
        work_order.artifacts.len()
    )
}

/// Optional AI-drafted executive summary; falls back to the deterministic
/// summary if the auxiliary model call fails.
async fn draft_summary(
    work_order: &WorkOrder,
    completed: usize,
    failed: usize,
    aux: &AuxiliaryModel,
) -> Option<String> {
    let sink = TextCollectingSink(tokio::sync::Mutex::new(String::new()));
    let prompt = format!(
        "Write a 2-3 sentence executive summary of a completed work order.\nObjective: {}\nTasks completed: {completed}\nTasks failed: {failed}\nArtifacts produced: {}",
        work_order.objective,
        work_order.artifacts.len()
    );
    let history = vec![ModelMessage {
        role: "user".to_string(),
        content: prompt,
    }];
    aux.client.stream(&aux.config, &history, &sink).await.ok()?;
    let text = sink.0.lock().await.clone();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Per artifact path: `revert` if a prior version exists, else `delete`,
/// numbered in creation order; `can_rollback` is false only if no file
/// artifacts exist.
fn build_rollback_plan(work_order: &WorkOrder) -> RollbackPlan {
    let mut file_artifacts: Vec<_> = work_order
        .artifacts
        .iter()
        .filter(|a| a.path.is_some())
        .collect();
    file_artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let entries: Vec<RollbackEntry> = file_artifacts
        .iter()
        .enumerate()
        .map(|(i, artifact)| RollbackEntry {
            order: i as u32,
            artifact_id: artifact.id.clone(),
            path: artifact.path.clone(),
            action: if artifact.previous_version.is_some() {
                RollbackAction::Revert
            } else {
                RollbackAction::Delete
            },
        })
        .collect();

    RollbackPlan {
        can_rollback: !entries.is_empty(),
        entries,
        limitations: vec!["external side effects cannot be undone".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Artifact, ArtifactStatus, PodRole};

    fn file_artifact(path: &str, previous: Option<String>) -> Artifact {
        Artifact {
            id: crate::types::new_id("artifact"),
            work_order_id: "wo_1".into(),
            name: path.to_string(),
            artifact_type: ArtifactType::File,
            description: String::new(),
            content: ArtifactContent::Text("line1\nline2\n".to_string()),
            path: Some(path.to_string()),
            created_by: "pod_1".into(),
            created_at: Utc::now(),
            version: if previous.is_some() { 2 } else { 1 },
            status: ArtifactStatus::Final,
            previous_version: previous,
        }
    }

    #[tokio::test]
    async fn executive_summary_counts_files_and_lines() {
        let mut wo = WorkOrder::new("Build a landing page", 60.0);
        wo.artifacts.push(file_artifact("index.html", None));
        wo.artifacts.push(file_artifact("style.css", None));

        let mut outcomes = HashMap::new();
        outcomes.insert(
            "pod_1".to_string(),
            PodTaskOutcomes {
                tasks_completed: 2,
                tasks_failed: 0,
                time_allocated_minutes: 30.0,
            },
        );

        let receipt = generate_receipt(&wo, &outcomes, &[], 5, None).await;
        assert_eq!(receipt.executive.files_created, 2);
        assert_eq!(receipt.executive.total_lines, 4);
        assert_eq!(receipt.executive.quality_score, 100.0);
        assert_eq!(receipt.technical.build_status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn low_quality_score_yields_partial_build_status() {
        let wo = WorkOrder::new("Build something", 60.0);
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "pod_1".to_string(),
            PodTaskOutcomes {
                tasks_completed: 1,
                tasks_failed: 4,
                time_allocated_minutes: 30.0,
            },
        );
        let receipt = generate_receipt(&wo, &outcomes, &["phase 2".to_string()], 5, None).await;
        assert_eq!(receipt.technical.build_status, BuildStatus::Partial);
        assert_eq!(receipt.executive.unfinished_items, vec!["phase 2".to_string()]);
    }

    #[test]
    fn rollback_plan_orders_by_creation_and_distinguishes_revert_from_delete() {
        let mut wo = WorkOrder::new("objective", 60.0);
        let mut first = file_artifact("a.txt", None);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = file_artifact("b.txt", Some("prev_id".to_string()));
        wo.artifacts.push(second);
        wo.artifacts.push(first);

        let plan = build_rollback_plan(&wo);
        assert!(plan.can_rollback);
        assert_eq!(plan.entries[0].path.as_deref(), Some("a.txt"));
        assert_eq!(plan.entries[0].action, RollbackAction::Delete);
        assert_eq!(plan.entries[1].action, RollbackAction::Revert);
    }

    #[test]
    fn no_file_artifacts_means_rollback_unavailable() {
        let wo = WorkOrder::new("objective", 60.0);
        let plan = build_rollback_plan(&wo);
        assert!(!plan.can_rollback);
    }

    #[test]
    fn pod_role_is_preserved_in_receipt_context() {
        assert_eq!(PodRole::Qa, PodRole::Qa);
    }
}
