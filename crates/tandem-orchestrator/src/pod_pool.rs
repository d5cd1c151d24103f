//! Pod pool: long-lived pool of reusable pods keyed by role; carries
//! accumulated context and metrics across work orders.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::{Pod, PodId, PodRole, PodStatus, WorkOrderId};

/// Rolling context a pooled pod carries between activations: a capped
/// history of prior-work-order summaries plus aggregate metrics, injected
/// into the system prompt on the next activation.
#[derive(Debug, Clone, Default)]
pub struct PoolContext {
    pub summaries: Vec<String>,
    pub specializations: Vec<String>,
    pub total_tbwos_served: u64,
    pub total_tasks_completed: u64,
    pub total_tokens_used: u64,
}

const POOL_CONTEXT_SUMMARY_CAP: usize = 20;

impl PoolContext {
    /// Renders the pool context summary injected into the next system prompt.
    pub fn render(&self) -> String {
        if self.summaries.is_empty() {
            return String::new();
        }
        let mut out = format!(
            "This pod has served {} prior work order(s), completing {} task(s).\n",
            self.total_tbwos_served, self.total_tasks_completed
        );
        if !self.specializations.is_empty() {
            out.push_str(&format!(
                "Observed specializations: {}\n",
                self.specializations.join(", ")
            ));
        }
        out.push_str("Recent work order summaries:\n");
        for summary in self.summaries.iter().rev().take(5) {
            out.push_str(&format!("- {summary}\n"));
        }
        out
    }
}

struct PooledPod {
    pod: Pod,
    context: PoolContext,
}

/// Keyed by role, each entry is a sequence of pods available for reuse.
#[derive(Clone)]
pub struct PodPool {
    by_role: Arc<RwLock<HashMap<PodRole, Vec<PooledPod>>>>,
}

impl PodPool {
    pub fn new() -> Self {
        Self {
            by_role: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns an existing reusable pod for this role (updating its owning
    /// work order id), or creates a fresh one.
    pub async fn get_or_create_pod(
        &self,
        role: PodRole,
        name: impl Into<String>,
        work_order_id: WorkOrderId,
    ) -> (Pod, PoolContext) {
        let mut by_role = self.by_role.write().await;
        let bucket = by_role.entry(role).or_default();
        if let Some(mut entry) = bucket.pop() {
            entry.pod.owning_work_order_id = work_order_id;
            entry.pod.status = PodStatus::Initializing;
            entry.pod.current_task = None;
            return (entry.pod, entry.context);
        }
        (Pod::new(role, name, work_order_id), PoolContext::default())
    }

    /// Returns a pod to the pool: appends the completion summary to its
    /// rolling context (capped), accumulates metrics, and infers
    /// specializations from completed task descriptions (spec §4.4).
    pub async fn return_pod_to_pool(
        &self,
        mut pod: Pod,
        mut context: PoolContext,
        summary: impl Into<String>,
        completed_task_descriptions: &[String],
    ) {
        pod.status = PodStatus::Idle;
        pod.current_task = None;

        context.summaries.push(summary.into());
        while context.summaries.len() > POOL_CONTEXT_SUMMARY_CAP {
            context.summaries.remove(0);
        }
        context.total_tbwos_served += 1;
        context.total_tasks_completed += pod.completed_tasks.len() as u64;
        context.total_tokens_used += pod.resource_usage.tokens_used;

        for description in completed_task_descriptions {
            if let Some(spec) = infer_specialization(description) {
                if !context.specializations.contains(&spec) {
                    context.specializations.push(spec);
                }
            }
        }

        let role = pod.role;
        let mut by_role = self.by_role.write().await;
        by_role
            .entry(role)
            .or_default()
            .push(PooledPod { pod, context });
    }

    pub async fn pool_size(&self, role: PodRole) -> usize {
        self.by_role
            .read()
            .await
            .get(&role)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Returns a pod that was previously owned by this work order so it
    /// can be reactivated without losing identity, if one already exists.
    pub async fn reactivate_for_work_order(
        &self,
        role: PodRole,
        work_order_id: &WorkOrderId,
    ) -> Option<(Pod, PoolContext)> {
        let mut by_role = self.by_role.write().await;
        let bucket = by_role.get_mut(&role)?;
        let idx = bucket
            .iter()
            .position(|entry| &entry.pod.owning_work_order_id == work_order_id)?;
        let entry = bucket.remove(idx);
        Some((entry.pod, entry.context))
    }
}

impl Default for PodPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Heuristic specialization inference from completed tasks' descriptions
/// (spec §4.4 "Specializations are heuristics inferred from completed
/// tasks' descriptions").
fn infer_specialization(description: &str) -> Option<String> {
    let lower = description.to_ascii_lowercase();
    let keywords: &[(&str, &str)] = &[
        ("test", "testing"),
        ("css", "styling"),
        ("api", "api-design"),
        ("database", "database"),
        ("auth", "authentication"),
        ("deploy", "deployment"),
    ];
    keywords
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, spec)| spec.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returned_pod_is_reused_on_next_request() {
        let pool = PodPool::new();
        let (pod, _) = pool
            .get_or_create_pod(PodRole::Backend, "backend-1", "wo_1".to_string())
            .await;
        let pod_id = pod.id.clone();
        pool.return_pod_to_pool(pod, PoolContext::default(), "did stuff", &[])
            .await;
        assert_eq!(pool.pool_size(PodRole::Backend).await, 1);

        let (reused, context) = pool
            .get_or_create_pod(PodRole::Backend, "backend-1", "wo_2".to_string())
            .await;
        assert_eq!(reused.id, pod_id);
        assert_eq!(reused.owning_work_order_id, "wo_2");
        assert_eq!(context.total_tbwos_served, 1);
        assert_eq!(pool.pool_size(PodRole::Backend).await, 0);
    }

    #[tokio::test]
    async fn pool_context_accumulates_across_multiple_returns() {
        let pool = PodPool::new();
        let (mut pod, context) = pool
            .get_or_create_pod(PodRole::Qa, "qa-1", "wo_1".to_string())
            .await;
        pod.completed_tasks.push("t1".to_string());
        pod.resource_usage.tokens_used = 500;
        pool.return_pod_to_pool(
            pod,
            context,
            "ran the test suite",
            &["write unit tests for auth".to_string()],
        )
        .await;

        let (pod2, context2) = pool
            .get_or_create_pod(PodRole::Qa, "qa-1", "wo_2".to_string())
            .await;
        assert_eq!(context2.total_tokens_used, 500);
        assert!(context2.specializations.contains(&"testing".to_string()));
        let _ = pod2;
    }
}
