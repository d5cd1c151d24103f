//! Task scheduler: builds dependency groups from a phase's tasks and picks
//! the best pod per task.
//!
//! Shares `src-tauri/src/orchestrator/scheduler.rs`'s `TaskScheduler`
//! cycle-detection and dependency-validation shape, generalized from "pick
//! one runnable task" to "build ordered runnable groups" since a whole
//! group here runs in parallel rather than one task at a time.

use std::collections::HashSet;

use crate::types::{Pod, PodId, Task, TaskId};

/// Builds task groups that can be executed serially, where each group's
/// tasks run in parallel.
///
/// - If no task in `tasks` carries a `depends_on`, returns one group with
///   every incomplete task.
/// - Otherwise repeatedly selects tasks whose `depends_on` is a subset of
///   the resolved set (starting from `completed_task_ids`); an iteration
///   that resolves zero new tasks while tasks remain collapses the rest
///   into one final group (cycle tolerance, logged as a warning, never
///   fatal). Safety cap at `tasks.len() + 1` iterations.
pub fn build_task_groups(tasks: &[Task], completed_task_ids: &HashSet<TaskId>) -> Vec<Vec<TaskId>> {
    let incomplete: Vec<&Task> = tasks
        .iter()
        .filter(|t| !completed_task_ids.contains(&t.id))
        .collect();
    if incomplete.is_empty() {
        return Vec::new();
    }

    if incomplete.iter().all(|t| t.depends_on.is_empty()) {
        return vec![incomplete.iter().map(|t| t.id.clone()).collect()];
    }

    let mut resolved: HashSet<TaskId> = completed_task_ids.clone();
    let mut remaining: Vec<&Task> = incomplete;
    let mut groups = Vec::new();
    let safety_cap = tasks.len() + 1;

    for _ in 0..safety_cap {
        if remaining.is_empty() {
            break;
        }
        let (ready, not_ready): (Vec<&Task>, Vec<&Task>) = remaining
            .into_iter()
            .partition(|t| t.depends_on.iter().all(|dep| resolved.contains(dep)));

        if ready.is_empty() {
            tracing::warn!(
                task_ids = ?not_ready.iter().map(|t| &t.id).collect::<Vec<_>>(),
                "task dependency cycle or unresolved dependency detected; collapsing remaining tasks into one final group"
            );
            groups.push(not_ready.iter().map(|t| t.id.clone()).collect());
            return groups;
        }

        for t in &ready {
            resolved.insert(t.id.clone());
        }
        groups.push(ready.iter().map(|t| t.id.clone()).collect());
        remaining = not_ready;
    }

    if !remaining.is_empty() {
        tracing::warn!("task scheduler safety cap reached with tasks still unresolved");
        groups.push(remaining.iter().map(|t| t.id.clone()).collect());
    }

    groups
}

/// Picks the pod that should run `task`. `active_pod_order` is the
/// deterministic insertion order of the engine's active pod set, kept
/// stable within a run so pod selection is reproducible.
pub fn select_pod_for_task<'a>(
    task: &Task,
    active_pod_order: &[PodId],
    pods: &'a std::collections::HashMap<PodId, Pod>,
) -> Option<&'a Pod> {
    if let Some(assigned) = &task.assigned_pod {
        if active_pod_order.contains(assigned) {
            if let Some(pod) = pods.get(assigned) {
                return Some(pod);
            }
        }
    }

    for pod_id in active_pod_order {
        if let Some(pod) = pods.get(pod_id) {
            if pod.is_idle() {
                return Some(pod);
            }
        }
    }

    active_pod_order.first().and_then(|id| pods.get(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PodRole, TaskStatus};
    use std::collections::HashMap;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, format!("Task {id}"));
        t.depends_on = deps.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn no_dependencies_yields_single_group() {
        let tasks = vec![task("a", &[]), task("b", &[])];
        let groups = build_task_groups(&tasks, &HashSet::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn linear_dependency_chain_yields_ordered_groups() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let groups = build_task_groups(&tasks, &HashSet::new());
        assert_eq!(groups, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn resume_skips_already_completed_tasks() {
        let tasks = vec![task("a", &[]), task("b", &["a"])];
        let mut completed = HashSet::new();
        completed.insert("a".to_string());
        let groups = build_task_groups(&tasks, &completed);
        assert_eq!(groups, vec![vec!["b"]]);
    }

    #[test]
    fn cyclic_dependency_collapses_into_one_final_group_without_deadlock() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let groups = build_task_groups(&tasks, &HashSet::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn assigned_pod_wins_when_active() {
        let mut t = task("a", &[]);
        t.assigned_pod = Some("pod_1".to_string());
        t.status = TaskStatus::Pending;
        let mut pods = HashMap::new();
        let mut pod1 = Pod::new(PodRole::Backend, "backend", "wo_1".to_string());
        pod1.id = "pod_1".to_string();
        pods.insert("pod_1".to_string(), pod1);
        let order = vec!["pod_1".to_string()];
        let chosen = select_pod_for_task(&t, &order, &pods).unwrap();
        assert_eq!(chosen.id, "pod_1");
    }

    #[test]
    fn falls_back_to_idle_pod_in_insertion_order() {
        let t = task("a", &[]);
        let mut pods = HashMap::new();
        let mut working = Pod::new(PodRole::Backend, "backend", "wo_1".to_string());
        working.id = "pod_1".to_string();
        working.status = crate::types::PodStatus::Working;
        let mut idle = Pod::new(PodRole::Frontend, "frontend", "wo_1".to_string());
        idle.id = "pod_2".to_string();
        idle.status = crate::types::PodStatus::Idle;
        pods.insert("pod_1".to_string(), working);
        pods.insert("pod_2".to_string(), idle);
        let order = vec!["pod_1".to_string(), "pod_2".to_string()];
        let chosen = select_pod_for_task(&t, &order, &pods).unwrap();
        assert_eq!(chosen.id, "pod_2");
    }
}
