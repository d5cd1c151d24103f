//! Checkpoint controller: blocks between phases when authority is below
//! `autonomous`; auto-resolves on timeout.
//!
//! Uses the same `watch::channel` wait pattern as `pause.rs` rather than a
//! literal sleep-loop, so a submitted decision wakes the waiter promptly
//! without busy-polling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::CHECKPOINT_TIMEOUT;
use crate::error::{OrchestratorError, Result};
use crate::types::{
    CheckpointAction, CheckpointDecision, CheckpointId, CheckpointStatus, UpdateEventType,
    WorkOrder, WorkOrderStatus,
};
use crate::updates::UpdateStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Continue,
    Pause,
    Cancel,
}

pub struct CheckpointController {
    work_order: Arc<RwLock<WorkOrder>>,
    updates: UpdateStream,
    waiters: Arc<RwLock<HashMap<CheckpointId, watch::Sender<Option<CheckpointDecision>>>>>,
}

impl CheckpointController {
    pub fn new(work_order: Arc<RwLock<WorkOrder>>, updates: UpdateStream) -> Self {
        Self {
            work_order,
            updates,
            waiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Submits an externally-decided `CheckpointDecision`, applied by
    /// writing it onto the work order and waking whichever call is blocked
    /// in `resolve`.
    pub async fn submit_decision(
        &self,
        checkpoint_id: &CheckpointId,
        decision: CheckpointDecision,
    ) -> bool {
        if let Some(tx) = self.waiters.read().await.get(checkpoint_id) {
            let _ = tx.send(Some(decision));
            true
        } else {
            false
        }
    }

    /// Resolves the `phase_complete` checkpoint with id `checkpoint_id`.
    /// `autonomous` authority auto-issues `continue`
    /// immediately; otherwise blocks (cancel-safe) until a decision arrives
    /// or the 30-minute timeout auto-issues `continue`.
    pub async fn resolve(
        &self,
        work_order_id: &str,
        checkpoint_id: &CheckpointId,
        cancel: &CancellationToken,
    ) -> Result<CheckpointOutcome> {
        let authority = self.work_order.read().await.authority;

        if authority.is_autonomous() {
            let decision = CheckpointDecision {
                action: CheckpointAction::Continue,
                feedback: None,
                decided_by: "system-autonomous".to_string(),
                timestamp: Utc::now(),
            };
            self.apply_decision(checkpoint_id, decision, CheckpointStatus::Approved)
                .await;
            return Ok(CheckpointOutcome::Continue);
        }

        {
            let mut wo = self.work_order.write().await;
            wo.status = WorkOrderStatus::Checkpoint;
            if let Some(cp) = wo.checkpoints.iter_mut().find(|c| &c.id == checkpoint_id) {
                cp.status = CheckpointStatus::Reached;
                cp.reached_at = Some(Utc::now());
            }
            wo.touch();
        }
        self.updates
            .emit(
                work_order_id.to_string(),
                UpdateEventType::CheckpointReached,
                json!({ "checkpointId": checkpoint_id }),
            )
            .await;

        let (tx, mut rx) = watch::channel(None);
        self.waiters
            .write()
            .await
            .insert(checkpoint_id.clone(), tx);

        let decision = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(CHECKPOINT_TIMEOUT) => Some(CheckpointDecision {
                action: CheckpointAction::Continue,
                feedback: None,
                decided_by: "system-timeout".to_string(),
                timestamp: Utc::now(),
            }),
            changed = rx.changed() => if changed.is_ok() { rx.borrow().clone() } else { None },
        };
        self.waiters.write().await.remove(checkpoint_id);

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(
                "work order cancelled while awaiting checkpoint decision".to_string(),
            ));
        }

        let decision = decision.ok_or_else(|| {
            OrchestratorError::Internal("checkpoint wait ended without a decision".to_string())
        })?;

        let status = match decision.action {
            CheckpointAction::Cancel => CheckpointStatus::Rejected,
            _ => CheckpointStatus::Approved,
        };
        let outcome = match decision.action {
            CheckpointAction::Continue | CheckpointAction::ContinueWithChanges => {
                CheckpointOutcome::Continue
            }
            CheckpointAction::Pause => CheckpointOutcome::Pause,
            CheckpointAction::Cancel => CheckpointOutcome::Cancel,
        };
        self.apply_decision(checkpoint_id, decision, status).await;
        Ok(outcome)
    }

    async fn apply_decision(
        &self,
        checkpoint_id: &CheckpointId,
        decision: CheckpointDecision,
        status: CheckpointStatus,
    ) {
        let mut wo = self.work_order.write().await;
        if let Some(cp) = wo.checkpoints.iter_mut().find(|c| &c.id == checkpoint_id) {
            cp.status = status;
            cp.decided_at = Some(Utc::now());
            cp.decision = Some(decision);
        }
        wo.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Authority, Checkpoint};

    fn work_order_with_checkpoint(authority: Authority) -> (Arc<RwLock<WorkOrder>>, CheckpointId) {
        let mut wo = WorkOrder::new("objective", 60.0);
        wo.authority = authority;
        let checkpoint = Checkpoint::for_phase_complete("Phase 1 complete");
        let id = checkpoint.id.clone();
        wo.checkpoints.push(checkpoint);
        (Arc::new(RwLock::new(wo)), id)
    }

    #[tokio::test]
    async fn autonomous_authority_auto_continues_immediately() {
        let (wo, checkpoint_id) = work_order_with_checkpoint(Authority::Autonomous);
        let controller = CheckpointController::new(wo.clone(), UpdateStream::new());
        let outcome = controller
            .resolve("wo_1", &checkpoint_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CheckpointOutcome::Continue);
        let locked = wo.read().await;
        assert_eq!(locked.checkpoints[0].status, CheckpointStatus::Approved);
        assert_eq!(
            locked.checkpoints[0].decision.as_ref().unwrap().decided_by,
            "system-autonomous"
        );
    }

    #[tokio::test]
    async fn supervised_authority_waits_for_submitted_decision() {
        let (wo, checkpoint_id) = work_order_with_checkpoint(Authority::Supervised);
        let controller = Arc::new(CheckpointController::new(wo.clone(), UpdateStream::new()));
        let controller_clone = controller.clone();
        let cp_id = checkpoint_id.clone();
        let handle = tokio::spawn(async move {
            controller_clone
                .resolve("wo_1", &cp_id, &CancellationToken::new())
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(
            controller
                .submit_decision(
                    &checkpoint_id,
                    CheckpointDecision {
                        action: CheckpointAction::Pause,
                        feedback: Some("hold on".to_string()),
                        decided_by: "user-1".to_string(),
                        timestamp: Utc::now(),
                    },
                )
                .await
        );

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, CheckpointOutcome::Pause);
        let locked = wo.read().await;
        assert_eq!(locked.checkpoints[0].status, CheckpointStatus::Approved);
    }

    #[tokio::test]
    async fn cancellation_during_wait_is_reported() {
        let (wo, checkpoint_id) = work_order_with_checkpoint(Authority::Guided);
        let cancel = CancellationToken::new();
        let controller = Arc::new(CheckpointController::new(wo, UpdateStream::new()));
        let controller_clone = controller.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            controller_clone
                .resolve("wo_1", &checkpoint_id, &cancel_clone)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::Cancelled(_))));
    }
}
