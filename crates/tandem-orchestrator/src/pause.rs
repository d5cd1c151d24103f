//! Pause / clarification broker: suspends a single task while other pods
//! continue; auto-answers under high authority, else waits for a human
//! reply.
//!
//! Uses the same wait-for-reply shape as
//! `crates/tandem-core/src/permissions.rs`'s `PermissionManager`: a
//! `watch::channel` per pending request, woken by either a submitted reply
//! or work-order cancellation, rather than a literal sleep-loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::CLARIFICATION_TIMEOUT;
use crate::error::{OrchestratorError, Result};
use crate::model_client::{ModelClient, ModelMessage, StreamSink, ToolUseRequest};
use crate::pod::ClarificationSink;
use crate::types::{ModelConfig, PauseRequest, PauseRequestId, PauseRequestStatus, WorkOrder, WorkOrderId};
use crate::updates::UpdateStream;

/// Collects streamed text from an auxiliary, low-temperature model session
/// used to auto-resolve clarifications.
struct TextCollectingSink(tokio::sync::Mutex<String>);

#[async_trait]
impl StreamSink for TextCollectingSink {
    async fn on_text(&self, chunk: &str) {
        self.0.lock().await.push_str(chunk);
    }
    async fn on_thinking(&self, _chunk: &str) {}
    async fn on_tool_use(&self, _request: ToolUseRequest) {}
    async fn on_error(&self, _message: &str) {}
    async fn on_complete(&self, _tokens_used: u64) {}
}

/// An optional auxiliary model session used to auto-resolve clarifications
/// for `autonomous`/`supervised` work orders. When absent, a deterministic
/// fallback answer is produced instead.
#[derive(Clone)]
pub struct AuxiliaryModel {
    pub client: Arc<dyn ModelClient>,
    pub config: ModelConfig,
}

pub struct ClarificationBroker {
    work_order: Arc<RwLock<WorkOrder>>,
    updates: UpdateStream,
    auxiliary_model: Option<AuxiliaryModel>,
    waiters: Arc<RwLock<HashMap<PauseRequestId, watch::Sender<Option<String>>>>>,
    cancel: CancellationToken,
}

impl ClarificationBroker {
    pub fn new(
        work_order: Arc<RwLock<WorkOrder>>,
        updates: UpdateStream,
        auxiliary_model: Option<AuxiliaryModel>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            work_order,
            updates,
            auxiliary_model,
            waiters: Arc::new(RwLock::new(HashMap::new())),
            cancel,
        }
    }

    /// Submits a user's answer to a pending clarification, writing
    /// `PauseRequest.status = answered` onto the work order and waking
    /// whichever call is blocked in `resolve`.
    pub async fn submit_user_reply(&self, pause_request_id: &PauseRequestId, reply: String) -> bool {
        if let Some(tx) = self.waiters.read().await.get(pause_request_id) {
            let _ = tx.send(Some(reply));
            true
        } else {
            false
        }
    }

    async fn auto_answer(&self, question: &str, context: &str) -> String {
        if let Some(aux) = &self.auxiliary_model {
            let sink = TextCollectingSink(tokio::sync::Mutex::new(String::new()));
            let prompt = format!(
                "Answer decisively in 1-3 sentences. Question: {question}\nContext: {context}"
            );
            let history = vec![ModelMessage {
                role: "user".to_string(),
                content: prompt,
            }];
            if aux
                .client
                .stream(&aux.config, &history, &sink)
                .await
                .is_ok()
            {
                let answer = sink.0.lock().await.clone();
                if !answer.trim().is_empty() {
                    return answer;
                }
            }
        }
        format!("Proceeding with best available judgment. Question: {question}")
    }

    async fn finish(&self, id: &PauseRequestId, answer: &str, status: PauseRequestStatus) {
        let mut wo = self.work_order.write().await;
        if let Some(pr) = wo.pause_requests.iter_mut().find(|p| &p.id == id) {
            pr.status = status;
            pr.resolved_at = Some(Utc::now());
            match status {
                PauseRequestStatus::Answered => pr.user_response = Some(answer.to_string()),
                _ => pr.inferred_values = Some(answer.to_string()),
            }
        }
        if wo.active_pause_id.as_deref() == Some(id.as_str()) {
            wo.active_pause_id = None;
        }
        wo.touch();
    }
}

#[async_trait]
impl ClarificationSink for ClarificationBroker {
    async fn resolve(
        &self,
        work_order_id: &WorkOrderId,
        question: &str,
        context: &str,
        options: &[String],
    ) -> Result<String> {
        let pause_request_id = {
            let mut wo = self.work_order.write().await;
            let mut pr = PauseRequest::new(question, "clarification_requested");
            pr.context = context.to_string();
            pr.options = options.to_vec();
            let id = pr.id.clone();
            wo.pause_requests.push(pr);
            wo.active_pause_id = Some(id.clone());
            wo.touch();
            id
        };

        let authority = self.work_order.read().await.authority;

        if authority.auto_resolves_clarification() {
            let answer = self.auto_answer(question, context).await;
            self.finish(&pause_request_id, &answer, PauseRequestStatus::Inferred)
                .await;
            return Ok(answer);
        }

        let (tx, mut rx) = watch::channel(None);
        self.waiters
            .write()
            .await
            .insert(pause_request_id.clone(), tx);

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => None,
            _ = tokio::time::sleep(CLARIFICATION_TIMEOUT) => None,
            changed = rx.changed() => if changed.is_ok() { rx.borrow().clone() } else { None },
        };
        self.waiters.write().await.remove(&pause_request_id);

        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(
                "work order cancelled while awaiting clarification".to_string(),
            ));
        }

        match reply {
            Some(answer) => {
                self.finish(&pause_request_id, &answer, PauseRequestStatus::Answered)
                    .await;
                let _ = work_order_id;
                Ok(answer)
            }
            None => {
                // Timeout elapsed: fall back to the auto-answer path.
                let answer = self.auto_answer(question, context).await;
                self.finish(&pause_request_id, &answer, PauseRequestStatus::Inferred)
                    .await;
                Ok(answer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Authority;
    use async_trait::async_trait;

    fn work_order(authority: Authority) -> Arc<RwLock<WorkOrder>> {
        let mut wo = WorkOrder::new("objective", 60.0);
        wo.authority = authority;
        Arc::new(RwLock::new(wo))
    }

    #[tokio::test]
    async fn autonomous_authority_auto_resolves_without_waiting() {
        let wo = work_order(Authority::Autonomous);
        let broker = ClarificationBroker::new(
            wo.clone(),
            UpdateStream::new(),
            None,
            CancellationToken::new(),
        );
        let answer = broker
            .resolve(&"wo_1".to_string(), "Which color scheme?", "", &[])
            .await
            .unwrap();
        assert!(!answer.is_empty());
        let locked = wo.read().await;
        assert_eq!(locked.pause_requests.len(), 1);
        assert_eq!(locked.pause_requests[0].status, PauseRequestStatus::Inferred);
        assert!(locked.active_pause_id.is_none());
    }

    #[tokio::test]
    async fn guided_authority_waits_for_submitted_user_reply() {
        let wo = work_order(Authority::Guided);
        let broker = Arc::new(ClarificationBroker::new(
            wo.clone(),
            UpdateStream::new(),
            None,
            CancellationToken::new(),
        ));
        let broker_clone = broker.clone();
        let handle = tokio::spawn(async move {
            broker_clone
                .resolve(&"wo_1".to_string(), "Proceed with plan B?", "", &[])
                .await
        });

        // Give the resolver a tick to register its waiter.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let pause_request_id = {
            let locked = wo.read().await;
            locked.pause_requests[0].id.clone()
        };
        assert!(
            broker
                .submit_user_reply(&pause_request_id, "Yes, plan B".to_string())
                .await
        );

        let answer = handle.await.unwrap().unwrap();
        assert_eq!(answer, "Yes, plan B");
        let locked = wo.read().await;
        assert_eq!(locked.pause_requests[0].status, PauseRequestStatus::Answered);
    }

    #[tokio::test]
    async fn cancellation_during_wait_returns_cancelled_error() {
        let wo = work_order(Authority::NoAutonomy);
        let cancel = CancellationToken::new();
        let broker = ClarificationBroker::new(wo, UpdateStream::new(), None, cancel.clone());
        let broker = Arc::new(broker);
        let broker_clone = broker.clone();
        let handle = tokio::spawn(async move {
            broker_clone
                .resolve(&"wo_1".to_string(), "Anything?", "", &[])
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::Cancelled(_))));
    }

    struct StubModelClient(&'static str);

    #[async_trait]
    impl ModelClient for StubModelClient {
        async fn stream(
            &self,
            _config: &ModelConfig,
            _history: &[ModelMessage],
            sink: &dyn StreamSink,
        ) -> Result<Vec<ToolUseRequest>> {
            sink.on_text(self.0).await;
            sink.on_complete(10).await;
            Ok(Vec::new())
        }
        async fn continue_with_tool_result(
            &self,
            _config: &ModelConfig,
            _history: &[ModelMessage],
            _result: crate::model_client::ToolResultMessage,
            _sink: &dyn StreamSink,
        ) -> Result<Vec<ToolUseRequest>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn supervised_authority_uses_auxiliary_model_answer() {
        let wo = work_order(Authority::Supervised);
        let aux = AuxiliaryModel {
            client: Arc::new(StubModelClient("Use the existing schema.")),
            config: ModelConfig {
                provider: "stub".into(),
                model: "stub".into(),
                temperature: 0.0,
                max_tokens: 128,
                system_prompt: String::new(),
            },
        };
        let broker = ClarificationBroker::new(
            wo,
            UpdateStream::new(),
            Some(aux),
            CancellationToken::new(),
        );
        let answer = broker
            .resolve(&"wo_1".to_string(), "Which schema?", "", &[])
            .await
            .unwrap();
        assert_eq!(answer, "Use the existing schema.");
    }
}
