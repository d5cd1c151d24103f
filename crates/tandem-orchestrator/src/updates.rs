//! C3 Update Stream: append-only event log per work order with
//! per-work-order and global subscribers, bounded history (spec §4, §6.3).
//!
//! Grounded on `tandem-core`'s `EventBus` (`tokio::sync::broadcast`), with a
//! bounded per-work-order ring buffer layered on top so late subscribers can
//! request prior history (spec §5 "if a new subscriber attaches mid-run they
//! do not receive pre-existing history unless they explicitly request it").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::config::UPDATE_STREAM_HISTORY_CAP;
use crate::types::{new_id, UpdateEvent, UpdateEventType, WorkOrderId};

const CHANNEL_CAPACITY: usize = 4096;

struct WorkOrderStream {
    history: VecDeque<UpdateEvent>,
}

#[derive(Clone)]
pub struct UpdateStream {
    tx: broadcast::Sender<UpdateEvent>,
    per_work_order: Arc<RwLock<HashMap<WorkOrderId, WorkOrderStream>>>,
}

impl UpdateStream {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            per_work_order: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Emits an event, appending it to the bounded per-work-order history
    /// (FIFO eviction past `UPDATE_STREAM_HISTORY_CAP`, spec §6.3) and
    /// publishing to the broadcast channel.
    pub async fn emit(
        &self,
        work_order_id: WorkOrderId,
        event_type: UpdateEventType,
        data: serde_json::Value,
    ) -> UpdateEvent {
        let event = UpdateEvent {
            id: new_id("evt"),
            work_order_id: work_order_id.clone(),
            event_type,
            timestamp: Utc::now(),
            data,
        };
        {
            let mut map = self.per_work_order.write().await;
            let stream = map.entry(work_order_id).or_insert_with(|| WorkOrderStream {
                history: VecDeque::new(),
            });
            stream.history.push_back(event.clone());
            while stream.history.len() > UPDATE_STREAM_HISTORY_CAP {
                stream.history.pop_front();
            }
        }
        let _ = self.tx.send(event.clone());
        event
    }

    /// Subscribes to events across all work orders, from this point forward.
    pub fn subscribe_all(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }

    /// Subscribes to events for a single work order, from this point forward.
    /// Combine with `history_for` if the caller wants pre-existing events too.
    pub fn subscribe(&self, work_order_id: WorkOrderId) -> FilteredReceiver {
        FilteredReceiver {
            work_order_id,
            inner: self.tx.subscribe(),
        }
    }

    /// Returns the bounded replay history for a work order (explicit request,
    /// per spec §5's "unless they explicitly request it").
    pub async fn history_for(&self, work_order_id: &WorkOrderId) -> Vec<UpdateEvent> {
        self.per_work_order
            .read()
            .await
            .get(work_order_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for UpdateStream {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver filtered to one work order's events.
pub struct FilteredReceiver {
    work_order_id: WorkOrderId,
    inner: broadcast::Receiver<UpdateEvent>,
}

impl FilteredReceiver {
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        loop {
            match self.inner.recv().await {
                Ok(event) if event.work_order_id == self.work_order_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_is_bounded_fifo() {
        let stream = UpdateStream::new();
        let wo = "wo_1".to_string();
        for i in 0..(UPDATE_STREAM_HISTORY_CAP + 10) {
            stream
                .emit(
                    wo.clone(),
                    UpdateEventType::ProgressUpdate,
                    serde_json::json!({ "i": i }),
                )
                .await;
        }
        let history = stream.history_for(&wo).await;
        assert_eq!(history.len(), UPDATE_STREAM_HISTORY_CAP);
        assert_eq!(history[0].data["i"], 10);
    }

    #[tokio::test]
    async fn subscriber_receives_only_its_work_order() {
        let stream = UpdateStream::new();
        let mut rx = stream.subscribe("wo_a".to_string());
        stream
            .emit(
                "wo_b".to_string(),
                UpdateEventType::ProgressUpdate,
                serde_json::json!({}),
            )
            .await;
        stream
            .emit(
                "wo_a".to_string(),
                UpdateEventType::ProgressUpdate,
                serde_json::json!({"marker": true}),
            )
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.work_order_id, "wo_a");
    }

    #[tokio::test]
    async fn late_subscriber_misses_prior_events_without_explicit_history_request() {
        let stream = UpdateStream::new();
        let wo = "wo_1".to_string();
        stream
            .emit(wo.clone(), UpdateEventType::PhaseStart, serde_json::json!({}))
            .await;
        let mut rx = stream.subscribe(wo.clone());
        stream
            .emit(wo.clone(), UpdateEventType::PhaseComplete, serde_json::json!({}))
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.event_type, UpdateEventType::PhaseComplete));
    }
}
