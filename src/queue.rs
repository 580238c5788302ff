//! C5: `MessageQueue` — priority-ordered, size-bounded queue of outbound items
//! (§4.5, §8 boundary behaviors).
//!
//! The one object the spec requires to be safely shared between the I/O thread
//! and the `ServerSession`/`FileTransferEngine`/`RemoteSession` processing tick
//! (§5 "The MessageQueue is the only mutex-protected object"); modeled here as
//! `Arc<Mutex<...>>`-protected state behind a narrow API, per §10.6.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::domain_types::{DeviceId, MessageId, Priority, QueueByteBudget, ServerConfigId};
use crate::error::InternalError;

/// Category of an outbound item (§3 "Outbound queue item").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Snapshot,
    Alarm,
    Event,
    Email,
    SoapStatus,
    Misc,
}

/// One outbound item awaiting delivery (§3 "Outbound queue item").
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub kind: ItemKind,
    pub device_id: DeviceId,
    pub server_config_id: ServerConfigId,
    pub priority: Priority,
    pub content: Bytes,
    /// Set once the item has been drained into an outgoing EMessage; cleared
    /// (returned to queued) if that message's delivery fails (§3, §4.5).
    pub in_flight_message_id: Option<MessageId>,
    sequence: u64,
}

/// Fill-level thresholds the queue reports crossing, in either direction
/// (§4.5 "Overflow policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillThreshold {
    Empty,
    Quarter,
    Half,
    ThreeQuarters,
    Full,
}

fn threshold_for(used: usize, budget: usize) -> FillThreshold {
    if used == 0 {
        FillThreshold::Empty
    } else if budget == 0 {
        FillThreshold::Full
    } else {
        let pct = (used * 100) / budget;
        if pct >= 100 {
            FillThreshold::Full
        } else if pct >= 75 {
            FillThreshold::ThreeQuarters
        } else if pct >= 50 {
            FillThreshold::Half
        } else if pct >= 25 {
            FillThreshold::Quarter
        } else {
            FillThreshold::Empty
        }
    }
}

struct Inner {
    items: VecDeque<QueueItem>,
    total_bytes: usize,
    budget: QueueByteBudget,
    next_sequence: u64,
    last_threshold: FillThreshold,
}

/// Bounded, priority-ordered outbound queue (§4.5).
///
/// Cloning shares the same underlying state (cheap `Arc` clone), matching the
/// teacher's pattern of passing storage handles by value across tasks.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Mutex<Inner>>,
    status_notify: Arc<Notify>,
}

impl MessageQueue {
    #[must_use]
    pub fn new(budget: QueueByteBudget) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                total_bytes: 0,
                budget,
                next_sequence: 0,
                last_threshold: FillThreshold::Empty,
            })),
            status_notify: Arc::new(Notify::new()),
        }
    }

    /// Fires whenever the queue's fill level crosses a quartile threshold
    /// (§4.5 "Overflow policy"); callers `await` this to drive a status callback.
    #[must_use]
    pub fn status_notifier(&self) -> Arc<Notify> {
        self.status_notify.clone()
    }

    /// Inserts `item`, sorted by priority then arrival order (§4.5 "insertion
    /// sorts by priority ... and, within priority, by arrival order").
    ///
    /// # Errors
    /// Returns [`InternalError::Memory`] if the total queued bytes would exceed
    /// the configured budget (§3 "Invariant: the queue totals <= configured byte
    /// budget"; §8 "add at exactly budget-1 succeeds; at budget+1 fails").
    pub async fn add(
        &self,
        kind: ItemKind,
        device_id: DeviceId,
        server_config_id: ServerConfigId,
        priority: Priority,
        content: Bytes,
    ) -> Result<(), InternalError> {
        let mut inner = self.inner.lock().await;
        let size = content.len();
        if inner.total_bytes + size > inner.budget.as_usize() {
            return Err(InternalError::Memory(format!(
                "adding {size} bytes would exceed the {}-byte queue budget",
                inner.budget.as_usize()
            )));
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let item = QueueItem {
            kind,
            device_id,
            server_config_id,
            priority,
            content,
            in_flight_message_id: None,
            sequence,
        };
        let insert_at = inner
            .items
            .iter()
            .position(|existing| existing.priority < item.priority)
            .unwrap_or(inner.items.len());
        inner.items.insert(insert_at, item);
        inner.total_bytes += size;
        Self::maybe_notify(&mut inner, &self.status_notify);
        Ok(())
    }

    fn maybe_notify(inner: &mut Inner, notify: &Notify) {
        let current = threshold_for(inner.total_bytes, inner.budget.as_usize());
        if current != inner.last_threshold {
            inner.last_threshold = current;
            notify.notify_waiters();
        }
    }

    /// Total bytes currently queued.
    pub async fn total_bytes(&self) -> usize {
        self.inner.lock().await.total_bytes
    }

    /// Number of items currently queued.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    #[must_use]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns up to `max_items` queued items for `server_config_id`, in queue
    /// order, without removing them, tagging each with `message_id` as it is
    /// handed out (§3 "when items are drained into a network message they are
    /// marked with the message-id they went out in"). Items already marked with
    /// a different in-flight message are skipped (still awaiting a prior
    /// delivery's result).
    pub async fn fetch_for_delivery(
        &self,
        server_config_id: ServerConfigId,
        max_items: usize,
        message_id: MessageId,
    ) -> Vec<QueueItem> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();
        for item in inner
            .items
            .iter_mut()
            .filter(|i| i.server_config_id == server_config_id && i.in_flight_message_id.is_none())
            .take(max_items)
        {
            item.in_flight_message_id = Some(message_id);
            out.push(item.clone());
        }
        out
    }

    /// Deletes every item tagged with `(message_id, device_id)` — called after a
    /// successful delivery (§4.5 "delete-by-message-id"; §8 invariant 4).
    pub async fn delete_by_message_id(&self, message_id: MessageId, device_id: DeviceId) {
        let mut inner = self.inner.lock().await;
        let mut freed = 0usize;
        inner.items.retain(|item| {
            let matches = item.in_flight_message_id == Some(message_id) && item.device_id == device_id;
            if matches {
                freed += item.content.len();
            }
            !matches
        });
        inner.total_bytes = inner.total_bytes.saturating_sub(freed);
        Self::maybe_notify(&mut inner, &self.status_notify);
    }

    /// Returns all items tagged with `message_id` to queued state (clears the
    /// tag) after a failed delivery (§4.5, §4.7 "mark all items in the outgoing
    /// message as still-queued").
    pub async fn requeue_by_message_id(&self, message_id: MessageId) {
        let mut inner = self.inner.lock().await;
        for item in inner.items.iter_mut() {
            if item.in_flight_message_id == Some(message_id) {
                item.in_flight_message_id = None;
            }
        }
    }

    /// Generates a fresh opaque message id for a new delivery attempt.
    #[must_use]
    pub fn new_message_id() -> MessageId {
        MessageId::new(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(n: u32) -> DeviceId {
        DeviceId::new(n)
    }
    fn cfg(n: u32) -> ServerConfigId {
        ServerConfigId::new(n)
    }

    #[tokio::test]
    async fn add_respects_byte_budget_boundary() {
        let budget = QueueByteBudget::try_new(10).unwrap();
        let queue = MessageQueue::new(budget);
        queue
            .add(ItemKind::Misc, dev(0), cfg(0), Priority::Normal, Bytes::from(vec![0u8; 9]))
            .await
            .unwrap();
        let err = queue
            .add(ItemKind::Misc, dev(0), cfg(0), Priority::Normal, Bytes::from(vec![0u8; 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, InternalError::Memory(_)));
    }

    #[tokio::test]
    async fn higher_priority_items_sort_first() {
        let queue = MessageQueue::new(QueueByteBudget::try_new(1000).unwrap());
        queue.add(ItemKind::Misc, dev(0), cfg(0), Priority::Low, Bytes::from_static(b"low")).await.unwrap();
        queue.add(ItemKind::Misc, dev(0), cfg(0), Priority::Urgent, Bytes::from_static(b"urgent")).await.unwrap();
        queue.add(ItemKind::Misc, dev(0), cfg(0), Priority::Normal, Bytes::from_static(b"normal")).await.unwrap();

        let message_id = MessageQueue::new_message_id();
        let items = queue.fetch_for_delivery(cfg(0), 10, message_id).await;
        assert_eq!(items[0].content, Bytes::from_static(b"urgent"));
        assert_eq!(items[1].content, Bytes::from_static(b"normal"));
        assert_eq!(items[2].content, Bytes::from_static(b"low"));
    }

    #[tokio::test]
    async fn same_priority_preserves_arrival_order() {
        let queue = MessageQueue::new(QueueByteBudget::try_new(1000).unwrap());
        queue.add(ItemKind::Misc, dev(0), cfg(0), Priority::Normal, Bytes::from_static(b"first")).await.unwrap();
        queue.add(ItemKind::Misc, dev(0), cfg(0), Priority::Normal, Bytes::from_static(b"second")).await.unwrap();
        let items = queue.fetch_for_delivery(cfg(0), 10, MessageQueue::new_message_id()).await;
        assert_eq!(items[0].content, Bytes::from_static(b"first"));
        assert_eq!(items[1].content, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn delete_by_message_id_removes_only_matching_items() {
        let queue = MessageQueue::new(QueueByteBudget::try_new(1000).unwrap());
        queue.add(ItemKind::Misc, dev(1), cfg(0), Priority::Normal, Bytes::from_static(b"a")).await.unwrap();
        queue.add(ItemKind::Misc, dev(2), cfg(0), Priority::Normal, Bytes::from_static(b"b")).await.unwrap();
        let mid = MessageQueue::new_message_id();
        queue.fetch_for_delivery(cfg(0), 1, mid).await;
        queue.delete_by_message_id(mid, dev(1)).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn requeue_clears_in_flight_tag_on_failure() {
        let queue = MessageQueue::new(QueueByteBudget::try_new(1000).unwrap());
        queue.add(ItemKind::Misc, dev(1), cfg(0), Priority::Normal, Bytes::from_static(b"a")).await.unwrap();
        let mid = MessageQueue::new_message_id();
        let fetched = queue.fetch_for_delivery(cfg(0), 1, mid).await;
        assert_eq!(fetched.len(), 1);
        queue.requeue_by_message_id(mid).await;
        let fetched_again = queue.fetch_for_delivery(cfg(0), 1, MessageQueue::new_message_id()).await;
        assert_eq!(fetched_again.len(), 1);
    }
}
