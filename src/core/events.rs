/*!
 * Lifecycle and progress events
 *
 * Events go out over a bounded broadcast channel. Publishing never waits:
 * a subscriber that falls more than `capacity` events behind loses the oldest
 * ones, and publishing with no subscribers at all is a no-op.
 */

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

use crate::core::task::{Direction, TaskId, TaskState};
use crate::error::TransferFailure;

/// Aggregate manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Size of the global worker pool
    pub total_slots: usize,
    /// Workers currently handed out
    pub active_slots: usize,
    /// Tasks initializing, active or paused
    pub active_transfers: usize,
    pub queued_transfers: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Event published by the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Queued {
        task_id: TaskId,
        name: String,
        direction: Direction,
        total_bytes: u64,
        timestamp: u64,
    },
    Started {
        task_id: TaskId,
        /// Bytes already done by an earlier, interrupted run
        resumed_bytes: u64,
        total_bytes: u64,
        timestamp: u64,
    },
    Progress {
        task_id: TaskId,
        state: TaskState,
        bytes_transferred: u64,
        total_bytes: u64,
        bytes_per_second: f64,
        timestamp: u64,
    },
    Completed {
        task_id: TaskId,
        total_bytes: u64,
        duration_ms: u64,
        checksum: Option<String>,
        timestamp: u64,
    },
    Failed {
        task_id: TaskId,
        failure: TransferFailure,
        bytes_transferred: u64,
        timestamp: u64,
    },
    Cancelled {
        task_id: TaskId,
        bytes_transferred: u64,
        timestamp: u64,
    },
    QueueStatsUpdated {
        stats: ManagerStats,
        timestamp: u64,
    },
}

impl TransferEvent {
    /// Task the event is about, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            TransferEvent::Queued { task_id, .. }
            | TransferEvent::Started { task_id, .. }
            | TransferEvent::Progress { task_id, .. }
            | TransferEvent::Completed { task_id, .. }
            | TransferEvent::Failed { task_id, .. }
            | TransferEvent::Cancelled { task_id, .. } => Some(*task_id),
            TransferEvent::QueueStatsUpdated { .. } => None,
        }
    }

    /// Task state the event reports
    pub fn state(&self) -> Option<TaskState> {
        match self {
            TransferEvent::Queued { .. } => Some(TaskState::Queued),
            TransferEvent::Started { .. } => Some(TaskState::Active),
            TransferEvent::Progress { state, .. } => Some(*state),
            TransferEvent::Completed { .. } => Some(TaskState::Completed),
            TransferEvent::Failed { .. } => Some(TaskState::Failed),
            TransferEvent::Cancelled { .. } => Some(TaskState::Cancelled),
            TransferEvent::QueueStatsUpdated { .. } => None,
        }
    }

    pub fn class(&self) -> EventClass {
        match self {
            TransferEvent::Progress { .. } => EventClass::Progress,
            TransferEvent::QueueStatsUpdated { .. } => EventClass::Stats,
            _ => EventClass::Lifecycle,
        }
    }
}

/// Subscription filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    All,
    /// Queued, Started, Completed, Failed, Cancelled
    Lifecycle,
    Progress,
    /// QueueStatsUpdated
    Stats,
}

impl EventClass {
    pub fn matches(self, event: &TransferEvent) -> bool {
        self == EventClass::All || self == event.class()
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fan-out point for events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish without waiting; returns the number of subscribers reached
    pub fn publish(&self, event: TransferEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, class: EventClass) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            class,
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One subscriber's view of the bus
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<TransferEvent>,
    class: EventClass,
    dropped: u64,
}

impl EventStream {
    /// Next matching event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.class.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<TransferEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.class.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost by falling behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = TransferEvent> {
        stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        debug!(dropped = n, "event subscriber lagged; oldest events dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn cancelled(task_id: TaskId, bytes: u64) -> TransferEvent {
        TransferEvent::Cancelled {
            task_id,
            bytes_transferred: bytes,
            timestamp: now_millis(),
        }
    }

    fn progress(task_id: TaskId, bytes: u64) -> TransferEvent {
        TransferEvent::Progress {
            task_id,
            state: TaskState::Active,
            bytes_transferred: bytes,
            total_bytes: 100,
            bytes_per_second: 0.0,
            timestamp: now_millis(),
        }
    }

    #[test]
    fn test_publish_without_subscribers_never_blocks() {
        let bus = EventBus::new(2);
        for i in 0..100 {
            assert_eq!(bus.publish(progress(TaskId::new(), i)), 0);
        }
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut events = bus.subscribe(EventClass::All);
        let id = TaskId::new();
        for i in 0..10 {
            bus.publish(progress(id, i));
        }

        let mut seen = Vec::new();
        while let Some(TransferEvent::Progress {
            bytes_transferred, ..
        }) = events.try_recv()
        {
            seen.push(bytes_transferred);
        }
        assert_eq!(seen, vec![6, 7, 8, 9]);
        assert_eq!(events.dropped(), 6);
    }

    #[test]
    fn test_class_filter() {
        let bus = EventBus::new(16);
        let mut lifecycle = bus.subscribe(EventClass::Lifecycle);
        let mut stats = bus.subscribe(EventClass::Stats);
        let id = TaskId::new();

        bus.publish(progress(id, 1));
        bus.publish(cancelled(id, 1));
        bus.publish(TransferEvent::QueueStatsUpdated {
            stats: ManagerStats::default(),
            timestamp: now_millis(),
        });

        let event = lifecycle.try_recv().unwrap();
        assert_eq!(event.state(), Some(TaskState::Cancelled));
        assert_eq!(event.task_id(), Some(id));
        assert!(lifecycle.try_recv().is_none());

        assert!(matches!(
            stats.try_recv(),
            Some(TransferEvent::QueueStatsUpdated { .. })
        ));
        assert!(stats.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new(8);
        let events = bus.subscribe(EventClass::All);
        bus.publish(cancelled(TaskId::new(), 0));
        drop(bus);

        let collected: Vec<_> = events.into_stream().collect().await;
        assert_eq!(collected.len(), 1);
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_value(cancelled(TaskId::new(), 5)).unwrap();
        assert_eq!(json["event"], "cancelled");
        assert_eq!(json["bytes_transferred"], 5);
    }
}
