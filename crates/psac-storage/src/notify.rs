use std::collections::VecDeque;

use async_trait::async_trait;
use psac_core::NotificationEvent;
use tokio::sync::Mutex;
use tracing::warn;

use crate::NotificationSink;

/// Writes every event to the log at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, event: NotificationEvent) {
        warn!(
            kind = ?event.kind,
            channel_id = ?event.channel_id,
            at = %event.at,
            "{}",
            event.message
        );
    }
}

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Keeps the most recent events in memory, optionally forwarding them to the
/// log as well. The oldest event is dropped once `capacity` is reached.
#[derive(Debug)]
pub struct MemoryNotificationSink {
    events: Mutex<VecDeque<NotificationEvent>>,
    capacity: usize,
    forward_to_log: bool,
}

impl Default for MemoryNotificationSink {
    fn default() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_EVENT_CAPACITY,
            forward_to_log: false,
        }
    }
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logging() -> Self {
        Self {
            forward_to_log: true,
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// The most recent `limit` events, newest last.
    pub async fn recent(&self, limit: usize) -> Vec<NotificationEvent> {
        let events = self.events.lock().await;
        events.iter().skip(events.len().saturating_sub(limit)).cloned().collect()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, event: NotificationEvent) {
        if self.forward_to_log {
            LogNotificationSink.notify(event.clone()).await;
        }
        let mut events = self.events.lock().await;
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psac_core::NotificationKind;

    #[tokio::test]
    async fn memory_sink_keeps_events_in_order() {
        let sink = MemoryNotificationSink::new();
        for n in 0..3 {
            sink.notify(NotificationEvent::new(NotificationKind::BulkRemoval, Some(n), format!("event {n}")))
                .await;
        }
        assert_eq!(sink.events().await.len(), 3);
        let recent = sink.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].message, "event 2");
    }

    #[tokio::test]
    async fn memory_sink_drops_the_oldest_event_at_capacity() {
        let sink = MemoryNotificationSink::new().with_capacity(3);
        for n in 0..5 {
            sink.notify(NotificationEvent::new(NotificationKind::ChannelFailed, Some(n), format!("event {n}")))
                .await;
        }
        let events = sink.events().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "event 2");
        assert_eq!(events[2].message, "event 4");
        assert_eq!(sink.recent(10).await.len(), 3);
    }
}
