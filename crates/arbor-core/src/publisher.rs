// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session event fan-out over broadcast channels.
//!
//! Delivery is fire-and-forget: a publish with no subscribers, or to a
//! lagging subscriber, never blocks or fails the caller.  Subscribers of
//! one session observe its events in publish order; nothing is guaranteed
//! across sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::events::AgentEvent;

const DEFAULT_TOPIC_CAPACITY: usize = 256;

pub struct EventPublisher {
    topics: Mutex<HashMap<String, broadcast::Sender<AgentEvent>>>,
    capacity: usize,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { topics: Mutex::new(HashMap::new()), capacity }
    }

    /// The topic path subscribers address, `/agent/{sessionId}`.
    pub fn topic_path(session_id: &str) -> String {
        format!("/agent/{session_id}")
    }

    fn sender(&self, session_id: &str) -> broadcast::Sender<AgentEvent> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<AgentEvent> {
        self.sender(session_id).subscribe()
    }

    /// Fire-and-forget broadcast.  A send error only means nobody is
    /// listening right now.
    pub fn publish(&self, event: AgentEvent) {
        let sender = self.sender(&event.session_id);
        if sender.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }

    /// Drop a finished session's topic.
    pub fn remove(&self, session_id: &str) {
        self.topics.lock().unwrap().remove(session_id);
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AgentEventKind;

    #[test]
    fn topic_path_format() {
        assert_eq!(EventPublisher::topic_path("abc"), "/agent/abc");
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let p = EventPublisher::new();
        let mut rx = p.subscribe("s1");
        for i in 0..5 {
            p.publish(
                AgentEvent::new("s1", AgentEventKind::Thinking)
                    .with_content(format!("t{i}"))
                    .at_iteration(1),
            );
        }
        for i in 0..5 {
            let e = rx.recv().await.unwrap();
            assert_eq!(e.content.as_deref(), Some(format!("t{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let p = EventPublisher::new();
        p.publish(AgentEvent::new("nobody", AgentEventKind::Error).with_content("lost"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let p = EventPublisher::new();
        let mut rx_a = p.subscribe("a");
        let mut rx_b = p.subscribe("b");
        p.publish(AgentEvent::new("a", AgentEventKind::FinalAnswer).with_content("for a"));
        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.content.as_deref(), Some("for a"));
        assert!(rx_b.try_recv().is_err(), "b must not see a's events");
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_per_session() {
        let p = EventPublisher::new();
        let mut rx = p.subscribe("s1");
        for _ in 0..3 {
            p.publish(AgentEvent::new("s1", AgentEventKind::Thinking));
        }
        let mut last = 0i64;
        for _ in 0..3 {
            let e = rx.recv().await.unwrap();
            assert!(e.timestamp_ms >= last);
            last = e.timestamp_ms;
        }
    }

    #[tokio::test]
    async fn removed_topic_recreates_on_next_use() {
        let p = EventPublisher::new();
        let _rx = p.subscribe("s1");
        p.remove("s1");
        let mut rx2 = p.subscribe("s1");
        p.publish(AgentEvent::new("s1", AgentEventKind::Error).with_content("after"));
        assert_eq!(rx2.recv().await.unwrap().content.as_deref(), Some("after"));
    }
}
