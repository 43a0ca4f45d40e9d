use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::DocumentId;

/// Monitor event emitted while a tree is built.
/// Serialized as `{type, documentId, details, timestamp}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEvent {
    #[serde(rename = "type")]
    pub kind: IndexEventKind,
    pub document_id: DocumentId,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl IndexEvent {
    pub fn new(kind: IndexEventKind, document_id: &DocumentId, details: serde_json::Value) -> Self {
        Self {
            kind,
            document_id: document_id.clone(),
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexEventKind {
    ChunkEmitted,
    LevelCompleted,
    FallbackTriggered,
    ExternalCallFailed,
    BudgetExceeded,
    BuildCompleted,
}

impl IndexEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChunkEmitted => "chunk_emitted",
            Self::LevelCompleted => "level_completed",
            Self::FallbackTriggered => "fallback_triggered",
            Self::ExternalCallFailed => "external_call_failed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::BuildCompleted => "build_completed",
        }
    }
}

/// Non-blocking fan-out of [`IndexEvent`]s. Publishing never waits on
/// listeners and never fails when nobody is subscribed.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<IndexEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: IndexEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, kind: IndexEventKind, document_id: &DocumentId, details: serde_json::Value) {
        self.publish(IndexEvent::new(kind, document_id, details));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let doc = DocumentId::from_raw("doc_1");
        let event = IndexEvent::new(
            IndexEventKind::FallbackTriggered,
            &doc,
            serde_json::json!({"reason": "malformed"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "fallback_triggered");
        assert_eq!(json["documentId"], "doc_1");
        assert_eq!(json["details"]["reason"], "malformed");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn event_type_matches_serde_name() {
        let kinds = [
            IndexEventKind::ChunkEmitted,
            IndexEventKind::LevelCompleted,
            IndexEventKind::FallbackTriggered,
            IndexEventKind::ExternalCallFailed,
            IndexEventKind::BudgetExceeded,
            IndexEventKind::BuildCompleted,
        ];
        for kind in kinds {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let sink = EventSink::new(4);
        sink.emit(
            IndexEventKind::ChunkEmitted,
            &DocumentId::new(),
            serde_json::Value::Null,
        );
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let sink = EventSink::new(4);
        let mut rx = sink.subscribe();
        let doc = DocumentId::new();
        sink.emit(IndexEventKind::LevelCompleted, &doc, serde_json::json!({"level": 1}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, IndexEventKind::LevelCompleted);
        assert_eq!(event.document_id, doc);
        assert_eq!(event.event_type(), "level_completed");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();
        let doc = DocumentId::new();
        for i in 0..10 {
            sink.emit(IndexEventKind::ChunkEmitted, &doc, serde_json::json!({"seq": i}));
        }
        // Oldest events are dropped for a lagging receiver.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
