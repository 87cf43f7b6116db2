//! Forwarding human edits of the form record into the model's context.
//!
//! The bridge keeps the last snapshot the model is known to have seen. An
//! edit is sent only when its serialized text differs from that snapshot.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::session::{ConversationItem, RealtimeSession};

/// Text of the user message that carries a new baseline.
pub fn sync_message(snapshot: &str) -> String {
    format!(
        "The current modelData value is {snapshot}. When updating this later, include all \
         these same values if they are unchanged (or they will be overwritten with nulls)."
    )
}

/// Last-sent snapshot tracking. Clones share the same snapshot, so the tool
/// handler and the event loop see each other's updates.
#[derive(Debug, Clone, Default)]
pub struct ModelSyncBridge {
    last_sent: Arc<Mutex<Option<String>>>,
}

impl ModelSyncBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `model` to the session as a new baseline unless it matches the
    /// last snapshot. Returns whether a message was sent.
    ///
    /// The snapshot is recorded only after the session accepted the item.
    pub async fn notify_external_edit<M: Serialize>(
        &self,
        model: &M,
        session: &dyn RealtimeSession,
    ) -> Result<bool> {
        let snapshot = serde_json::to_string(model)?;
        if self.last_sent.lock().as_deref() == Some(snapshot.as_str()) {
            debug!("model unchanged since last sync");
            return Ok(false);
        }
        session
            .add_item(ConversationItem::UserMessage {
                text: sync_message(&snapshot),
            })
            .await?;
        *self.last_sent.lock() = Some(snapshot);
        Ok(true)
    }

    /// Record a snapshot the model produced itself, so its echo from the UI
    /// is not sent back as a human edit.
    pub fn record_applied<M: Serialize>(&self, model: &M) -> Result<()> {
        let snapshot = serde_json::to_string(model)?;
        *self.last_sent.lock() = Some(snapshot);
        Ok(())
    }

    /// Forget the baseline. A new session has seen nothing yet.
    pub fn reset(&self) {
        *self.last_sent.lock() = None;
    }

    pub fn last_sent(&self) -> Option<String> {
        self.last_sent.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ScriptStep, ScriptedSessionFactory, SessionFactory};
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn only_distinct_snapshots_are_sent() {
        let factory = ScriptedSessionFactory::new(Vec::<ScriptStep>::new());
        let log = factory.log();
        let session = factory.open().await.expect("open");
        let bridge = ModelSyncBridge::new();

        let a = json!({ "caseId": "A" });
        let b = json!({ "caseId": "B" });
        let mut sent = Vec::new();
        for edit in [&a, &a, &b, &a] {
            sent.push(
                bridge
                    .notify_external_edit(edit, session.as_ref())
                    .await
                    .expect("sync"),
            );
        }

        assert_eq!(sent, vec![true, false, true, true]);
        let log = log.lock();
        assert_eq!(log.items.len(), 3);
        let ConversationItem::UserMessage { text } = &log.items[2] else {
            panic!("expected a user message");
        };
        assert!(text.starts_with(r#"The current modelData value is {"caseId":"A"}."#));
    }

    #[tokio::test]
    async fn failed_send_is_retried_by_the_next_identical_edit() {
        let factory = ScriptedSessionFactory::new(vec![ScriptStep::Fail("gone".into())]);
        let session = factory.open().await.expect("open");
        // Draining the failing stream marks the session unusable.
        let _: Vec<_> = session.receive_events().expect("events").collect().await;

        let bridge = ModelSyncBridge::new();
        let a = json!({ "caseId": "A" });
        assert!(bridge.notify_external_edit(&a, session.as_ref()).await.is_err());
        assert_eq!(bridge.last_sent(), None);
    }

    #[tokio::test]
    async fn applied_model_updates_are_not_echoed() {
        let factory = ScriptedSessionFactory::new(Vec::<ScriptStep>::new());
        let log = factory.log();
        let session = factory.open().await.expect("open");
        let bridge = ModelSyncBridge::new();

        let from_model = json!({ "caseId": "X1" });
        bridge.record_applied(&from_model).expect("record");
        let sent = bridge
            .notify_external_edit(&from_model, session.as_ref())
            .await
            .expect("sync");
        assert!(!sent);
        assert!(log.lock().items.is_empty());
    }
}
