//! Completion notification (§4.10 step 4): publishes `{payout_id,
//! report_uri, version_id}` to the configured notification topic as a
//! stream entry. Retry policy is "default, always-retriable" — callers
//! that get a transport error should retry the whole step, not skip it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::broker::Broker;
use crate::envelope::Envelope;
use crate::error::BrokerError;

#[derive(Debug, Serialize)]
pub struct CompletionNotice {
    pub payout_id: String,
    pub report_uri: String,
    pub version_id: String,
}

pub struct Notifier<B: Broker> {
    broker: Arc<B>,
    topic: String,
    enabled: bool,
}

impl<B: Broker> Notifier<B> {
    pub fn new(broker: Arc<B>, topic: impl Into<String>, enabled: bool) -> Self {
        Self {
            broker,
            topic: topic.into(),
            enabled,
        }
    }

    /// No-ops when the notification toggle is off. Otherwise appends the
    /// notice as a stream entry; transport failures propagate so the
    /// caller can retry the whole upload-to-notify step.
    ///
    /// Deduplicated on `payout_id` (spec's message-deduplication-id):
    /// a `notify-sent-<payout_id>` marker, set only if absent, guards the
    /// append so a retried call after a crash between append and lock
    /// release doesn't publish a second completion message.
    pub async fn notify(&self, notice: &CompletionNotice) -> Result<(), BrokerError> {
        if !self.enabled {
            return Ok(());
        }
        let dedup_key = format!("notify-sent-{}", notice.payout_id);
        if !self.broker.set_if_absent(&dedup_key, "1", None).await? {
            return Ok(());
        }
        let envelope = Envelope::new_from(notice).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut values = HashMap::new();
        values.insert("data".to_string(), envelope.serialize().map_err(|e| BrokerError::Transport(e.to_string()))?);
        self.broker.append(&self.topic, &values).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;

    #[tokio::test]
    async fn disabled_notifier_does_not_append() {
        let broker = Arc::new(InMemoryBroker::new());
        let notifier = Notifier::new(broker.clone(), "payout-complete", false);
        notifier
            .notify(&CompletionNotice {
                payout_id: "payout-1".into(),
                report_uri: "s3://bucket/key".into(),
                version_id: "v1".into(),
            })
            .await
            .unwrap();
        assert!(broker.read("payout-complete", "0", 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_notifier_appends_entry() {
        let broker = Arc::new(InMemoryBroker::new());
        let notifier = Notifier::new(broker.clone(), "payout-complete", true);
        notifier
            .notify(&CompletionNotice {
                payout_id: "payout-1".into(),
                report_uri: "s3://bucket/key".into(),
                version_id: "v1".into(),
            })
            .await
            .unwrap();
        let entries = broker.read("payout-complete", "0", 10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn retried_notify_for_same_payout_appends_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let notifier = Notifier::new(broker.clone(), "payout-complete", true);
        let notice = CompletionNotice {
            payout_id: "payout-1".into(),
            report_uri: "s3://bucket/key".into(),
            version_id: "v1".into(),
        };
        notifier.notify(&notice).await.unwrap();
        notifier.notify(&notice).await.unwrap();
        let entries = broker.read("payout-complete", "0", 10, None).await.unwrap();
        assert_eq!(entries.len(), 1, "duplicate notify for the same payout_id must not double-publish");
    }
}
