//! Payout-config client (C7): reads and advances the current payout
//! configuration from a dedicated config stream, bookmarked so a restarted
//! worker resumes exactly where it left off.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::envelope::Envelope;
use crate::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayoutConfig {
    pub payout_id: String,
    pub stream: String,
    pub consumer_group: String,
    pub count: i64,
    /// The stream-entry id of the config record itself; retained so the
    /// bookmark can advance past it. Not part of the wire payload — it's
    /// filled in by the client after decoding.
    #[serde(skip, default)]
    pub x_broker_id: String,
}

pub struct PayoutConfigClient<B: Broker> {
    broker: Arc<B>,
    config_stream: String,
}

impl<B: Broker> PayoutConfigClient<B> {
    pub fn new(broker: Arc<B>, config_stream: impl Into<String>) -> Self {
        Self {
            broker,
            config_stream: config_stream.into(),
        }
    }

    fn bookmark_key(&self) -> String {
        format!("{}-last-processed-message-id", self.config_stream)
    }

    /// Reads the bookmark (initializing it to `"0"` on first use), then
    /// performs a blocking read for the next config entry. Returns `None`
    /// on the rare race where the blocking read comes back empty.
    pub async fn read_payout_config(&self) -> Result<Option<PayoutConfig>, BrokerError> {
        match self.broker.get(&self.bookmark_key()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.broker.set_if_absent(&self.bookmark_key(), "0", None).await?;
            }
            Err(BrokerError::KeyDoesNotExist) => {
                self.broker.set_if_absent(&self.bookmark_key(), "0", None).await?;
            }
            Err(e) => return Err(e),
        }
        let bookmark = self
            .broker
            .get(&self.bookmark_key())
            .await?
            .unwrap_or_else(|| "0".to_string());

        let entries = self
            .broker
            .read(&self.config_stream, &bookmark, 1, Some(Duration::MAX))
            .await?;

        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let Some(data) = entry.values.get("data") else {
            return Ok(None);
        };

        let envelope = Envelope::parse(data).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut config: PayoutConfig = envelope
            .decode_body()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        config.x_broker_id = entry.id;
        Ok(Some(config))
    }

    /// Unconditionally advances the bookmark to the config's own entry id.
    pub async fn set_last_processed_payout(&self, config: &PayoutConfig) -> Result<(), BrokerError> {
        self.broker.set(&self.bookmark_key(), &config.x_broker_id, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;
    use std::collections::HashMap;

    async fn push_config(broker: &InMemoryBroker, stream: &str, cfg: &PayoutConfig) {
        let envelope = Envelope::new_from(cfg).unwrap();
        let mut values = HashMap::new();
        values.insert("data".to_string(), envelope.serialize().unwrap());
        broker.append(stream, &values).await.unwrap();
    }

    #[tokio::test]
    async fn reads_and_advances_bookmark() {
        let broker = Arc::new(InMemoryBroker::new());
        let cfg = PayoutConfig {
            payout_id: "payout-1".into(),
            stream: "txn-payout-1".into(),
            consumer_group: "g".into(),
            count: 10,
            x_broker_id: String::new(),
        };
        push_config(&broker, "prepare-config", &cfg).await;

        let client = PayoutConfigClient::new(broker.clone(), "prepare-config");
        let read_back = client.read_payout_config().await.unwrap().unwrap();
        assert_eq!(read_back.payout_id, "payout-1");

        client.set_last_processed_payout(&read_back).await.unwrap();
        let bookmark = broker.get("prepare-config-last-processed-message-id").await.unwrap();
        assert_eq!(bookmark.as_deref(), Some(read_back.x_broker_id.as_str()));
    }

    #[tokio::test]
    async fn bookmark_initializes_to_zero_on_first_use() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = PayoutConfigClient::new(broker.clone(), "prepare-config");
        let result = client.read_payout_config().await.unwrap();
        assert!(result.is_none());
        assert_eq!(
            broker.get("prepare-config-last-processed-message-id").await.unwrap(),
            Some("0".to_string())
        );
    }
}
