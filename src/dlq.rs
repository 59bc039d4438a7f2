//! Dead-letter routing (C5): wraps a failed raw entry in a new envelope
//! with diagnostic headers and appends it to the configured DLQ stream.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::{Broker, StreamEntry};
use crate::envelope::Envelope;
use crate::error::BrokerError;

pub struct DlqHandler<B: Broker> {
    broker: Arc<B>,
    dlq_stream: String,
    consumer_id: String,
    consumer_group: String,
    source_stream: String,
}

impl<B: Broker> DlqHandler<B> {
    pub fn new(
        broker: Arc<B>,
        source_stream: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        let source_stream = source_stream.into();
        Self {
            broker,
            // Spec §4.10.1/§6 name this keyspace `<stream>-dql` verbatim.
            dlq_stream: format!("{source_stream}-dql"),
            consumer_id: consumer_id.into(),
            consumer_group: consumer_group.into(),
            source_stream,
        }
    }

    /// Routes a raw (already-fetched) stream entry to the DLQ. Bubbles the
    /// append error up so the original entry is left un-acked and reclaim
    /// retries later.
    pub async fn route(&self, entry: &StreamEntry, message: &str) -> Result<(), BrokerError> {
        let mut envelope = Envelope::new_from(&entry.values).map_err(|e| BrokerError::Transport(e.to_string()))?;
        envelope.set_header("x-err-on-consumer-id", self.consumer_id.clone());
        envelope.set_header("x-err-on-consumer-group", self.consumer_group.clone());
        envelope.set_header("x-err-on-stream", self.source_stream.clone());
        envelope.set_header("x-err-message", message);

        let serialized = envelope.serialize().map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut values = HashMap::new();
        values.insert("data".to_string(), serialized);
        self.broker.append(&self.dlq_stream, &values).await?;
        Ok(())
    }

    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;

    #[tokio::test]
    async fn routes_raw_entry_with_diagnostic_headers() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq = DlqHandler::new(broker.clone(), "s", "g", "c1");

        let mut values = HashMap::new();
        values.insert("data".to_string(), "not json".to_string());
        let entry = StreamEntry {
            id: "1-0".to_string(),
            values,
        };

        dlq.route(&entry, "malformed body").await.unwrap();

        assert_eq!(broker.zcard("unrelated").await.unwrap(), 0);
        let got = broker.read("s-dql", "0", 10, None).await.unwrap();
        assert_eq!(got.len(), 1);
        let envelope = Envelope::parse(got[0].values.get("data").unwrap()).unwrap();
        assert_eq!(envelope.headers.get("x-err-on-stream"), Some(&"s".to_string()));
        assert_eq!(envelope.headers.get("x-err-message"), Some(&"malformed body".to_string()));
    }
}
