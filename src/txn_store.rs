//! Transaction store (C8): sorted-set-backed idempotent storage of
//! attested transactions per payout, keyed `txn-store-<payout_id>`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestedTransaction {
    pub to: String,
    pub from: String,
    pub amount: u64,
    pub currency: String,
    pub custodian: String,
    pub payout_id: String,
    pub document_id: String,
    /// base64-encoded attestation document.
    pub attestation_document: String,
}

pub struct TransactionStore<B: Broker> {
    broker: Arc<B>,
}

impl<B: Broker> TransactionStore<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }

    fn key(payout_id: &str) -> String {
        format!("txn-store-{payout_id}")
    }

    /// Add-only-if-not-exists: a duplicate `attested` (identical JSON) is
    /// silently dropped by the broker. This is what makes the pipeline
    /// idempotent against at-least-once delivery — do not read-then-write.
    pub async fn save(&self, payout_id: &str, attested: &AttestedTransaction) -> Result<(), BrokerError> {
        let member = serde_json::to_string(attested).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let score = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as f64;
        self.broker.zadd_only_new(&Self::key(payout_id), score, &member).await?;
        Ok(())
    }

    pub async fn count(&self, payout_id: &str) -> Result<i64, BrokerError> {
        self.broker.zcard(&Self::key(payout_id)).await
    }

    /// Inclusive paged range fetch; `-1` means "last element", matching
    /// the broker's sorted-set range semantics.
    pub async fn fetch(&self, payout_id: &str, start: i64, stop: i64) -> Result<Vec<AttestedTransaction>, BrokerError> {
        let members = self.broker.zrange(&Self::key(payout_id), start, stop).await?;
        members
            .into_iter()
            .map(|m| serde_json::from_str(&m).map_err(|e| BrokerError::Transport(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;

    fn sample(doc_id: &str) -> AttestedTransaction {
        AttestedTransaction {
            to: "alice".into(),
            from: "payout-system".into(),
            amount: 100,
            currency: "USD".into(),
            custodian: "custodian-a".into(),
            payout_id: "payout-1".into(),
            document_id: doc_id.into(),
            attestation_document: "YmFzZTY0".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_save_collapses() {
        let store = TransactionStore::new(Arc::new(InMemoryBroker::new()));
        let tx = sample("doc-1");
        store.save("payout-1", &tx).await.unwrap();
        store.save("payout-1", &tx).await.unwrap();
        assert_eq!(store.count("payout-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_round_trips() {
        let store = TransactionStore::new(Arc::new(InMemoryBroker::new()));
        store.save("payout-1", &sample("doc-1")).await.unwrap();
        store.save("payout-1", &sample("doc-2")).await.unwrap();
        let fetched = store.fetch("payout-1", 0, -1).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }
}
