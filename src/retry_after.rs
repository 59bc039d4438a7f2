//! Retry-after store (C6): a key-prefixed expiring marker preventing
//! premature reclaim. Presence alone is the signal; the value is unused.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::error::BrokerError;

pub struct RetryAfterStore<B: Broker> {
    broker: Arc<B>,
}

impl<B: Broker> RetryAfterStore<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }

    fn key(message_id: &str) -> String {
        format!("retry-after{message_id}")
    }

    pub async fn mark(&self, message_id: &str, delay: Duration) -> Result<(), BrokerError> {
        self.broker.set(&Self::key(message_id), "1", Some(delay)).await
    }

    pub async fn is_marked(&self, message_id: &str) -> Result<bool, BrokerError> {
        Ok(self.broker.get(&Self::key(message_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;

    #[tokio::test]
    async fn mark_then_check() {
        let store = RetryAfterStore::new(Arc::new(InMemoryBroker::new()));
        assert!(!store.is_marked("msg-1").await.unwrap());
        store.mark("msg-1", Duration::from_secs(10)).await.unwrap();
        assert!(store.is_marked("msg-1").await.unwrap());
    }
}
