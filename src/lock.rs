//! Payout lock (§3 Lock / §4.10 step 2): a TTL'd mutex over a payout id,
//! serializing the upload step across worker instances. Built on the
//! broker's `acquire_lock`/`release_lock` primitives (C1).

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::broker::Broker;
use crate::error::BrokerError;

pub struct PayoutLock<B: Broker> {
    broker: Arc<B>,
}

/// A held lock. Dropping this without calling [`release`](PayoutLockGuard::release)
/// leaves the key to expire naturally via its TTL — there is no `Drop`
/// impl, since release is async and the teacher's own lock usage is
/// always paired with an explicit release in the owning loop.
pub struct PayoutLockGuard {
    key: String,
    token: String,
}

impl<B: Broker> PayoutLock<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }

    fn key(payout_id: &str) -> String {
        payout_id.to_string()
    }

    /// Attempts to acquire the lock for `payout_id` with the given TTL.
    /// Returns `None` if another worker currently holds it.
    pub async fn try_acquire(&self, payout_id: &str, ttl: Duration) -> Result<Option<PayoutLockGuard>, BrokerError> {
        let key = Self::key(payout_id);
        let token = Uuid::new_v4().to_string();
        if self.broker.acquire_lock(&key, &token, ttl).await? {
            Ok(Some(PayoutLockGuard { key, token }))
        } else {
            Ok(None)
        }
    }

    /// Releases a previously acquired lock. `LockValueMismatch` is a
    /// benign, expected outcome (our TTL expired and another worker took
    /// over) and the caller should log it at `warn` rather than treat it
    /// as a failure.
    pub async fn release(&self, guard: PayoutLockGuard) -> Result<(), BrokerError> {
        self.broker.release_lock(&guard.key, &guard.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let lock = PayoutLock::new(Arc::new(InMemoryBroker::new()));
        let guard = lock.try_acquire("payout-1", Duration::from_secs(60)).await.unwrap();
        assert!(guard.is_some());
        assert!(lock.try_acquire("payout-1", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let lock = PayoutLock::new(Arc::new(InMemoryBroker::new()));
        let guard = lock.try_acquire("payout-1", Duration::from_secs(60)).await.unwrap().unwrap();
        lock.release(guard).await.unwrap();
        assert!(lock.try_acquire("payout-1", Duration::from_secs(60)).await.unwrap().is_some());
    }
}
