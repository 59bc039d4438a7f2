//! Prepare-phase handler (C9): decodes a [`PaymentDetails`] envelope,
//! calls the upstream Payment service's prepare endpoint, and persists the
//! attested result in the transaction store.

use std::sync::Arc;

use crate::broker::Broker;
use crate::envelope::Envelope;
use crate::error::HandlerError;
use crate::payment_client::{PaymentClient, PaymentDetails, UpstreamOutcome, MIN_RETRY_AFTER};
use crate::stream_consumer::{Handler, HandlerOutcome};
use crate::txn_store::TransactionStore;

pub struct PrepareHandler<B: Broker> {
    payment: Arc<PaymentClient>,
    txns: Arc<TransactionStore<B>>,
}

impl<B: Broker> PrepareHandler<B> {
    pub fn new(payment: Arc<PaymentClient>, txns: Arc<TransactionStore<B>>) -> Self {
        Self { payment, txns }
    }
}

impl<B: Broker> Handler for PrepareHandler<B> {
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let details: PaymentDetails = match envelope.decode_body() {
            Ok(d) => d,
            Err(e) => return HandlerOutcome::Err(HandlerError::Malformed(e.to_string())),
        };

        match self.payment.prepare(&details).await {
            UpstreamOutcome::Success(attested) => match self.txns.save(&details.payout_id, &attested).await {
                Ok(()) => HandlerOutcome::Ack,
                // §4.7 point 4: a storage error is retried, not DLQ'd — the
                // attestation already succeeded upstream.
                Err(_) => HandlerOutcome::RetryAfter(MIN_RETRY_AFTER),
            },
            UpstreamOutcome::RetryAfter(delay) => HandlerOutcome::RetryAfter(delay),
            UpstreamOutcome::Permanent(reason) => HandlerOutcome::Err(HandlerError::Upstream(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::InMemoryBroker;

    #[test]
    fn constructs_with_shared_deps() {
        let broker = Arc::new(InMemoryBroker::new());
        let txns = Arc::new(TransactionStore::new(broker));
        let payment = Arc::new(PaymentClient::new("http://localhost:9999"));
        let _handler = PrepareHandler::new(payment, txns);
    }
}
