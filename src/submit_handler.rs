//! Submit-phase handler (C10): decodes an [`AttestedTransaction`] envelope,
//! forwards the envelope's own headers verbatim as the upstream request's
//! headers, and maps a 202-pending response to a retry-after outcome.

use std::sync::Arc;

use crate::envelope::Envelope;
use crate::error::HandlerError;
use crate::payment_client::{PaymentClient, UpstreamOutcome};
use crate::stream_consumer::{Handler, HandlerOutcome};
use crate::txn_store::AttestedTransaction;

pub struct SubmitHandler {
    payment: Arc<PaymentClient>,
}

impl SubmitHandler {
    pub fn new(payment: Arc<PaymentClient>) -> Self {
        Self { payment }
    }
}

impl Handler for SubmitHandler {
    async fn handle(&self, envelope: Envelope) -> HandlerOutcome {
        let attested: AttestedTransaction = match envelope.decode_body() {
            Ok(a) => a,
            Err(e) => return HandlerOutcome::Err(HandlerError::Malformed(e.to_string())),
        };

        match self.payment.submit(&envelope.headers, &attested).await {
            UpstreamOutcome::Success(()) => HandlerOutcome::Ack,
            UpstreamOutcome::RetryAfter(delay) => HandlerOutcome::RetryAfter(delay),
            UpstreamOutcome::Permanent(reason) => HandlerOutcome::Err(HandlerError::Upstream(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_shared_client() {
        let payment = Arc::new(PaymentClient::new("http://localhost:9999"));
        let _handler = SubmitHandler::new(payment);
    }
}
