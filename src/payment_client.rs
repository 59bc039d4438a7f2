//! Upstream Payment service client and the HTTP-status classification
//! shared by the Prepare (C9) and Submit (C10) handlers.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::txn_store::AttestedTransaction;

/// Minimum retry-after delay the consumer will honor for a transient
/// upstream failure, per §4.7/§4.8.
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum UpstreamOutcome<T> {
    Success(T),
    RetryAfter(Duration),
    Permanent(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub to: String,
    pub from: String,
    pub amount: u64,
    pub currency: String,
    pub custodian: String,
    pub payout_id: String,
}

pub struct PaymentClient {
    http: reqwest::Client,
    base_url: String,
}

impl PaymentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// `POST /v1/payments/prepare`. Success maps the response body plus
    /// the `X-Nitro-Attestation` header into an [`AttestedTransaction`].
    pub async fn prepare(&self, body: &PaymentDetails) -> UpstreamOutcome<AttestedTransaction> {
        let result = self
            .http
            .post(format!("{}/v1/payments/prepare", self.base_url))
            .json(body)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(_) => return UpstreamOutcome::RetryAfter(MIN_RETRY_AFTER),
        };

        match classify_status(response.status()) {
            StatusClass::Permanent => UpstreamOutcome::Permanent(format!("prepare rejected: {}", response.status())),
            StatusClass::Transient => UpstreamOutcome::RetryAfter(MIN_RETRY_AFTER),
            StatusClass::Success => {
                let attestation_document = response
                    .headers()
                    .get("X-Nitro-Attestation")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                match response.json::<PreparedResponse>().await {
                    Ok(prepared) => UpstreamOutcome::Success(AttestedTransaction {
                        to: body.to.clone(),
                        from: body.from.clone(),
                        amount: body.amount,
                        currency: body.currency.clone(),
                        custodian: body.custodian.clone(),
                        payout_id: body.payout_id.clone(),
                        document_id: prepared.document_id,
                        attestation_document,
                    }),
                    Err(_) => UpstreamOutcome::RetryAfter(MIN_RETRY_AFTER),
                }
            }
        }
    }

    /// `POST /v1/payments/submit`. Headers are taken verbatim from the
    /// envelope (single string per header); 202 with `X-Submit-Retry-After`
    /// is pending, absent header on 202 defaults to 0 seconds.
    pub async fn submit(&self, auth_headers: &HashMap<String, String>, body: &AttestedTransaction) -> UpstreamOutcome<()> {
        let mut request = self.http.post(format!("{}/v1/payments/submit", self.base_url)).json(body);
        for (k, v) in auth_headers {
            request = request.header(k, v);
        }

        let result = request.send().await;
        let response = match result {
            Ok(r) => r,
            Err(_) => return UpstreamOutcome::RetryAfter(MIN_RETRY_AFTER),
        };

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            let seconds = response
                .headers()
                .get("X-Submit-Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            return UpstreamOutcome::RetryAfter(Duration::from_secs(seconds));
        }

        match classify_status(status) {
            StatusClass::Permanent => UpstreamOutcome::Permanent(format!("submit rejected: {status}")),
            StatusClass::Transient => UpstreamOutcome::RetryAfter(MIN_RETRY_AFTER),
            StatusClass::Success => UpstreamOutcome::Success(()),
        }
    }
}

#[derive(Deserialize)]
struct PreparedResponse {
    document_id: String,
}

enum StatusClass {
    Success,
    Permanent,
    Transient,
}

/// Per §6: 200/201/204/202 success; 400/401 permanent; 403/408/425/429/5xx
/// transient.
fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT | StatusCode::ACCEPTED => StatusClass::Success,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => StatusClass::Permanent,
        StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_EARLY
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => StatusClass::Transient,
        s if s.is_success() => StatusClass::Success,
        _ => StatusClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_and_transient_per_spec_table() {
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST), StatusClass::Permanent));
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED), StatusClass::Permanent));
        assert!(matches!(classify_status(StatusCode::FORBIDDEN), StatusClass::Transient));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS), StatusClass::Transient));
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE), StatusClass::Transient));
        assert!(matches!(classify_status(StatusCode::OK), StatusClass::Success));
    }
}
