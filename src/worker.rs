//! Prepare and Submit workers (C12): per-payout serial orchestrators
//! binding the consumer engine (C4), payout config client (C7),
//! transaction store (C8), uploader (C11) and lock together.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::ConsumerTuning;
use crate::dlq::DlqHandler;
use crate::error::BrokerError;
use crate::lock::PayoutLock;
use crate::notification::{CompletionNotice, Notifier};
use crate::payment_client::PaymentClient;
use crate::payout_config::{PayoutConfig, PayoutConfigClient};
use crate::prepare_handler::PrepareHandler;
use crate::retry_after::RetryAfterStore;
use crate::stream_consumer::{Consumer, ConsumerConfig};
use crate::submit_handler::SubmitHandler;
use crate::txn_store::TransactionStore;
use crate::uploader::ReportUploader;

/// The payout lock's TTL (§4.10 step 2).
const LOCK_TTL: Duration = Duration::from_secs(15 * 60);

fn build_consumer_config(tuning: &ConsumerTuning, stream: &str, group: &str, consumer_id: &str) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(stream, group, consumer_id);
    config.count = tuning.count;
    config.block = tuning.block;
    config.min_idle_time = tuning.min_idle;
    config.max_retry = tuning.max_retry;
    config.cache_limit = tuning.cache_limit;
    config.cache_timeout = tuning.cache_timeout;
    config.status_timeout = tuning.status_timeout;
    config
}

pub struct PrepareWorker<B: Broker> {
    broker: Arc<B>,
    config_client: PayoutConfigClient<B>,
    payment: Arc<PaymentClient>,
    uploader: ReportUploader<B>,
    lock: PayoutLock<B>,
    notifier: Notifier<B>,
    tuning: ConsumerTuning,
}

impl<B: Broker> PrepareWorker<B> {
    pub fn new(
        broker: Arc<B>,
        config_stream: impl Into<String>,
        payment_base_url: impl Into<String>,
        s3_client: S3Client,
        report_bucket: impl Into<String>,
        notify_topic: impl Into<String>,
        notify_enabled: bool,
        tuning: ConsumerTuning,
    ) -> Self {
        let txns = Arc::new(TransactionStore::new(broker.clone()));
        Self {
            config_client: PayoutConfigClient::new(broker.clone(), config_stream),
            payment: Arc::new(PaymentClient::new(payment_base_url)),
            uploader: ReportUploader::new(s3_client, report_bucket, "application/json", 200, txns),
            lock: PayoutLock::new(broker.clone()),
            notifier: Notifier::new(broker.clone(), notify_topic, notify_enabled),
            broker,
            tuning,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let cfg = match self.config_client.read_payout_config().await {
                Ok(Some(cfg)) => cfg,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "prepare worker: failed to read payout config");
                    continue;
                }
            };
            info!(payout_id = %cfg.payout_id, "prepare worker: starting payout");

            if let Err(e) = self.drain(&cfg, cancel.clone()).await {
                error!(payout_id = %cfg.payout_id, error = %e, "prepare worker: consumer failed, retrying payout next iteration");
                continue;
            }

            if let Err(e) = self.config_client.set_last_processed_payout(&cfg).await {
                error!(payout_id = %cfg.payout_id, error = %e, "prepare worker: failed to advance bookmark");
                continue;
            }

            self.finalize(&cfg).await;
        }
    }

    async fn drain(&self, cfg: &PayoutConfig, cancel: CancellationToken) -> Result<(), BrokerError> {
        let consumer_id = format!("prepare-{}", Uuid::new_v4());
        let txns = Arc::new(TransactionStore::new(self.broker.clone()));
        let handler = Arc::new(PrepareHandler::new(self.payment.clone(), txns));
        let dlq = Arc::new(DlqHandler::new(self.broker.clone(), cfg.stream.clone(), cfg.consumer_group.clone(), consumer_id.clone()));
        let retry_store = Arc::new(RetryAfterStore::new(self.broker.clone()));
        let consumer_config = build_consumer_config(&self.tuning, &cfg.stream, &cfg.consumer_group, &consumer_id);

        let consumer = Consumer::new(self.broker.clone(), handler, dlq, retry_store, consumer_config)
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let handle = Arc::new(consumer).start(cancel).await?;
        handle.await_completion().await;
        Ok(())
    }

    async fn finalize(&self, cfg: &PayoutConfig) {
        let worker_instance = Uuid::new_v4();
        let guard = match self.lock.try_acquire(&cfg.payout_id, LOCK_TTL).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(payout_id = %cfg.payout_id, "another worker holds the payout lock, skipping upload");
                return;
            }
            Err(e) => {
                error!(payout_id = %cfg.payout_id, error = %e, "prepare worker: lock acquire failed");
                return;
            }
        };

        match self.uploader.upload(&cfg.payout_id, cfg.count).await {
            Ok(result) => {
                info!(payout_id = %cfg.payout_id, location = %result.location, worker_instance = %worker_instance, "uploaded settlement report");
                let notice = CompletionNotice {
                    payout_id: cfg.payout_id.clone(),
                    report_uri: result.location,
                    version_id: result.version_id.unwrap_or_default(),
                };
                if let Err(e) = self.notifier.notify(&notice).await {
                    error!(payout_id = %cfg.payout_id, error = %e, "completion notification failed");
                }
            }
            Err(e) => error!(payout_id = %cfg.payout_id, error = %e, "settlement report upload failed"),
        }

        match self.lock.release(guard).await {
            Ok(()) => {}
            Err(BrokerError::LockValueMismatch) => {
                warn!(payout_id = %cfg.payout_id, "lock expired and was taken over during upload");
            }
            Err(e) => error!(payout_id = %cfg.payout_id, error = %e, "lock release failed"),
        }
    }
}

pub struct SubmitWorker<B: Broker> {
    broker: Arc<B>,
    config_client: PayoutConfigClient<B>,
    payment: Arc<PaymentClient>,
    tuning: ConsumerTuning,
}

impl<B: Broker> SubmitWorker<B> {
    pub fn new(broker: Arc<B>, config_stream: impl Into<String>, payment_base_url: impl Into<String>, tuning: ConsumerTuning) -> Self {
        Self {
            config_client: PayoutConfigClient::new(broker.clone(), config_stream),
            payment: Arc::new(PaymentClient::new(payment_base_url)),
            broker,
            tuning,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let cfg = match self.config_client.read_payout_config().await {
                Ok(Some(cfg)) => cfg,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "submit worker: failed to read payout config");
                    continue;
                }
            };
            info!(payout_id = %cfg.payout_id, "submit worker: starting payout");

            if let Err(e) = self.drain(&cfg, cancel.clone()).await {
                error!(payout_id = %cfg.payout_id, error = %e, "submit worker: consumer failed, retrying payout next iteration");
                continue;
            }

            if let Err(e) = self.config_client.set_last_processed_payout(&cfg).await {
                error!(payout_id = %cfg.payout_id, error = %e, "submit worker: failed to advance bookmark");
            }
            // No worker-specific finalize step for Submit.
        }
    }

    async fn drain(&self, cfg: &PayoutConfig, cancel: CancellationToken) -> Result<(), BrokerError> {
        let consumer_id = format!("submit-{}", Uuid::new_v4());
        let handler = Arc::new(SubmitHandler::new(self.payment.clone()));
        let dlq = Arc::new(DlqHandler::new(self.broker.clone(), cfg.stream.clone(), cfg.consumer_group.clone(), consumer_id.clone()));
        let retry_store = Arc::new(RetryAfterStore::new(self.broker.clone()));
        let consumer_config = build_consumer_config(&self.tuning, &cfg.stream, &cfg.consumer_group, &consumer_id);

        let consumer = Consumer::new(self.broker.clone(), handler, dlq, retry_store, consumer_config)
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let handle = Arc::new(consumer).start(cancel).await?;
        handle.await_completion().await;
        Ok(())
    }
}
