mod broker;
mod config;
mod dlq;
mod envelope;
mod error;
mod fan_in;
mod lock;
mod notification;
mod payment_client;
mod payout_config;
mod prepare_handler;
mod retry_after;
mod stream_consumer;
mod submit_handler;
mod txn_store;
mod uploader;
mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::RedisBroker;
use crate::config::AppConfig;
use crate::worker::{PrepareWorker, SubmitWorker};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "payout_streamer=info".into()),
        )
        .init();

    let subcommand = std::env::args().nth(1);

    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[payout-streamer] configuration error: {e}");
            std::process::exit(1);
        }
    };

    match subcommand.as_deref() {
        Some("prepare-worker") => run_prepare_worker(config).await,
        Some("submit-worker") => run_submit_worker(config).await,
        Some(other) => {
            eprintln!("[payout-streamer] unknown subcommand '{other}' (expected 'prepare-worker' or 'submit-worker')");
            std::process::exit(1);
        }
        None => {
            eprintln!("[payout-streamer] usage: payout-streamer <prepare-worker|submit-worker>");
            std::process::exit(1);
        }
    }
}

async fn run_prepare_worker(config: AppConfig) {
    let broker = match RedisBroker::connect(&config.redis_url).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("[payout-streamer] failed to connect to broker: {e}");
            std::process::exit(1);
        }
    };

    let s3_client = build_s3_client(&config).await;
    let cancel = CancellationToken::new();

    let worker = PrepareWorker::new(
        broker,
        config.prepare_config_stream.clone(),
        config.payment_base_url.clone(),
        s3_client,
        config.report_bucket.clone(),
        config.notify_topic.clone(),
        config.notify_enabled,
        config.consumer.clone(),
    );

    info!("starting prepare-worker");
    tokio::select! {
        _ = worker.run(cancel.clone()) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, cancelling prepare-worker");
            cancel.cancel();
        }
    }
    info!("prepare-worker shut down");
}

async fn run_submit_worker(config: AppConfig) {
    let broker = match RedisBroker::connect(&config.redis_url).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("[payout-streamer] failed to connect to broker: {e}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let worker = SubmitWorker::new(
        broker,
        config.submit_config_stream.clone(),
        config.payment_base_url.clone(),
        config.consumer.clone(),
    );

    info!("starting submit-worker");
    tokio::select! {
        _ = worker.run(cancel.clone()) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, cancelling submit-worker");
            cancel.cancel();
        }
    }
    info!("submit-worker shut down");
}

async fn build_s3_client(config: &AppConfig) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.aws_region.clone()))
        .retry_config(aws_config::retry::RetryConfig::standard().with_max_attempts(5));
    if let Some(endpoint) = &config.aws_endpoint_url {
        loader = loader.endpoint_url(endpoint.clone());
    }
    let shared_config = loader.load().await;
    aws_sdk_s3::Client::new(&shared_config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
