// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::{env, process, sync::Arc, time::Duration};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use metric_relay::{
    Config, LineSource, Pipeline, PipelineError, PipelineStats, ReqwestTransport, Source,
};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    let config = Config::from_env();
    let log_level = match &config {
        Ok(config) => config.runtime.log_level.clone(),
        Err(_) => env::var("RELAY_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
    };
    init_logging(&log_level);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let collector = &config.collector;
    let transport = match ReqwestTransport::new(
        Duration::from_secs(collector.request_timeout_secs),
        collector.https_proxy.as_deref(),
        collector.payload_encoding,
    ) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Unable to create transport: {}", e);
            process::exit(1);
        }
    };

    let pipeline = match Pipeline::from_config(&config, Arc::new(transport)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            signal_token.cancel();
        }
    });

    let input = env::args().nth(1).or_else(|| env::var("RELAY_INPUT").ok());
    let code = match input {
        Some(path) => match LineSource::open(&path).await {
            Ok(source) => {
                info!("Reading messages from {}", path);
                relay(pipeline, source, cancel).await
            }
            Err(e) => {
                error!("Unable to open {}: {}", path, e);
                1
            }
        },
        None => {
            info!("Reading messages from stdin");
            let source = LineSource::new(BufReader::new(tokio::io::stdin()));
            relay(pipeline, source, cancel).await
        }
    };
    process::exit(code);
}

async fn relay<S>(pipeline: Pipeline, source: S, cancel: CancellationToken) -> i32
where
    S: Source + 'static,
{
    exit_code(&pipeline.run(source, cancel).await)
}

fn exit_code(outcome: &Result<PipelineStats, PipelineError>) -> i32 {
    match outcome {
        Ok(stats) => {
            debug!("Relay finished: {:?}", stats);
            0
        }
        Err(e) => {
            error!("Relay failed: {}", e);
            1
        }
    }
}

fn init_logging(log_level: &str) {
    let directive = logger::env_filter_directive(log_level);
    let filter = EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| EnvFilter::new(logger::env_filter_directive(DEFAULT_LOG_LEVEL)));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(false)
        .without_time()
        .event_format(logger::Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Unable to install log subscriber: {e}");
        return;
    }
    debug!("Logging subsystem enabled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_relay::errors::DeliveryError;

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(&Ok(PipelineStats::default())), 0);
        assert_eq!(
            exit_code(&Err(PipelineError::Delivery(
                DeliveryError::RetriesExhausted { attempts: 3 }
            ))),
            1
        );
    }
}
