// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;
mod period;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use report_analyzer::message::MessageTree;
use report_analyzer::storage::FsBucketManager;
use report_analyzer::AnalyzerConfig;

use crate::period::PeriodManager;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = AnalyzerConfig::from_env().context("could not load configuration")?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).context("could not parse log level")?,
        )
        .event_format(logger::Formatter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let buckets = Arc::new(FsBucketManager::new(&config.storage_dir));
    let mut periods = PeriodManager::new(&config, buckets)?;
    info!(
        storage_dir = %config.storage_dir.display(),
        window = ?config.window,
        grace = ?config.grace,
        "Starting report consumer"
    );

    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received interrupt, shutting down");
                    cancel_token.cancel();
                }
                Err(e) => error!("Unable to listen for interrupt: {e}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut checkpoint_interval = interval(config.checkpoint_interval);
    checkpoint_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    checkpoint_interval.tick().await; // discard first tick

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => consume_line(&mut periods, &line).await,
                Ok(None) => {
                    info!("Input closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Error reading input: {e}");
                    break;
                }
            },
            _ = checkpoint_interval.tick() => {
                let now = Utc::now();
                let retired = periods.retire_timed_out(now).await;
                if retired > 0 {
                    debug!("Retired {retired} periods");
                }
                periods.checkpoint().await;
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    periods.shutdown(Utc::now()).await;
    info!("Report consumer stopped");
    Ok(())
}

async fn consume_line(periods: &mut PeriodManager, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<MessageTree>(line) {
        Ok(tree) => {
            periods.route(&tree, Utc::now()).await;
        }
        Err(e) => warn!("Ignoring malformed message tree: {e}"),
    }
}
