// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed aggregation of distributed-trace message trees.
//!
//! Each [`analyzer::Analyzer`] owns one report per domain for a fixed time
//! window. Transactions contribute counts, failures, latency moments and
//! per-minute ranges; events contribute counts and failures only. Reports are
//! checkpointed to a [`storage::BucketManager`] while the window is live and
//! reloaded when a window is reopened after a restart.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod analyzer;
pub mod config;
pub mod error;
pub mod message;
pub mod report;
pub mod statistics;
pub mod storage;
pub mod walker;

pub use analyzer::Analyzer;
pub use config::AnalyzerConfig;
pub use report::ReportKind;
