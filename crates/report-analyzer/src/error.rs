// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors surfaced by a [`crate::storage::BucketManager`] or one of its buckets.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("invalid bucket id {0:?}")]
    InvalidId(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors raised while encoding or decoding a persisted report document.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("report of kind {found} cannot be loaded into a {expected} analyzer")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Configuration validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
