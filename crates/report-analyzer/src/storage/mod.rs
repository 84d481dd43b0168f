// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keyed storage the analyzers persist into.
//!
//! Storage is partitioned by window start, by a partition key and by
//! [`Namespace`]. Report documents live in the [`Namespace::Report`] bucket of
//! the report kind's partition (`"transaction"`, `"event"`), one entry per
//! domain. Archived message trees live in the [`Namespace::Logview`] bucket of
//! their domain, one entry per message id.

mod fs;
mod memory;

pub use fs::FsBucketManager;
pub use memory::MemoryBucketManager;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Report,
    Logview,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Report => "report",
            Namespace::Logview => "logview",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open handle on one window/partition/namespace.
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    /// Ids of every entry in the bucket.
    async fn ids(&self) -> Result<Vec<String>, StorageError>;

    /// Payload stored under `id`, or `None` when there is none.
    async fn find_by_id(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `payload` under `id`, replacing any previous payload.
    async fn store_by_id(&self, id: &str, payload: &[u8]) -> Result<(), StorageError>;
}

#[async_trait]
pub trait BucketManager: Send + Sync {
    async fn open(
        &self,
        window_start: DateTime<Utc>,
        partition: &str,
        namespace: Namespace,
    ) -> Result<Arc<dyn Bucket>, StorageError>;

    async fn close(&self, bucket: Arc<dyn Bucket>) -> Result<(), StorageError>;
}

/// Lookup path of an archived message tree: `yyyyMMdd/HH/<domain>/<message id>`.
pub fn logview_path(window_start: DateTime<Utc>, domain: &str, message_id: &str) -> String {
    format!(
        "{}/{domain}/{message_id}",
        window_start.format("%Y%m%d/%H")
    )
}
