// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem-backed buckets.
//!
//! Layout: `<root>/<yyyyMMddHH>/<partition>/<namespace>/<id>`, where the
//! partition and the ids are hex encoded so that domains and message ids
//! never escape their directory. Writes go to a temporary file first and are
//! renamed into place.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Bucket, BucketManager, Namespace};
use crate::error::StorageError;

const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FsBucketManager {
    root: PathBuf,
}

impl FsBucketManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(
        &self,
        window_start: DateTime<Utc>,
        partition: &str,
        namespace: Namespace,
    ) -> PathBuf {
        self.root
            .join(window_start.format("%Y%m%d%H").to_string())
            .join(hex::encode(partition))
            .join(namespace.as_str())
    }
}

#[derive(Debug)]
struct FsBucket {
    dir: PathBuf,
}

impl FsBucket {
    fn path_of(&self, id: &str) -> Result<PathBuf, StorageError> {
        if id.is_empty() {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(hex::encode(id)))
    }
}

#[async_trait]
impl Bucket for FsBucket {
    async fn ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(TMP_SUFFIX) {
                continue;
            }
            match hex::decode(file_name).map(String::from_utf8) {
                Ok(Ok(id)) => ids.push(id),
                _ => warn!(
                    "Ignoring unexpected file {} in {}",
                    file_name,
                    self.dir.display()
                ),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_of(id)?).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_by_id(&self, id: &str, payload: &[u8]) -> Result<(), StorageError> {
        let path = self.path_of(id)?;
        // Unique per write: one abandoned by a timeout may still be running.
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(
            ".{}.{}{TMP_SUFFIX}",
            std::process::id(),
            TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl BucketManager for FsBucketManager {
    async fn open(
        &self,
        window_start: DateTime<Utc>,
        partition: &str,
        namespace: Namespace,
    ) -> Result<Arc<dyn Bucket>, StorageError> {
        let dir = self.bucket_dir(window_start, partition, namespace);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Arc::new(FsBucket { dir }))
    }

    async fn close(&self, bucket: Arc<dyn Bucket>) -> Result<(), StorageError> {
        debug!("Closing bucket {bucket:?}");
        Ok(())
    }
}
