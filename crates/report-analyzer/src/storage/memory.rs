// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Bucket, BucketManager, Namespace};
use crate::error::StorageError;

type BucketKey = (DateTime<Utc>, String, Namespace);
type Entries = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Default)]
struct Shared {
    buckets: Mutex<HashMap<BucketKey, Entries>>,
    failing_ids: Mutex<HashSet<String>>,
    failing_namespaces: Mutex<HashSet<Namespace>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process storage, used for tests and for embedding the analyzers
/// without a durable backend. Clones share the same data.
#[derive(Debug, Default, Clone)]
pub struct MemoryBucketManager {
    shared: Arc<Shared>,
}

impl MemoryBucketManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `store_by_id(id, ..)` fail, in any bucket.
    pub fn fail_writes_to(&self, id: impl Into<String>) {
        lock(&self.shared.failing_ids).insert(id.into());
    }

    /// Makes every later `open` of `namespace` fail.
    pub fn fail_opens_of(&self, namespace: Namespace) {
        lock(&self.shared.failing_namespaces).insert(namespace);
    }

    /// Seeds a payload without going through a bucket handle.
    pub fn insert(
        &self,
        window_start: DateTime<Utc>,
        partition: &str,
        namespace: Namespace,
        id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) {
        lock(&self.shared.buckets)
            .entry((window_start, partition.to_string(), namespace))
            .or_default()
            .insert(id.into(), payload.into());
    }

    /// Copy of everything stored in one bucket.
    pub fn entries(
        &self,
        window_start: DateTime<Utc>,
        partition: &str,
        namespace: Namespace,
    ) -> Entries {
        lock(&self.shared.buckets)
            .get(&(window_start, partition.to_string(), namespace))
            .cloned()
            .unwrap_or_default()
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct MemoryBucket {
    key: BucketKey,
    shared: Arc<Shared>,
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(lock(&self.shared.buckets)
            .get(&self.key)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(lock(&self.shared.buckets)
            .get(&self.key)
            .and_then(|entries| entries.get(id).cloned()))
    }

    async fn store_by_id(&self, id: &str, payload: &[u8]) -> Result<(), StorageError> {
        if lock(&self.shared.failing_ids).contains(id) {
            return Err(StorageError::Backend(format!("write to {id} rejected")));
        }
        lock(&self.shared.buckets)
            .entry(self.key.clone())
            .or_default()
            .insert(id.to_string(), payload.to_vec());
        Ok(())
    }
}

#[async_trait]
impl BucketManager for MemoryBucketManager {
    async fn open(
        &self,
        window_start: DateTime<Utc>,
        partition: &str,
        namespace: Namespace,
    ) -> Result<Arc<dyn Bucket>, StorageError> {
        if lock(&self.shared.failing_namespaces).contains(&namespace) {
            return Err(StorageError::Backend(format!(
                "{namespace} bucket of {partition} unavailable"
            )));
        }
        self.shared.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryBucket {
            key: (window_start, partition.to_string(), namespace),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self, _bucket: Arc<dyn Bucket>) -> Result<(), StorageError> {
        self.shared.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
