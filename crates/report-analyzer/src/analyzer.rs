// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed analyzer.
//!
//! An [`Analyzer`] owns the reports of every domain for one window. Feeders
//! call [`Analyzer::process`] concurrently; an external driver polls
//! [`Analyzer::is_timeout`] and decides when to [`Analyzer::checkpoint`], and
//! when to [`Analyzer::finalize`] and [`Analyzer::store`] at the end of the
//! window. The analyzer has no timer of its own.
//!
//! Storage failures never leave the analyzer: they are logged, scoped to the
//! domain they happened for, and the in-memory counters are kept so the next
//! checkpoint or the final store retries naturally.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::StorageError;
use crate::message::MessageTree;
use crate::report::document::ReportDocument;
use crate::report::{Report, ReportKind};
use crate::statistics::StatisticsComputer;
use crate::storage::{logview_path, Bucket, BucketManager, Namespace};
use crate::walker;

/// Boundaries of the period an analyzer aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: DateTime<Utc>,
    duration: TimeDelta,
    /// Extra time past the end during which messages are still accepted.
    grace: TimeDelta,
}

impl Window {
    fn end(&self) -> DateTime<Utc> {
        self.start + self.duration
    }

    /// Instant after which the window has timed out.
    fn deadline(&self) -> DateTime<Utc> {
        self.end() + self.grace
    }

    /// End time recorded in reports: the last millisecond of the window.
    fn report_end(&self) -> DateTime<Utc> {
        self.end() - TimeDelta::milliseconds(1)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            start: DateTime::<Utc>::default(),
            duration: TimeDelta::zero(),
            grace: TimeDelta::zero(),
        }
    }
}

pub struct Analyzer {
    kind: ReportKind,
    buckets: Arc<dyn BucketManager>,
    storage_timeout: Duration,
    window: Window,
    reports: DashMap<String, Arc<Report>>,
    logviews: DashMap<String, Arc<dyn Bucket>>,
}

impl Analyzer {
    pub fn new(
        kind: ReportKind,
        buckets: Arc<dyn BucketManager>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            buckets,
            storage_timeout,
            window: Window::default(),
            reports: DashMap::new(),
            logviews: DashMap::new(),
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    /// Fixes the window and loads whatever a previous run checkpointed for it.
    ///
    /// A report that is missing or cannot be read is not an error: its
    /// domain simply starts empty.
    pub async fn set_window(&mut self, start: DateTime<Utc>, duration: TimeDelta, grace: TimeDelta) {
        self.close_message_buckets().await;
        self.reports.clear();
        self.window = Window {
            start,
            duration,
            grace,
        };

        self.load_reports()
            .instrument(info_span!("load", kind = %self.kind, window = %start))
            .await;
    }

    /// Folds a message tree into the report of its domain.
    ///
    /// The raw tree is archived once if any of its messages became the
    /// representative of a type or name.
    /// Trees without a domain are dropped: their report could never be
    /// stored under an id.
    pub async fn process(&self, tree: &MessageTree) {
        if tree.domain.is_empty() {
            warn!(message_id = %tree.message_id, "Dropping message tree without a domain");
            return;
        }

        let report = self.find_or_create_report(&tree.domain);
        let reference = logview_path(self.window.start, &tree.domain, &tree.message_id);

        let claimed = walker::walk(&report, &reference, &tree.message);
        if claimed > 0 {
            self.store_message(tree).await;
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.is_timeout_at(Utc::now())
    }

    pub fn is_timeout_at(&self, now: DateTime<Utc>) -> bool {
        now > self.window.deadline()
    }

    /// Persists a snapshot of every live report without ending the window.
    pub async fn checkpoint(&self) {
        let documents: Vec<ReportDocument> = self
            .live_reports()
            .iter()
            .map(|report| report.to_document())
            .collect();

        async {
            let stored = self.store_reports(&documents).await;
            self.close_message_buckets().await;
            debug!("Checkpointed {stored} of {} reports", documents.len());
        }
        .instrument(info_span!("checkpoint", kind = %self.kind, window = %self.window.start))
        .await;
    }

    /// Attaches the domain list to every report and computes its statistics.
    pub fn finalize(&self) -> Vec<ReportDocument> {
        let domains = self.domains();
        let computer = StatisticsComputer;

        let mut documents: Vec<ReportDocument> = self
            .live_reports()
            .iter()
            .map(|report| {
                let mut document = report.to_document();
                document.domains = domains.clone();
                computer.visit_report(&mut document);
                document
            })
            .collect();
        documents.sort_by(|a, b| a.domain.cmp(&b.domain));
        documents
    }

    /// Persists finalized reports and closes the window's archive handles.
    pub async fn store(&self, reports: &[ReportDocument]) {
        if reports.is_empty() {
            return;
        }

        async {
            let stored = self.store_reports(reports).await;
            self.close_message_buckets().await;
            info!("Stored {stored} of {} final reports", reports.len());
        }
        .instrument(info_span!("store", kind = %self.kind, window = %self.window.start))
        .await;
    }

    /// Current state of one domain's report, with the domain list attached.
    pub fn report(&self, domain: &str) -> Option<ReportDocument> {
        let report = self.reports.get(domain).map(|r| Arc::clone(r.value()))?;
        let mut document = report.to_document();
        document.domains = self.domains();
        Some(document)
    }

    /// Every domain seen in this window, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.reports.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    fn live_reports(&self) -> Vec<Arc<Report>> {
        self.reports.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn find_or_create_report(&self, domain: &str) -> Arc<Report> {
        if let Some(report) = self.reports.get(domain) {
            return Arc::clone(report.value());
        }
        let report = self.reports.entry(domain.to_string()).or_insert_with(|| {
            Arc::new(Report::new(
                self.kind,
                domain,
                self.window.start,
                self.window.report_end(),
            ))
        });
        Arc::clone(report.value())
    }

    async fn guarded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.storage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation,
                after: self.storage_timeout,
            }),
        }
    }

    async fn open_reports_bucket(&self) -> Result<Arc<dyn Bucket>, StorageError> {
        self.guarded(
            "open",
            self.buckets
                .open(self.window.start, self.kind.name(), Namespace::Report),
        )
        .await
    }

    async fn close_bucket(&self, bucket: Arc<dyn Bucket>) {
        if let Err(e) = self.guarded("close", self.buckets.close(bucket)).await {
            warn!("Error when closing bucket: {e}");
        }
    }

    async fn load_reports(&self) {
        let bucket = match self.open_reports_bucket().await {
            Ok(bucket) => bucket,
            Err(e) => {
                error!("Error when loading {} reports: {e}", self.kind);
                return;
            }
        };

        match self.guarded("ids", bucket.ids()).await {
            Ok(ids) => {
                for id in ids {
                    self.load_report(bucket.as_ref(), &id).await;
                }
            }
            Err(e) => error!("Error when listing {} reports: {e}", self.kind),
        }
        self.close_bucket(bucket).await;

        if !self.reports.is_empty() {
            info!("Loaded {} checkpointed reports", self.reports.len());
        }
    }

    async fn load_report(&self, bucket: &dyn Bucket, id: &str) {
        let payload = match self.guarded("find_by_id", bucket.find_by_id(id)).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!(domain = id, "Error when reading {} report: {e}", self.kind);
                return;
            }
        };

        match ReportDocument::from_json(&payload)
            .and_then(|document| Report::from_document(self.kind, &document))
        {
            Ok(report) => {
                self.reports
                    .insert(report.domain().to_string(), Arc::new(report));
            }
            Err(e) => warn!(
                domain = id,
                "Ignoring unreadable {} report, starting empty: {e}", self.kind
            ),
        }
    }

    /// Returns how many of `documents` were stored.
    async fn store_reports(&self, documents: &[ReportDocument]) -> usize {
        let bucket = match self.open_reports_bucket().await {
            Ok(bucket) => bucket,
            Err(e) => {
                error!("Error when storing {} reports: {e}", self.kind);
                return 0;
            }
        };

        let mut stored = 0;
        for document in documents {
            let payload = match document.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(domain = %document.domain, "Error when serializing {} report: {e}", self.kind);
                    continue;
                }
            };
            match self
                .guarded("store_by_id", bucket.store_by_id(&document.domain, &payload))
                .await
            {
                Ok(()) => stored += 1,
                Err(e) => {
                    error!(domain = %document.domain, "Error when storing {} report: {e}", self.kind);
                }
            }
        }

        self.close_bucket(bucket).await;
        stored
    }

    async fn store_message(&self, tree: &MessageTree) {
        let payload = match serde_json::to_vec(tree) {
            Ok(payload) => payload,
            Err(e) => {
                error!(message_id = %tree.message_id, "Error when serializing logview: {e}");
                return;
            }
        };

        let result = match self.logview_bucket(&tree.domain).await {
            Ok(bucket) => {
                self.guarded("store_by_id", bucket.store_by_id(&tree.message_id, &payload))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(
                domain = %tree.domain,
                message_id = %tree.message_id,
                "Error when storing logview for {} analyzer: {e}", self.kind
            );
        }
    }

    async fn logview_bucket(&self, domain: &str) -> Result<Arc<dyn Bucket>, StorageError> {
        if let Some(bucket) = self.logviews.get(domain) {
            return Ok(Arc::clone(bucket.value()));
        }

        let opened = self
            .guarded(
                "open",
                self.buckets
                    .open(self.window.start, domain, Namespace::Logview),
            )
            .await?;

        // Another feeder may have opened the same bucket meanwhile.
        let (bucket, redundant) = match self.logviews.entry(domain.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), Some(opened)),
            Entry::Vacant(entry) => (Arc::clone(entry.insert(opened).value()), None),
        };
        if let Some(redundant) = redundant {
            self.close_bucket(redundant).await;
        }
        Ok(bucket)
    }

    /// Closes every archive handle; the next archived tree reopens its bucket.
    async fn close_message_buckets(&self) {
        let domains: Vec<String> = self.logviews.iter().map(|e| e.key().clone()).collect();
        for domain in domains {
            if let Some((_, bucket)) = self.logviews.remove(&domain) {
                self.close_bucket(bucket).await;
            }
        }
    }
}
