// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routing of message trees to the window their root belongs to.
//!
//! A period pairs one window with a transaction and an event analyzer. The
//! manager opens periods on demand, checkpoints them on the driver's cadence
//! and retires them (finalize, store, drop) once they time out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use report_analyzer::error::ConfigError;
use report_analyzer::message::MessageTree;
use report_analyzer::storage::BucketManager;
use report_analyzer::{Analyzer, AnalyzerConfig, ReportKind};
use tracing::{debug, info};

const KINDS: [ReportKind; 2] = [ReportKind::Transaction, ReportKind::Event];

pub struct Period {
    analyzers: Vec<Analyzer>,
}

impl Period {
    async fn open(
        start: DateTime<Utc>,
        window: TimeDelta,
        grace: TimeDelta,
        buckets: &Arc<dyn BucketManager>,
        storage_timeout: Duration,
    ) -> Self {
        let mut analyzers = Vec::with_capacity(KINDS.len());
        for kind in KINDS {
            let mut analyzer = Analyzer::new(kind, Arc::clone(buckets), storage_timeout);
            analyzer.set_window(start, window, grace).await;
            analyzers.push(analyzer);
        }
        Self { analyzers }
    }

    #[cfg(test)]
    pub fn analyzer(&self, kind: ReportKind) -> Option<&Analyzer> {
        self.analyzers.iter().find(|a| a.kind() == kind)
    }

    async fn process(&self, tree: &MessageTree) {
        for analyzer in &self.analyzers {
            analyzer.process(tree).await;
        }
    }

    async fn checkpoint(&self) {
        for analyzer in &self.analyzers {
            analyzer.checkpoint().await;
        }
    }

    fn is_timeout_at(&self, now: DateTime<Utc>) -> bool {
        self.analyzers.iter().all(|a| a.is_timeout_at(now))
    }

    async fn finish(self) {
        for analyzer in &self.analyzers {
            let reports = analyzer.finalize();
            analyzer.store(&reports).await;
        }
    }
}

pub struct PeriodManager {
    window: TimeDelta,
    grace: TimeDelta,
    storage_timeout: Duration,
    buckets: Arc<dyn BucketManager>,
    periods: BTreeMap<DateTime<Utc>, Period>,
}

impl PeriodManager {
    pub fn new(
        config: &AnalyzerConfig,
        buckets: Arc<dyn BucketManager>,
    ) -> Result<Self, ConfigError> {
        let window = TimeDelta::from_std(config.window)
            .map_err(|e| ConfigError::Invalid(format!("window out of range: {e}")))?;
        let grace = TimeDelta::from_std(config.grace)
            .map_err(|e| ConfigError::Invalid(format!("grace out of range: {e}")))?;

        Ok(Self {
            window,
            grace,
            storage_timeout: config.storage_timeout,
            buckets,
            periods: BTreeMap::new(),
        })
    }

    /// Start of the window containing `timestamp_ms`, aligned on the epoch.
    pub fn window_start(&self, timestamp_ms: i64) -> Option<DateTime<Utc>> {
        let size = self.window.num_milliseconds();
        if size <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(timestamp_ms - timestamp_ms.rem_euclid(size))
            .single()
    }

    #[cfg(test)]
    pub fn period(&self, start: DateTime<Utc>) -> Option<&Period> {
        self.periods.get(&start)
    }

    #[cfg(test)]
    pub fn starts(&self) -> Vec<DateTime<Utc>> {
        self.periods.keys().copied().collect()
    }

    /// Feeds `tree` to the period of its root timestamp. Returns false when
    /// the tree was dropped: no timestamp, or a window that is already over
    /// or too far ahead of `now` to be opened.
    pub async fn route(&mut self, tree: &MessageTree, now: DateTime<Utc>) -> bool {
        let Some(start) = tree
            .message
            .timestamp()
            .and_then(|ts| self.window_start(ts))
        else {
            debug!(message_id = %tree.message_id, "Dropping tree without a timestamped root");
            return false;
        };

        if !self.periods.contains_key(&start) {
            if start + self.window + self.grace < now {
                debug!(message_id = %tree.message_id, window = %start, "Dropping tree of a closed window");
                return false;
            }
            let current = self.window_start(now.timestamp_millis()).unwrap_or(now);
            if start > current + self.window {
                debug!(message_id = %tree.message_id, window = %start, "Dropping tree from the future");
                return false;
            }

            info!(window = %start, "Opening period");
            let period = Period::open(
                start,
                self.window,
                self.grace,
                &self.buckets,
                self.storage_timeout,
            )
            .await;
            self.periods.insert(start, period);
        }

        match self.periods.get(&start) {
            Some(period) => {
                period.process(tree).await;
                true
            }
            None => false,
        }
    }

    pub async fn checkpoint(&self) {
        for period in self.periods.values() {
            period.checkpoint().await;
        }
    }

    /// Finalizes, stores and drops every period that timed out at `now`.
    pub async fn retire_timed_out(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<DateTime<Utc>> = self
            .periods
            .iter()
            .filter(|(_, period)| period.is_timeout_at(now))
            .map(|(start, _)| *start)
            .collect();

        for start in &expired {
            if let Some(period) = self.periods.remove(start) {
                info!(window = %start, "Retiring period");
                period.finish().await;
            }
        }
        expired.len()
    }

    /// Retires what is over and checkpoints the rest so a restart resumes it.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) {
        self.retire_timed_out(now).await;
        self.checkpoint().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use report_analyzer::message::Transaction;
    use report_analyzer::storage::{MemoryBucketManager, Namespace};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h, 0, 0).unwrap()
    }

    fn tree(id: &str, at: DateTime<Utc>) -> MessageTree {
        MessageTree::new(
            "order-service",
            id,
            Transaction::new("URL", "checkout", at.timestamp_millis(), 25),
        )
    }

    fn manager(buckets: &MemoryBucketManager) -> PeriodManager {
        PeriodManager::new(&AnalyzerConfig::default(), Arc::new(buckets.clone())).unwrap()
    }

    #[test]
    fn test_window_start_alignment() {
        let periods = manager(&MemoryBucketManager::new());
        let at = hour(14) + TimeDelta::minutes(37);
        assert_eq!(periods.window_start(at.timestamp_millis()), Some(hour(14)));
        assert_eq!(periods.window_start(hour(15).timestamp_millis()), Some(hour(15)));
        assert_eq!(
            periods.window_start(-1),
            Some(Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_route_opens_one_period_per_window() {
        let buckets = MemoryBucketManager::new();
        let mut periods = manager(&buckets);
        let now = hour(15) + TimeDelta::minutes(1);

        assert!(periods.route(&tree("a", hour(14) + TimeDelta::minutes(59)), now).await);
        assert!(periods.route(&tree("b", hour(15)), now).await);
        assert!(periods.route(&tree("c", hour(15) + TimeDelta::minutes(2)), now).await);
        assert_eq!(periods.starts(), vec![hour(14), hour(15)]);

        let current = periods.period(hour(15)).unwrap();
        let report = current
            .analyzer(ReportKind::Transaction)
            .unwrap()
            .report("order-service")
            .unwrap();
        assert_eq!(report.types["URL"].stats.total_count, 2);
        // The event analyzer saw the trees too, but they carry no events.
        let events = current.analyzer(ReportKind::Event).unwrap();
        assert!(events.report("order-service").unwrap().types.is_empty());
    }

    #[tokio::test]
    async fn test_route_drops_late_and_future_trees() {
        let buckets = MemoryBucketManager::new();
        let mut periods = manager(&buckets);
        let now = hour(15) + TimeDelta::minutes(10);

        // 14:00 window timed out at 15:03
        assert!(!periods.route(&tree("late", hour(14)), now).await);
        // 16:00 is the next window, 17:00 is too far ahead
        assert!(periods.route(&tree("next", hour(16)), now).await);
        assert!(!periods.route(&tree("future", hour(17)), now).await);
        assert_eq!(periods.starts(), vec![hour(16)]);
    }

    #[tokio::test]
    async fn test_retire_stores_final_reports() {
        let buckets = MemoryBucketManager::new();
        let mut periods = manager(&buckets);

        let now = hour(14) + TimeDelta::minutes(30);
        assert!(periods.route(&tree("a", hour(14)), now).await);
        assert_eq!(periods.retire_timed_out(now).await, 0);

        let after_grace = hour(15) + TimeDelta::minutes(4);
        assert_eq!(periods.retire_timed_out(after_grace).await, 1);
        assert!(periods.starts().is_empty());

        let stored = buckets.entries(hour(14), "transaction", Namespace::Report);
        let report =
            report_analyzer::report::document::ReportDocument::from_json(&stored["order-service"])
                .unwrap();
        assert_eq!(report.domains, vec!["order-service"]);
        assert_eq!(report.types["URL"].stats.latency.unwrap().avg, 25.0);
    }

    #[tokio::test]
    async fn test_shutdown_checkpoints_live_periods() {
        let buckets = MemoryBucketManager::new();
        let mut periods = manager(&buckets);
        let now = hour(14) + TimeDelta::minutes(30);
        assert!(periods.route(&tree("a", hour(14)), now).await);

        periods.shutdown(now).await;
        assert_eq!(periods.starts(), vec![hour(14)]);
        assert!(buckets
            .entries(hour(14), "transaction", Namespace::Report)
            .contains_key("order-service"));
    }
}
