// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live aggregation tree of one domain's report.
//!
//! A [`Report`] maps type strings to type nodes, and every type node owns the
//! name nodes recorded under it. Writers to the same type serialize on that
//! type's mutex, which guards the type counters together with the counters of
//! all of its names. Range and duration buckets of a name sit behind a second,
//! smaller mutex that is only ever taken after the type mutex was released,
//! so the two locks are never held in opposite orders.

pub mod document;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ReportError;
use document::{
    DurationDocument, LatencyDocument, NameDocument, RangeDocument, ReportDocument,
    StatsDocument, TypeDocument,
};

/// Highest duration bucket key; latencies above it all land here.
const MAX_DURATION_KEY: u64 = 1 << 63;

/// Which occurrences a report aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Spans: counts plus latency moments and the duration histogram.
    Transaction,
    /// Events: counts only.
    Event,
}

impl ReportKind {
    pub fn name(self) -> &'static str {
        match self {
            ReportKind::Transaction => "transaction",
            ReportKind::Event => "event",
        }
    }

    pub fn tracks_latency(self) -> bool {
        matches!(self, ReportKind::Transaction)
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single span or event occurrence about to be folded into a report.
#[derive(Debug, Clone, Copy)]
pub struct Occurrence<'a> {
    pub r#type: &'a str,
    pub name: &'a str,
    /// Milliseconds; `None` for reports that do not track latency.
    pub latency: Option<i64>,
    pub success: bool,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Lookup path of the message tree this occurrence belongs to.
    pub reference: &'a str,
}

/// Minute of the hour of `timestamp_ms`, rounded down to a multiple of 5.
pub fn range_key(timestamp_ms: i64) -> u32 {
    let minute = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).map_or(0, |t| t.minute());
    minute - minute % 5
}

/// Smallest power of two that is not below `latency`.
///
/// Zero and negative latencies land in bucket 1.
pub fn duration_key(latency: i64) -> u64 {
    let latency = u64::try_from(latency).unwrap_or(0);
    let mut key = 1u64;
    while key < latency && key < MAX_DURATION_KEY {
        key <<= 1;
    }
    key
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Moments {
    min: i64,
    max: i64,
    sum: i64,
    sum2: i64,
}

impl Moments {
    const EMPTY: Moments = Moments {
        min: i64::MAX,
        max: i64::MIN,
        sum: 0,
        sum2: 0,
    };

    fn observe(&mut self, latency: i64) {
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
        self.sum = self.sum.saturating_add(latency);
        self.sum2 = self.sum2.saturating_add(latency.saturating_mul(latency));
    }
}

#[derive(Debug, Clone, Default)]
struct Counters {
    total_count: u64,
    fail_count: u64,
    success_message_url: Option<String>,
    fail_message_url: Option<String>,
    latency: Option<Moments>,
}

impl Counters {
    fn new(kind: ReportKind) -> Self {
        Self {
            latency: kind.tracks_latency().then_some(Moments::EMPTY),
            ..Self::default()
        }
    }

    /// Returns the number of reference slots this occurrence claimed (0 or 1).
    fn record(&mut self, occurrence: &Occurrence<'_>) -> u32 {
        self.total_count = self.total_count.saturating_add(1);

        let slot = if occurrence.success {
            &mut self.success_message_url
        } else {
            self.fail_count = self.fail_count.saturating_add(1);
            &mut self.fail_message_url
        };
        let claimed = if slot.is_none() {
            *slot = Some(occurrence.reference.to_string());
            1
        } else {
            0
        };

        if let (Some(moments), Some(latency)) = (self.latency.as_mut(), occurrence.latency) {
            moments.observe(latency);
        }
        claimed
    }

    fn to_document(&self) -> StatsDocument {
        StatsDocument {
            total_count: self.total_count,
            fail_count: self.fail_count,
            success_message_url: self.success_message_url.clone(),
            fail_message_url: self.fail_message_url.clone(),
            latency: self.latency.map(|m| LatencyDocument {
                min: m.min,
                max: m.max,
                sum: m.sum,
                sum2: m.sum2,
                avg: 0.0,
                std: 0.0,
            }),
            fail_percent: 0.0,
        }
    }

    fn from_document(kind: ReportKind, doc: &StatsDocument) -> Self {
        let latency = match doc.latency {
            Some(l) => Some(Moments {
                min: l.min,
                max: l.max,
                sum: l.sum,
                sum2: l.sum2,
            }),
            None => kind.tracks_latency().then_some(Moments::EMPTY),
        };
        Self {
            total_count: doc.total_count,
            fail_count: doc.fail_count,
            success_message_url: doc.success_message_url.clone(),
            fail_message_url: doc.fail_message_url.clone(),
            latency,
        }
    }
}

#[derive(Debug, Default)]
struct Distribution {
    ranges: BTreeMap<u32, RangeDocument>,
    durations: BTreeMap<u64, DurationDocument>,
}

impl Distribution {
    fn record(&mut self, occurrence: &Occurrence<'_>) {
        let range = self.ranges.entry(range_key(occurrence.timestamp)).or_default();
        range.count = range.count.saturating_add(1);
        if !occurrence.success {
            range.fails = range.fails.saturating_add(1);
        }

        if let Some(latency) = occurrence.latency {
            range.sum = range.sum.saturating_add(latency);
            let duration = self.durations.entry(duration_key(latency)).or_default();
            duration.count = duration.count.saturating_add(1);
        }
    }
}

#[derive(Debug)]
struct NameNode {
    counters: Counters,
    distribution: Arc<Mutex<Distribution>>,
}

#[derive(Debug)]
struct TypeState {
    counters: Counters,
    names: BTreeMap<String, NameNode>,
}

#[derive(Debug)]
struct TypeNode {
    state: Mutex<TypeState>,
}

impl TypeNode {
    fn new(kind: ReportKind) -> Self {
        Self {
            state: Mutex::new(TypeState {
                counters: Counters::new(kind),
                names: BTreeMap::new(),
            }),
        }
    }

    /// Updates the type and name counters under the type lock and hands back
    /// the name's distribution so it can be updated once that lock is gone.
    fn record(
        &self,
        kind: ReportKind,
        occurrence: &Occurrence<'_>,
    ) -> (u32, Arc<Mutex<Distribution>>) {
        let mut state = lock(&self.state);
        let TypeState { counters, names } = &mut *state;

        let name = names
            .entry(occurrence.name.to_string())
            .or_insert_with(|| NameNode {
                counters: Counters::new(kind),
                distribution: Arc::new(Mutex::new(Distribution::default())),
            });

        let claimed = counters.record(occurrence) + name.counters.record(occurrence);
        (claimed, Arc::clone(&name.distribution))
    }

    fn to_document(&self) -> TypeDocument {
        let state = lock(&self.state);
        let names = state
            .names
            .iter()
            .map(|(name, node)| {
                let distribution = lock(&node.distribution);
                let doc = NameDocument {
                    stats: node.counters.to_document(),
                    ranges: distribution.ranges.clone(),
                    durations: distribution.durations.clone(),
                };
                (name.clone(), doc)
            })
            .collect();

        TypeDocument {
            stats: state.counters.to_document(),
            names,
        }
    }

    fn from_document(kind: ReportKind, doc: &TypeDocument) -> Self {
        let names = doc
            .names
            .iter()
            .map(|(name, name_doc)| {
                let node = NameNode {
                    counters: Counters::from_document(kind, &name_doc.stats),
                    distribution: Arc::new(Mutex::new(Distribution {
                        ranges: name_doc.ranges.clone(),
                        durations: name_doc.durations.clone(),
                    })),
                };
                (name.clone(), node)
            })
            .collect();

        Self {
            state: Mutex::new(TypeState {
                counters: Counters::from_document(kind, &doc.stats),
                names,
            }),
        }
    }
}

/// The report of one domain for one window.
#[derive(Debug)]
pub struct Report {
    kind: ReportKind,
    domain: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    types: DashMap<String, Arc<TypeNode>>,
}

impl Report {
    pub fn new(
        kind: ReportKind,
        domain: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            domain: domain.into(),
            start_time,
            end_time,
            types: DashMap::new(),
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Folds one occurrence into the type and name it belongs to.
    ///
    /// Returns the number of representative-reference slots the occurrence
    /// claimed, from 0 to 2: one per level whose success (or fail) reference
    /// was still unset.
    pub fn record(&self, occurrence: &Occurrence<'_>) -> u32 {
        let type_node = self.find_or_create_type(occurrence.r#type);
        let (claimed, distribution) = type_node.record(self.kind, occurrence);
        lock(&distribution).record(occurrence);
        claimed
    }

    fn find_or_create_type(&self, r#type: &str) -> Arc<TypeNode> {
        if let Some(node) = self.types.get(r#type) {
            return Arc::clone(node.value());
        }
        let node = self
            .types
            .entry(r#type.to_string())
            .or_insert_with(|| Arc::new(TypeNode::new(self.kind)));
        Arc::clone(node.value())
    }

    /// Snapshot of the current counters. The domain list is left empty.
    ///
    /// Concurrent writers keep going while the snapshot is taken, so types
    /// visited early may miss occurrences that types visited late include.
    pub fn to_document(&self) -> ReportDocument {
        let types = self
            .types
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_document()))
            .collect();

        ReportDocument {
            kind: self.kind,
            domain: self.domain.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            domains: Vec::new(),
            types,
        }
    }

    /// Rebuilds a live report from a persisted document.
    pub fn from_document(kind: ReportKind, doc: &ReportDocument) -> Result<Self, ReportError> {
        if doc.kind != kind {
            return Err(ReportError::KindMismatch {
                expected: kind.name(),
                found: doc.kind.name(),
            });
        }

        let types = doc
            .types
            .iter()
            .map(|(name, type_doc)| {
                (
                    name.clone(),
                    Arc::new(TypeNode::from_document(kind, type_doc)),
                )
            })
            .collect();

        Ok(Self {
            kind,
            domain: doc.domain.clone(),
            start_time: doc.start_time,
            end_time: doc.end_time,
            types,
        })
    }
}
