// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialized form of a report.
//!
//! Documents mirror the live tree (report → type → name → range/duration)
//! and are what checkpoints and the final store persist. Counters, moments
//! and references are the source of truth; `avg`, `std` and `fail_percent`
//! are filled in by [`crate::statistics::StatisticsComputer`] and are
//! recomputed from the counters whenever a report is finalized.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReportError;
use crate::report::ReportKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub kind: ReportKind,
    pub domain: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeDocument>,
}

impl ReportDocument {
    pub fn to_json(&self) -> Result<Vec<u8>, ReportError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, ReportError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDocument {
    pub stats: StatsDocument,
    #[serde(default)]
    pub names: BTreeMap<String, NameDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameDocument {
    pub stats: StatsDocument,
    /// Keyed by minute of the hour, rounded down to a multiple of 5.
    #[serde(default)]
    pub ranges: BTreeMap<u32, RangeDocument>,
    /// Keyed by the smallest power of two not below the latency.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub durations: BTreeMap<u64, DurationDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDocument {
    pub total_count: u64,
    pub fail_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_message_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_message_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyDocument>,
    #[serde(default)]
    pub fail_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyDocument {
    pub min: i64,
    pub max: i64,
    pub sum: i64,
    pub sum2: i64,
    #[serde(default)]
    pub avg: f64,
    #[serde(default)]
    pub std: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeDocument {
    pub count: u64,
    pub fails: u64,
    #[serde(default)]
    pub sum: i64,
    #[serde(default)]
    pub avg: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationDocument {
    pub count: u64,
}
