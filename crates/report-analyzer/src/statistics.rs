// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Report-ready aggregates derived from the persisted counters.

use crate::report::document::{
    LatencyDocument, NameDocument, RangeDocument, ReportDocument, StatsDocument, TypeDocument,
};

/// Fills the derived fields of every node of a report.
///
/// Everything computed here is a pure function of count, sum, sum2, min and
/// max, so running it again on a reloaded document gives the same values.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatisticsComputer;

impl StatisticsComputer {
    pub fn visit_report(&self, report: &mut ReportDocument) {
        for type_doc in report.types.values_mut() {
            self.visit_type(type_doc);
        }
    }

    fn visit_type(&self, type_doc: &mut TypeDocument) {
        compute(&mut type_doc.stats);
        for name_doc in type_doc.names.values_mut() {
            self.visit_name(name_doc);
        }
    }

    fn visit_name(&self, name_doc: &mut NameDocument) {
        compute(&mut name_doc.stats);
        for range in name_doc.ranges.values_mut() {
            compute_range(range);
        }
    }
}

fn compute(stats: &mut StatsDocument) {
    stats.fail_percent = percent(stats.fail_count, stats.total_count);
    if let Some(latency) = stats.latency.as_mut() {
        compute_latency(latency, stats.total_count);
    }
}

fn compute_latency(latency: &mut LatencyDocument, count: u64) {
    latency.avg = mean(count, latency.sum);
    latency.std = std_dev(count, latency.sum, latency.sum2);
}

fn compute_range(range: &mut RangeDocument) {
    range.avg = mean(range.count, range.sum);
}

pub fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

pub fn mean(count: u64, sum: i64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    sum as f64 / count as f64
}

/// Population standard deviation from the sum and sum of squares.
pub fn std_dev(count: u64, sum: i64, sum2: i64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let n = count as f64;
    let avg = sum as f64 / n;
    let variance = sum2 as f64 / n - avg * avg;
    // Rounding can push a zero variance slightly negative.
    variance.max(0.0).sqrt()
}
