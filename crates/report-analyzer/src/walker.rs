// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Depth-first traversal of a message tree.
//!
//! Every node is visited in pre-order: a transaction is folded into the
//! report before any of its children, so among siblings the one that comes
//! first in the tree is the one that claims a still-unset reference.
//! Transaction reports count every transaction at every depth, whatever its
//! ancestors are; event reports count every event, whether it is the root of
//! the tree or nested under transactions.

use tracing::debug;

use crate::message::{Event, Message, Transaction};
use crate::report::{Occurrence, Report, ReportKind};

/// Subtrees nested deeper than this are not aggregated.
pub const MAX_DEPTH: usize = 512;

/// Walks `message` and every message below it.
///
/// `reference` is the lookup path of the whole tree and becomes the
/// representative reference of every slot claimed on the way. Returns the
/// number of slots claimed in the subtree.
pub fn walk(report: &Report, reference: &str, message: &Message) -> u32 {
    walk_at(report, reference, message, 0)
}

fn walk_at(report: &Report, reference: &str, message: &Message, depth: usize) -> u32 {
    if depth >= MAX_DEPTH {
        debug!(
            domain = report.domain(),
            depth, "Message tree too deep, skipping subtree"
        );
        return 0;
    }

    match message {
        Message::Transaction(transaction) => {
            let mut claimed = match report.kind() {
                ReportKind::Transaction => {
                    report.record(&transaction_occurrence(transaction, reference))
                }
                ReportKind::Event => 0,
            };
            for child in &transaction.children {
                claimed += walk_at(report, reference, child, depth + 1);
            }
            claimed
        }
        Message::Event(event) => match report.kind() {
            ReportKind::Event => report.record(&event_occurrence(event, reference)),
            ReportKind::Transaction => 0,
        },
        Message::Heartbeat(_) | Message::Unknown => 0,
    }
}

fn transaction_occurrence<'a>(t: &'a Transaction, reference: &'a str) -> Occurrence<'a> {
    Occurrence {
        r#type: &t.r#type,
        name: &t.name,
        latency: Some(t.duration_ms),
        success: t.is_success(),
        timestamp: t.timestamp,
        reference,
    }
}

fn event_occurrence<'a>(e: &'a Event, reference: &'a str) -> Occurrence<'a> {
    Occurrence {
        r#type: &e.r#type,
        name: &e.name,
        latency: None,
        success: e.is_success(),
        timestamp: e.timestamp,
        reference,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::{Event, Transaction};
    use chrono::{TimeZone, Utc};

    const T0: i64 = 1_792_332_000_000;

    fn report(kind: ReportKind) -> Report {
        let start = Utc.timestamp_millis_opt(T0).unwrap();
        Report::new(kind, "order-service", start, start)
    }

    fn nested_tree() -> Message {
        Transaction::new("URL", "/checkout", T0, 120)
            .with_child(
                Transaction::new("SQL", "select", T0 + 1, 30)
                    .with_child(Event::new("Cache", "miss", T0 + 2).with_status("stale")),
            )
            .with_child(Event::new("Cache", "hit", T0 + 3))
            .with_child(Transaction::new("URL", "/checkout", T0 + 50, 10))
            .into()
    }

    #[test]
    fn test_every_transaction_counts_itself() {
        let report = report(ReportKind::Transaction);
        let claimed = walk(&report, "ref", &nested_tree());

        let doc = report.to_document();
        assert_eq!(doc.types["URL"].stats.total_count, 2);
        assert_eq!(doc.types["URL"].names["/checkout"].stats.total_count, 2);
        assert_eq!(doc.types["SQL"].stats.total_count, 1);
        assert!(!doc.types.contains_key("Cache"));
        // URL and SQL each claim a type and a name success slot once.
        assert_eq!(claimed, 4);
    }

    #[test]
    fn test_events_are_counted_at_any_depth() {
        let report = report(ReportKind::Event);
        let claimed = walk(&report, "ref", &nested_tree());

        let doc = report.to_document();
        let cache = &doc.types["Cache"];
        assert_eq!(cache.stats.total_count, 2);
        assert_eq!(cache.stats.fail_count, 1);
        assert_eq!(cache.names["miss"].stats.fail_count, 1);
        assert_eq!(cache.names["hit"].stats.total_count, 1);
        assert!(!doc.types.contains_key("URL"));
        // Cache fail (type + name), Cache success (type), hit success (name).
        assert_eq!(claimed, 4);
    }

    #[test]
    fn test_bare_event_root() {
        let event: Message = Event::new("Login", "ok", T0).into();

        let events = report(ReportKind::Event);
        assert_eq!(walk(&events, "ref", &event), 2);
        assert_eq!(events.to_document().types["Login"].stats.total_count, 1);

        let transactions = report(ReportKind::Transaction);
        assert_eq!(walk(&transactions, "ref", &event), 0);
        assert!(transactions.is_empty());
    }

    #[test]
    fn test_unknown_and_heartbeat_are_skipped() {
        let tree: Message = Transaction::new("URL", "/", T0, 1)
            .with_child(Message::Unknown)
            .with_child(Message::Heartbeat(Event::new("Heartbeat", "host", T0)))
            .into();

        let transactions = report(ReportKind::Transaction);
        walk(&transactions, "ref", &tree);
        assert_eq!(transactions.to_document().types.len(), 1);

        let events = report(ReportKind::Event);
        assert_eq!(walk(&events, "ref", &tree), 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_sibling_order_decides_the_reference() {
        let report = report(ReportKind::Transaction);
        let first = Transaction::new("URL", "/a", T0 + 100, 1);
        let second = Transaction::new("URL", "/b", T0, 1);
        let tree: Message = Transaction::new("Root", "root", T0, 5)
            .with_child(first)
            .with_child(second)
            .into();

        walk(&report, "tree-1", &tree);
        walk(&report, "tree-2", &Transaction::new("URL", "/a", T0, 1).into());

        let doc = report.to_document();
        assert_eq!(
            doc.types["URL"].stats.success_message_url.as_deref(),
            Some("tree-1")
        );
        assert_eq!(doc.types["URL"].stats.total_count, 3);
    }

    #[test]
    fn test_depth_limit() {
        let mut message: Message = Transaction::new("Deep", "leaf", T0, 1).into();
        for _ in 0..MAX_DEPTH + 10 {
            message = Transaction::new("Deep", "node", T0, 1)
                .with_child(message)
                .into();
        }

        let report = report(ReportKind::Transaction);
        walk(&report, "ref", &message);
        assert_eq!(
            report.to_document().types["Deep"].stats.total_count,
            MAX_DEPTH as u64
        );
    }
}
