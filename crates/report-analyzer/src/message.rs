// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message trees as delivered by the transport.
//!
//! A [`MessageTree`] carries one root [`Message`] plus the metadata of the
//! process that produced it. Transactions are timed units of work that may
//! nest further messages; events are instantaneous occurrences. Any message
//! kind this crate does not understand deserializes into
//! [`Message::Unknown`] and contributes nothing to the reports.

use serde::{Deserialize, Serialize};

/// Status value producers use for a successful message.
pub const SUCCESS: &str = "0";

fn success_status() -> String {
    SUCCESS.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTree {
    pub domain: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub thread_name: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_message_id: Option<String>,
    pub message: Message,
}

impl MessageTree {
    pub fn new(
        domain: impl Into<String>,
        message_id: impl Into<String>,
        message: impl Into<Message>,
    ) -> Self {
        Self {
            domain: domain.into(),
            hostname: String::new(),
            ip_address: String::new(),
            thread_name: String::new(),
            message_id: message_id.into(),
            parent_message_id: None,
            root_message_id: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Transaction(Transaction),
    Event(Event),
    Heartbeat(Event),
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Epoch milliseconds of the message, when its kind carries one.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Message::Transaction(t) => Some(t.timestamp),
            Message::Event(e) | Message::Heartbeat(e) => Some(e.timestamp),
            Message::Unknown => None,
        }
    }
}

impl From<Transaction> for Message {
    fn from(transaction: Transaction) -> Self {
        Message::Transaction(transaction)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub r#type: String,
    pub name: String,
    #[serde(default = "success_status")]
    pub status: String,
    /// Start of the transaction, epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Message>,
}

impl Transaction {
    pub fn new(
        r#type: impl Into<String>,
        name: impl Into<String>,
        timestamp: i64,
        duration_ms: i64,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            name: name.into(),
            status: success_status(),
            timestamp,
            duration_ms,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: impl Into<Message>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub r#type: String,
    pub name: String,
    #[serde(default = "success_status")]
    pub status: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl Event {
    pub fn new(r#type: impl Into<String>, name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            r#type: r#type.into(),
            name: name.into(),
            status: success_status(),
            timestamp,
            data: String::new(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS
    }
}
