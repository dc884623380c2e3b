//! Durable, append-only event log shared by agent workers.
//!
//! Records are keyed by a correlation id (the job) and grouped by a
//! conversation id (the task being worked on). Nothing in this crate ever
//! mutates a record after it has been appended.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod error;
pub mod sqlite;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteEventLog;

/// Kind of a logged event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A question was put to a human.
    HumanAsked,
    /// A human answered a question.
    HumanResponse,
    /// The host runtime started a task.
    TaskStarted,
    /// The host runtime completed a task.
    TaskCompleted,
    /// An agent started using a tool.
    ToolUsageStarted,
    /// An agent finished using a tool.
    ToolUsageFinished,
    /// Any type this crate does not interpret.
    Other(String),
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::HumanAsked => "human_asked",
            Self::HumanResponse => "human_response",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::ToolUsageStarted => "tool_usage_started",
            Self::ToolUsageFinished => "tool_usage_finished",
            Self::Other(name) => name,
        }
    }

    /// Parses a wire name. Unknown names map to [`EventType::Other`].
    pub fn parse(name: &str) -> Self {
        match name {
            "human_asked" => Self::HumanAsked,
            "human_response" => Self::HumanResponse,
            "task_started" => Self::TaskStarted,
            "task_completed" => Self::TaskCompleted,
            "tool_usage_started" => Self::ToolUsageStarted,
            "tool_usage_finished" => Self::ToolUsageFinished,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// A record as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Opaque id assigned by the store.
    pub id: String,
    /// Job the record belongs to.
    pub correlation_id: String,
    /// Conversation (task) the record belongs to.
    pub conversation_id: Option<String>,
    /// Process instance the conversation runs under.
    pub process_instance_id: Option<String>,
    /// Crew phase that produced the record (`planning`, `action`, ...).
    pub crew_type: Option<String>,
    /// Kind of event.
    pub event_type: EventType,
    /// Event payload. Always a JSON object for records written by this crate.
    pub data: Value,
    /// Optional status marker.
    pub status: Option<String>,
    /// When the store accepted the record.
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// String field of the payload, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// A record about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub correlation_id: String,
    pub conversation_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub crew_type: Option<String>,
    pub data: Value,
    pub status: Option<String>,
}

impl NewEvent {
    /// Starts a new event with an empty object payload.
    pub fn new(event_type: EventType, correlation_id: impl Into<String>) -> Self {
        Self {
            event_type,
            correlation_id: correlation_id.into(),
            conversation_id: None,
            process_instance_id: None,
            crew_type: None,
            data: Value::Object(serde_json::Map::new()),
            status: None,
        }
    }

    #[must_use]
    pub fn conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    #[must_use]
    pub fn process_instance(mut self, process_instance_id: Option<String>) -> Self {
        self.process_instance_id = process_instance_id;
        self
    }

    #[must_use]
    pub fn crew_type(mut self, crew_type: Option<String>) -> Self {
        self.crew_type = crew_type;
        self
    }

    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn status(mut self, status: Option<String>) -> Self {
        self.status = status;
        self
    }
}

/// A notification pointing humans at pending work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub kind: String,
    pub description: Option<String>,
    pub recipients: Vec<String>,
    pub tenant_id: Option<String>,
    pub url: Option<String>,
    pub from_id: Option<String>,
}

/// Splits a comma separated recipient list, dropping blanks.
pub fn parse_recipients(csv: &str) -> Vec<String> {
    csv.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Store-agnostic contract of the event log.
///
/// Implementations must return `find_all` results in insertion order.
pub trait EventLog: Send + Sync {
    /// Appends a record and returns its id.
    fn append(&self, event: NewEvent) -> StorageResult<String>;

    /// Most recent record of `event_type` for a job.
    fn find_latest(
        &self,
        event_type: &EventType,
        correlation_id: &str,
    ) -> StorageResult<Option<EventRecord>>;

    /// Every record of a conversation, oldest first.
    fn find_all(&self, conversation_id: &str) -> StorageResult<Vec<EventRecord>>;

    /// Stores a notification for each recipient.
    fn append_notification(&self, notification: Notification) -> StorageResult<()>;
}
