//! The "ask a human" channel.
//!
//! A question is written to the shared event log as a `human_asked` record
//! and answered, out of band, by a `human_response` record carrying the
//! same job id. Questions are keyed by an [`AskSignature`] so that repeated
//! or concurrent calls with the same content reuse the outstanding job
//! instead of asking twice.
//!
//! Two workers that both scan before either has appended can still ask the
//! same question twice; the log is the only coordination point.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capability::{
    Capability, CapabilityArguments, CapabilityHandler, CapabilityParameters, PropertySchema,
};
use crate::error::{ConduitError, Result};
use crate::events::{
    EventLog, EventRecord, EventType, NewEvent, Notification, StorageError, StorageResult,
    parse_recipients,
};

/// Answer returned when nobody responded before the deadline. Callers must
/// treat it as a refusal.
pub const NO_RESPONSE_REJECTION: &str = "사용자 미응답 거절";

/// Capability name of the channel.
pub const CAPABILITY_NAME: &str = "human_asked";

/// Notification kind used for pending questions.
const NOTIFICATION_KIND: &str = "workitem_bpm";

#[derive(Debug, Error)]
pub enum HumanQueryError {
    #[error("failed to record question {job_id}: {source}")]
    AskNotRecorded {
        job_id: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to notify recipients of {job_id}: {source}")]
    NotificationFailed {
        job_id: String,
        #[source]
        source: StorageError,
    },

    #[error("polling for {job_id} aborted after {errors} consecutive errors: {source}")]
    PollingAborted {
        job_id: String,
        errors: u32,
        #[source]
        source: StorageError,
    },
}

/// Kind of answer expected from the human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    #[default]
    Text,
    Select,
    Confirm,
}

impl QueryKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "select" => Some(Self::Select),
            "confirm" => Some(Self::Confirm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Select => "select",
            Self::Confirm => "confirm",
        }
    }
}

/// Idempotency key of a question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AskSignature(String);

impl AskSignature {
    /// Hex SHA-256 over the canonical JSON of `{options, role, text, type}`.
    /// Absent options hash the same as an empty list.
    pub fn compute(role: &str, text: &str, kind: QueryKind, options: Option<&[String]>) -> Self {
        let payload = json!({
            "role": role,
            "text": text,
            "type": kind.as_str(),
            "options": options.unwrap_or_default(),
        });
        let digest = Sha256::digest(canonical_json(&payload).as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Renders JSON with sorted keys, `", "` / `": "` separators and unescaped
/// UTF-8, so signatures stay stable across every writer of the log.
pub fn canonical_json(value: &Value) -> String {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    if value.serialize(&mut serializer).is_err() {
        return value.to_string();
    }
    String::from_utf8(out).unwrap_or_else(|_| value.to_string())
}

struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

/// Where the question comes from and who hears about it.
#[derive(Debug, Clone, Default)]
pub struct HumanQueryContext {
    /// Conversation (task) id; the dedup search space and notification link.
    pub conversation_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub tenant_id: Option<String>,
    pub agent_name: Option<String>,
    /// Comma separated notification recipients.
    pub recipients: Option<String>,
    pub crew_type: Option<String>,
}

/// Polling behaviour while waiting for an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            interval: Duration::from_secs(5),
            max_consecutive_errors: 3,
        }
    }
}

/// Asks humans questions through the event log.
pub struct HumanQuery {
    log: Arc<dyn EventLog>,
    context: HumanQueryContext,
    poll: PollSettings,
}

impl HumanQuery {
    pub fn new(log: Arc<dyn EventLog>, context: HumanQueryContext, poll: PollSettings) -> Self {
        Self { log, context, poll }
    }

    /// Asks a question and waits for the answer.
    ///
    /// Returns the stored answer when the same question was already
    /// answered in this conversation, joins the outstanding job when it was
    /// asked but not answered, and otherwise records a new question.
    /// Running out of time yields [`NO_RESPONSE_REJECTION`], not an error.
    pub async fn ask(
        &self,
        role: &str,
        text: &str,
        kind: QueryKind,
        options: Option<Vec<String>>,
    ) -> std::result::Result<String, HumanQueryError> {
        info!(role, kind = kind.as_str(), "Asking human");
        let options = options.unwrap_or_default();
        let signature = AskSignature::compute(role, text, kind, Some(options.as_slice()));

        let history = self.history().await;
        if let Some(job_id) = find_asked(&history, &signature) {
            if let Some(answer) = find_answer(&history, job_id) {
                info!(job_id = %job_id, "Reusing earlier answer");
                return Ok(answer);
            }
            info!(job_id = %job_id, "Question already pending, joining it");
            return self.wait_for_response(job_id).await;
        }

        let job_id = format!("human_asked_{}", Uuid::new_v4());
        let event = NewEvent::new(EventType::HumanAsked, job_id.clone())
            .conversation(self.context.conversation_id.clone())
            .process_instance(self.context.process_instance_id.clone())
            .crew_type(self.context.crew_type.clone())
            .data(json!({
                "role": role,
                "text": text,
                "type": kind.as_str(),
                "options": options,
                "signature": signature.as_str(),
            }));
        if let Err(source) = self.with_log(move |log| log.append(event)).await {
            error!(job_id = %job_id, error = %source, "Failed to record question");
            return Err(HumanQueryError::AskNotRecorded { job_id, source });
        }
        info!(job_id = %job_id, "Question recorded");

        self.notify(&job_id, text).await?;
        self.wait_for_response(&job_id).await
    }

    /// Runs a log operation on the blocking pool; store calls may wait on
    /// disk or a connection lock.
    async fn with_log<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&dyn EventLog) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || op(log.as_ref()))
            .await
            .map_err(|e| StorageError::Unavailable(format!("event log task failed: {}", e)))?
    }

    async fn history(&self) -> Vec<EventRecord> {
        let Some(conversation_id) = self.context.conversation_id.clone() else {
            return Vec::new();
        };
        let lookup = conversation_id.clone();
        self.with_log(move |log| log.find_all(&lookup)).await.unwrap_or_else(|e| {
            warn!(conversation_id = %conversation_id, error = %e, "History lookup failed, asking anew");
            Vec::new()
        })
    }

    async fn notify(&self, job_id: &str, text: &str) -> std::result::Result<(), HumanQueryError> {
        let recipients = self.context.recipients.as_deref().map(parse_recipients).unwrap_or_default();
        if recipients.is_empty() {
            info!(job_id, "No recipients, notification skipped");
            return Ok(());
        }
        let notification = Notification {
            title: text.to_string(),
            kind: NOTIFICATION_KIND.to_string(),
            description: self.context.agent_name.clone(),
            recipients,
            tenant_id: self.context.tenant_id.clone(),
            url: self.context.conversation_id.as_ref().map(|id| format!("/todolist/{}", id)),
            from_id: self.context.agent_name.clone(),
        };
        self.with_log(move |log| log.append_notification(notification)).await.map_err(|source| {
            error!(job_id, error = %source, "Failed to store notification");
            HumanQueryError::NotificationFailed { job_id: job_id.to_string(), source }
        })
    }

    async fn wait_for_response(&self, job_id: &str) -> std::result::Result<String, HumanQueryError> {
        let deadline = Instant::now() + self.poll.timeout;
        let mut errors = 0;

        while Instant::now() < deadline {
            let lookup = job_id.to_string();
            match self.with_log(move |log| log.find_latest(&EventType::HumanResponse, &lookup)).await {
                Ok(Some(record)) => {
                    info!(job_id, "Answer received");
                    return Ok(answer_text(&record));
                }
                Ok(None) => errors = 0,
                Err(source) => {
                    errors += 1;
                    if errors >= self.poll.max_consecutive_errors {
                        error!(job_id, errors, error = %source, "Polling aborted");
                        return Err(HumanQueryError::PollingAborted {
                            job_id: job_id.to_string(),
                            errors,
                            source,
                        });
                    }
                    warn!(job_id, errors, error = %source, "Answer lookup failed");
                }
            }
            tokio::time::sleep(self.poll.interval).await;
        }

        warn!(job_id, timeout = self.poll.timeout.as_secs(), "No answer before deadline");
        Ok(NO_RESPONSE_REJECTION.to_string())
    }

    /// Wraps the channel as the `human_asked` capability.
    pub fn into_capability(self) -> Capability {
        let schema = CapabilityParameters::new()
            .add_property("role", "string", "Who the question is for (e.g. user, manager)", true)
            .add_property("text", "string", "The question", true)
            .add_schema(
                "type",
                PropertySchema::new("string", "Kind of answer expected")
                    .one_of(&["text", "select", "confirm"]),
                false,
            )
            .add_schema(
                "options",
                PropertySchema::new("array", "Choices when type is select")
                    .items(PropertySchema::new("string", "Choice")),
                false,
            );
        Capability::new(
            CAPABILITY_NAME,
            "Ask a human a question and wait for the answer. Call it once per question; \
             repeating the same question returns the same answer. Use only when the goal \
             itself is unclear or before sensitive or destructive changes. \
             'confirm' answers decide whether to proceed; a timeout returns a refusal and \
             dependent changes must stop.",
            schema.to_schema(),
            Arc::new(HumanQueryHandler { query: self }),
        )
    }
}

/// Job id of the newest `human_asked` record with a matching signature.
fn find_asked<'a>(history: &'a [EventRecord], signature: &AskSignature) -> Option<&'a str> {
    history
        .iter()
        .rev()
        .filter(|r| r.event_type == EventType::HumanAsked)
        .filter(|r| r.data_str("signature") == Some(signature.as_str()))
        .map(|r| r.correlation_id.as_str())
        .find(|job_id| !job_id.is_empty())
}

/// Newest stored answer for a job.
fn find_answer(history: &[EventRecord], job_id: &str) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|r| r.event_type == EventType::HumanResponse && r.correlation_id == job_id)
        .map(answer_text)
}

/// The textual `answer`, or the whole payload as canonical JSON.
fn answer_text(record: &EventRecord) -> String {
    match record.data_str("answer") {
        Some(answer) => answer.to_string(),
        None => canonical_json(&record.data),
    }
}

struct HumanQueryHandler {
    query: HumanQuery,
}

#[async_trait]
impl CapabilityHandler for HumanQueryHandler {
    async fn execute(&self, args: &CapabilityArguments) -> Result<String> {
        let role = args.require_string("role")?;
        let text = args.require_string("text")?;
        let kind = match args.args.get("type") {
            None | Some(Value::Null) => QueryKind::default(),
            Some(value) => value.as_str().and_then(QueryKind::parse).ok_or_else(|| {
                ConduitError::InvalidInput("'type' must be one of text, select, confirm".into())
            })?,
        };
        let options = args.get_string_array("options")?;
        Ok(self.query.ask(&role, &text, kind, options).await?)
    }
}
