//! Records host orchestration events into the event log.
//!
//! The host runtime reports task and tool lifecycle events; each one is
//! turned into an [`EventRecord`](crate::events::EventRecord) payload and
//! appended under the recorder's conversation. A completed planning task
//! switches the recorder from the `planning` to the `action` crew phase.

use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::events::{EventLog, EventType, NewEvent, StorageResult};

const UNKNOWN: &str = "Unknown";
const DEFAULT_PROFILE: &str = "/images/chat-icon.png";

static JSON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\{[\s\S]*\}|\[[\s\S]*\])").expect("valid JSON block regex"));
static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json)?\s*|\s*```$").expect("valid code fence regex"));

/// Agent attributes reported with a started task.
#[derive(Debug, Clone, Default)]
pub struct AgentInfo {
    pub role: Option<String>,
    pub goal: Option<String>,
    pub profile: Option<String>,
    pub name: Option<String>,
}

/// Lifecycle event reported by the host runtime.
#[derive(Debug, Clone)]
pub enum HostEvent {
    TaskStarted { job_id: Option<String>, agent: AgentInfo, description: Option<String> },
    TaskCompleted { job_id: Option<String>, output: Option<Value> },
    ToolUsageStarted { job_id: Option<String>, tool_name: Option<String>, tool_args: Option<Value> },
    ToolUsageFinished { job_id: Option<String>, tool_name: Option<String>, tool_args: Option<Value> },
}

impl HostEvent {
    fn event_type(&self) -> EventType {
        match self {
            Self::TaskStarted { .. } => EventType::TaskStarted,
            Self::TaskCompleted { .. } => EventType::TaskCompleted,
            Self::ToolUsageStarted { .. } => EventType::ToolUsageStarted,
            Self::ToolUsageFinished { .. } => EventType::ToolUsageFinished,
        }
    }

    fn job_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { job_id, .. }
            | Self::TaskCompleted { job_id, .. }
            | Self::ToolUsageStarted { job_id, .. }
            | Self::ToolUsageFinished { job_id, .. } => job_id.as_deref(),
        }
    }
}

/// Appends host events to the log.
pub struct EventRecorder {
    log: Arc<dyn EventLog>,
    conversation_id: Option<String>,
    process_instance_id: Option<String>,
    crew_type: Mutex<Option<String>>,
}

impl EventRecorder {
    pub fn new(
        log: Arc<dyn EventLog>,
        conversation_id: Option<String>,
        process_instance_id: Option<String>,
        crew_type: Option<String>,
    ) -> Self {
        Self { log, conversation_id, process_instance_id, crew_type: Mutex::new(crew_type) }
    }

    /// Current crew phase.
    pub fn crew_type(&self) -> Option<String> {
        self.crew_type.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Records one event and returns the stored id. Append failures
    /// propagate.
    pub fn on_event(&self, event: HostEvent) -> StorageResult<String> {
        let event_type = event.event_type();
        let job_id = event.job_id().unwrap_or_else(|| {
            warn!(event_type = %event_type, "Event carries no job id");
            "unknown"
        });
        let job_id = job_id.to_string();
        // Payload first: a planning result changes the phase it is stored under.
        let data = self.payload(event);
        let crew_type = self.crew_type();

        let id = self.log.append(
            NewEvent::new(event_type.clone(), job_id.clone())
                .conversation(self.conversation_id.clone())
                .process_instance(self.process_instance_id.clone())
                .crew_type(crew_type.clone())
                .data(data),
        )?;
        info!(event_id = %id, job_id = %job_id, event_type = %event_type, crew_type = ?crew_type, "Event recorded");
        Ok(id)
    }

    fn payload(&self, event: HostEvent) -> Value {
        match event {
            HostEvent::TaskStarted { agent, description, .. } => json!({
                "role": agent.role.unwrap_or_else(|| UNKNOWN.to_string()),
                "goal": agent.goal.unwrap_or_else(|| UNKNOWN.to_string()),
                "agent_profile": agent.profile.unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
                "name": agent.name.unwrap_or_else(|| UNKNOWN.to_string()),
                "task_description": description,
            }),
            HostEvent::TaskCompleted { output, .. } => {
                let parsed = output.map_or(Value::Null, safe_json);
                if let Some(plans) = parsed.get("list_of_plans_per_task") {
                    let markdown = plans_markdown(plans);
                    *self.crew_type.lock().unwrap_or_else(PoisonError::into_inner) = Some("action".to_string());
                    info!("Planning finished, switching crew type to action");
                    return json!({ "plans": markdown });
                }
                json!({ "result": parsed })
            }
            HostEvent::ToolUsageStarted { tool_name, tool_args, .. }
            | HostEvent::ToolUsageFinished { tool_name, tool_args, .. } => {
                let args = tool_args.map_or(Value::Null, safe_json);
                let query = args.get("query").cloned().unwrap_or(Value::Null);
                json!({ "tool_name": tool_name, "query": query, "args": args })
            }
        }
    }
}

/// Best-effort JSON decoding of model output.
///
/// Non-strings pass through. Strings are parsed as-is, then again after
/// stripping code fences and cutting out the first `{...}`/`[...]` block.
/// A result that is itself a JSON string is decoded one more level. Text
/// that never parses is returned unchanged.
pub fn safe_json(value: Value) -> Value {
    let Value::String(text) = value else {
        return value;
    };
    if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
        return decode_nested(parsed);
    }
    let cleaned = extract_first_json_block(&strip_code_fence(&text));
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(parsed) => decode_nested(parsed),
        Err(_) => {
            debug!(snippet = %text.chars().take(120).collect::<String>(), "Output is not JSON, keeping text");
            Value::String(text)
        }
    }
}

fn looks_like_json(text: &str) -> bool {
    let t = text.trim();
    t.starts_with('{') || t.starts_with('[')
}

fn decode_nested(value: Value) -> Value {
    if let Value::String(inner) = &value {
        if looks_like_json(inner) {
            if let Ok(parsed) = serde_json::from_str(inner.trim()) {
                return parsed;
            }
        }
    }
    value
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        CODE_FENCE.replace_all(trimmed, "").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn extract_first_json_block(text: &str) -> String {
    if looks_like_json(text) {
        return text.trim().to_string();
    }
    JSON_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or_else(|| text.to_string(), |m| m.as_str().trim().to_string())
}

/// Condenses `[{task, plan}]` into numbered Markdown sections.
fn plans_markdown(plans: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();
    for (i, item) in plans.as_array().into_iter().flatten().enumerate() {
        let task = match item.get("task") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        lines.push(format!("## {}. {}", i + 1, task));
        lines.push(String::new());
        match item.get("plan") {
            Some(Value::Array(steps)) => lines.extend(steps.iter().map(|s| match s {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            Some(Value::String(plan)) => lines.extend(plan.lines().map(str::to_string)),
            Some(other) => lines.push(other.to_string()),
            None => {}
        }
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SqliteEventLog;

    fn recorder(crew_type: &str) -> (Arc<SqliteEventLog>, EventRecorder) {
        let log = Arc::new(SqliteEventLog::open_in_memory().unwrap());
        let recorder = EventRecorder::new(
            log.clone(),
            Some("todo-9".to_string()),
            Some("proc-9".to_string()),
            Some(crew_type.to_string()),
        );
        (log, recorder)
    }

    #[test]
    fn test_safe_json_variants() {
        assert_eq!(safe_json(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(safe_json(json!("{\"a\": 1}")), json!({"a": 1}));
        assert_eq!(safe_json(json!("```json\n{\"a\": [1, 2]}\n```")), json!({"a": [1, 2]}));
        assert_eq!(safe_json(json!("Final answer: {\"ok\": true} done")), json!({"ok": true}));
        assert_eq!(safe_json(json!("\"[1, 2]\"")), json!([1, 2]));
        assert_eq!(safe_json(json!("plain words")), json!("plain words"));
    }

    #[test]
    fn test_task_started_defaults() {
        let (log, recorder) = recorder("planning");
        recorder
            .on_event(HostEvent::TaskStarted {
                job_id: Some("task-1".to_string()),
                agent: AgentInfo { role: Some("Planner".to_string()), ..AgentInfo::default() },
                description: Some("Plan the release".to_string()),
            })
            .unwrap();

        let record = log.find_latest(&EventType::TaskStarted, "task-1").unwrap().unwrap();
        assert_eq!(
            record.data,
            json!({
                "role": "Planner",
                "goal": "Unknown",
                "agent_profile": "/images/chat-icon.png",
                "name": "Unknown",
                "task_description": "Plan the release"
            })
        );
        assert_eq!(record.crew_type.as_deref(), Some("planning"));
        assert_eq!(record.conversation_id.as_deref(), Some("todo-9"));
    }

    #[test]
    fn test_plans_switch_crew_type() {
        let (log, recorder) = recorder("planning");
        let output = json!({"list_of_plans_per_task": [
            {"task": "Collect data", "plan": ["1. query db", "2. export"]},
            {"task": "Report", "plan": "write summary\nsend mail"}
        ]});
        recorder
            .on_event(HostEvent::TaskCompleted { job_id: Some("task-1".to_string()), output: Some(json!(output.to_string())) })
            .unwrap();

        let record = log.find_latest(&EventType::TaskCompleted, "task-1").unwrap().unwrap();
        assert_eq!(
            record.data["plans"],
            "## 1. Collect data\n\n1. query db\n2. export\n\n## 2. Report\n\nwrite summary\nsend mail"
        );
        assert_eq!(record.crew_type.as_deref(), Some("action"));
        assert_eq!(recorder.crew_type().as_deref(), Some("action"));
    }

    #[test]
    fn test_tool_usage_and_missing_job_id() {
        let (log, recorder) = recorder("action");
        recorder
            .on_event(HostEvent::ToolUsageStarted {
                job_id: None,
                tool_name: Some("mem0".to_string()),
                tool_args: Some(json!("{\"query\": \"deploy rules\"}")),
            })
            .unwrap();
        let record = log.find_latest(&EventType::ToolUsageStarted, "unknown").unwrap().unwrap();
        assert_eq!(record.data, json!({"tool_name": "mem0", "query": "deploy rules", "args": {"query": "deploy rules"}}));
    }

    #[test]
    fn test_plain_result_kept_as_text() {
        let (log, recorder) = recorder("action");
        recorder
            .on_event(HostEvent::TaskCompleted { job_id: Some("t".to_string()), output: Some(json!("All done.")) })
            .unwrap();
        let record = log.find_latest(&EventType::TaskCompleted, "t").unwrap().unwrap();
        assert_eq!(record.data, json!({"result": "All done."}));
    }
}
