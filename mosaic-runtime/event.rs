//! The closed event-type set, typed payloads, and the Envelope the
//! broker transports between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MosaicError;

/// The closed tag set events are drawn from. Per the redesign guidance
/// this replaces dynamic dispatch by string type with a closed union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionResponse,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    SessionEnd,
    NodeMessage,
    EventBatch,
    SystemMessage,
    EmailMessage,
    SchedulerMessage,
    RedditScraperMessage,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::SessionResponse => "session_response",
            EventType::UserPromptSubmit => "user_prompt_submit",
            EventType::PreToolUse => "pre_tool_use",
            EventType::PostToolUse => "post_tool_use",
            EventType::SessionEnd => "session_end",
            EventType::NodeMessage => "node_message",
            EventType::EventBatch => "event_batch",
            EventType::SystemMessage => "system_message",
            EventType::EmailMessage => "email_message",
            EventType::SchedulerMessage => "scheduler_message",
            EventType::RedditScraperMessage => "reddit_scraper_message",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, MosaicError> {
        Ok(match raw {
            "session_start" => EventType::SessionStart,
            "session_response" => EventType::SessionResponse,
            "user_prompt_submit" => EventType::UserPromptSubmit,
            "pre_tool_use" => EventType::PreToolUse,
            "post_tool_use" => EventType::PostToolUse,
            "session_end" => EventType::SessionEnd,
            "node_message" => EventType::NodeMessage,
            "event_batch" => EventType::EventBatch,
            "system_message" => EventType::SystemMessage,
            "email_message" => EventType::EmailMessage,
            "scheduler_message" => EventType::SchedulerMessage,
            "reddit_scraper_message" => EventType::RedditScraperMessage,
            other => return Err(MosaicError::UnknownEvent(other.to_string())),
        })
    }

    /// Human-readable description, rendered by the system prompt builder.
    pub fn description(&self) -> &'static str {
        match self {
            EventType::SessionStart => "A session on the source node has started.",
            EventType::SessionResponse => "Final agent response for a background turn.",
            EventType::UserPromptSubmit => "A user-facing prompt was submitted for processing.",
            EventType::PreToolUse => "Emitted immediately before a tool invocation.",
            EventType::PostToolUse => "Emitted immediately after a tool invocation completes.",
            EventType::SessionEnd => "A session on the source node has ended.",
            EventType::NodeMessage => "Free-form message passed between nodes.",
            EventType::EventBatch => "A batch of aggregated events.",
            EventType::SystemMessage => "System-originated notice, no schema.",
            EventType::EmailMessage => "Email-originated message, free-form payload.",
            EventType::SchedulerMessage => "Scheduler-originated message, free-form payload.",
            EventType::RedditScraperMessage => "Reddit-scraper-originated message, free-form payload.",
        }
    }

    /// JSON-schema-shaped description of the payload, for display only
    /// (actual validation uses the typed `EventPayload` below).
    pub fn payload_schema_json(&self) -> Option<Value> {
        match self {
            EventType::SessionResponse => Some(serde_json::json!({
                "response": "string (required)"
            })),
            EventType::UserPromptSubmit => Some(serde_json::json!({
                "prompt": "string (required)"
            })),
            EventType::PreToolUse => Some(serde_json::json!({
                "tool_name": "string (required)",
                "tool_input": "object (required)"
            })),
            EventType::PostToolUse => Some(serde_json::json!({
                "tool_name": "string (required)",
                "tool_output": "object (required)"
            })),
            _ => None,
        }
    }

    pub fn all() -> &'static [EventType] {
        &[
            EventType::SessionStart,
            EventType::SessionResponse,
            EventType::UserPromptSubmit,
            EventType::PreToolUse,
            EventType::PostToolUse,
            EventType::SessionEnd,
            EventType::NodeMessage,
            EventType::EventBatch,
            EventType::SystemMessage,
            EventType::EmailMessage,
            EventType::SchedulerMessage,
            EventType::RedditScraperMessage,
        ]
    }
}

/// Compile-time payload shapes for the event types that declare a schema;
/// `Freeform` covers the rest plus any payload carried as opaque JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    SessionResponse { response: String },
    UserPromptSubmit { prompt: String },
    PreToolUse { tool_name: String, tool_input: Value },
    PostToolUse { tool_name: String, tool_output: Value },
    Freeform(Value),
}

impl EventPayload {
    /// Validate that `value` matches the schema declared for `event_type`,
    /// returning the typed payload on success. Event types without a
    /// declared schema accept any JSON value.
    pub fn validate(event_type: EventType, value: Value) -> Result<Self, MosaicError> {
        let invalid = |reason: &str| MosaicError::SchemaInvalid {
            event_type: event_type.as_str().to_string(),
            reason: reason.to_string(),
        };

        match event_type {
            EventType::SessionResponse => {
                let response = value
                    .get("response")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("missing required field `response`"))?
                    .to_string();
                Ok(EventPayload::SessionResponse { response })
            }
            EventType::UserPromptSubmit => {
                let prompt = value
                    .get("prompt")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("missing required field `prompt`"))?
                    .to_string();
                Ok(EventPayload::UserPromptSubmit { prompt })
            }
            EventType::PreToolUse => {
                let tool_name = value
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("missing required field `tool_name`"))?
                    .to_string();
                let tool_input = value
                    .get("tool_input")
                    .cloned()
                    .ok_or_else(|| invalid("missing required field `tool_input`"))?;
                Ok(EventPayload::PreToolUse {
                    tool_name,
                    tool_input,
                })
            }
            EventType::PostToolUse => {
                let tool_name = value
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("missing required field `tool_name`"))?
                    .to_string();
                let tool_output = value
                    .get("tool_output")
                    .cloned()
                    .ok_or_else(|| invalid("missing required field `tool_output`"))?;
                Ok(EventPayload::PostToolUse {
                    tool_name,
                    tool_output,
                })
            }
            _ => Ok(EventPayload::Freeform(value)),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            EventPayload::SessionResponse { response } => serde_json::json!({ "response": response }),
            EventPayload::UserPromptSubmit { prompt } => serde_json::json!({ "prompt": prompt }),
            EventPayload::PreToolUse { tool_name, tool_input } => {
                serde_json::json!({ "tool_name": tool_name, "tool_input": tool_input })
            }
            EventPayload::PostToolUse { tool_name, tool_output } => {
                serde_json::json!({ "tool_name": tool_name, "tool_output": tool_output })
            }
            EventPayload::Freeform(v) => v,
        }
    }
}

/// The addressed unit the Broker transports. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub source_id: String,
    pub target_id: String,
    pub event_type: EventType,
    pub upstream_session_id: String,
    pub downstream_session_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        event_type: EventType,
        upstream_session_id: impl Into<String>,
        downstream_session_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            event_type,
            upstream_session_id: upstream_session_id.into(),
            downstream_session_id: downstream_session_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// `"{mesh_id}#{node_id}"`. Equality is exact string equality.
pub fn topic(mesh_id: &str, node_id: &str) -> String {
    format!("{mesh_id}#{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_mesh_hash_node() {
        assert_eq!(topic("1", "20"), "1#20");
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(EventType::parse("not_a_real_type").is_err());
    }

    #[test]
    fn session_response_requires_response_field() {
        let err = EventPayload::validate(EventType::SessionResponse, serde_json::json!({}));
        assert!(err.is_err());
        let ok = EventPayload::validate(
            EventType::SessionResponse,
            serde_json::json!({ "response": "hi" }),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn session_start_accepts_any_payload() {
        let ok = EventPayload::validate(EventType::SessionStart, serde_json::json!({"whatever": 1}));
        assert!(ok.is_ok());
    }

    #[test]
    fn pre_tool_use_requires_both_fields() {
        assert!(EventPayload::validate(
            EventType::PreToolUse,
            serde_json::json!({ "tool_name": "bash" })
        )
        .is_err());
        assert!(EventPayload::validate(
            EventType::PreToolUse,
            serde_json::json!({ "tool_name": "bash", "tool_input": {} })
        )
        .is_ok());
    }
}
