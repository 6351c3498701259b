//! Trace records.
//!
//! An `AssistTrace` is one recorded assistant turn: input, rendered prompt,
//! model response, tool calls, the action taken and, eventually, its outcome.
//! Traces arrive in pieces, so this module also owns the merge rule applied when
//! a partial update names an existing trace id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::time::{parse_timestamp, Timestamp};

/// Model partition key used when a trace does not name its model.
pub const UNKNOWN_MODEL: &str = "unknown";

/// Terminal result of a trace.
///
/// `Unknown` is the only non-terminal value. The correlator moves a trace from
/// `Unknown` to `Success` or `Fail` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceOutcome {
    /// Not yet resolved.
    #[default]
    Unknown,
    /// A confirming state change was observed.
    Success,
    /// Part of the requested action was confirmed.
    Partial,
    /// No confirmation arrived within the correlation window.
    Fail,
}

impl TraceOutcome {
    /// All outcome values, in reporting order.
    pub const ALL: [Self; 4] = [Self::Unknown, Self::Success, Self::Partial, Self::Fail];

    /// Returns true for every value except `Unknown`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Wire name of the outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Fail => "fail",
        }
    }
}

/// Prompt truncation bookkeeping.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationInfo {
    #[serde(default)]
    pub was_truncated: bool,
    #[serde(default)]
    pub prompt_tokens_before: u64,
    #[serde(default)]
    pub prompt_tokens_after: u64,
}

/// One tool invocation made while producing the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Arguments passed to the tool.
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Raw tool response.
    #[serde(default)]
    pub response: Option<Value>,
    /// Whether the tool reported success.
    #[serde(default)]
    pub success: Option<bool>,
    /// Error message, when the call failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Full trace of an assistant pipeline request.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistTrace {
    pub trace_id: String,
    #[serde(with = "crate::time::serde_ts")]
    pub ts: Timestamp,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub user_text: Option<String>,
    #[serde(default)]
    pub audio_sha256: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub entities: Map<String, Value>,

    #[serde(default)]
    pub prompt_template_id: Option<String>,
    #[serde(default)]
    pub prompt_rendered: String,
    #[serde(default)]
    pub truncation: TruncationInfo,

    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub parsed_action: Option<Value>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default)]
    pub result: TraceOutcome,
    #[serde(default)]
    pub ha_events: Vec<Value>,
    #[serde(default)]
    pub user_feedback: Option<String>,
    #[serde(default)]
    pub repair_text: Option<String>,
    #[serde(default)]
    pub gold_action: Option<Value>,
}

impl AssistTrace {
    /// Creates an empty trace with the given id and creation time.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, ts: Timestamp) -> Self {
        Self {
            trace_id: trace_id.into(),
            ts,
            user_id: None,
            session_id: None,
            user_text: None,
            audio_sha256: None,
            context: Map::new(),
            entities: Map::new(),
            prompt_template_id: None,
            prompt_rendered: String::new(),
            truncation: TruncationInfo::default(),
            model: String::new(),
            params: Map::new(),
            response_text: String::new(),
            tool_calls: Vec::new(),
            parsed_action: None,
            latency_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            result: TraceOutcome::Unknown,
            ha_events: Vec::new(),
            user_feedback: None,
            repair_text: None,
            gold_action: None,
        }
    }

    /// Validates a complete trace payload.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the payload is not an object, lacks a
    /// non-empty `trace_id` or a parseable `ts`, or has fields of the wrong shape.
    pub fn from_value(payload: Value) -> Result<Self, ValidationError> {
        let trace_id = payload_trace_id(&payload)?;
        match payload.get("ts") {
            None | Some(Value::Null) => return Err(ValidationError::MissingField { field: "ts".to_string() }),
            Some(Value::String(raw)) => {
                parse_timestamp(raw)?;
            }
            Some(other) => {
                return Err(ValidationError::InvalidTimestamp {
                    value: other.to_string(),
                })
            }
        }

        serde_json::from_value(payload).map_err(|e| ValidationError::InvalidPayload {
            reason: format!("trace {trace_id}: {e}"),
        })
    }

    /// Merges a partial update into this trace.
    ///
    /// Nested objects merge key by key, arrays concatenate and scalars overwrite.
    /// A terminal `result` is never overwritten. On error `self` is unchanged.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the update names a different trace id,
    /// carries an unparseable `ts`, or yields a record of the wrong shape.
    pub fn merge(&mut self, update: Value) -> Result<(), ValidationError> {
        let Value::Object(mut update) = update else {
            return Err(ValidationError::InvalidPayload {
                reason: "trace update must be an object".to_string(),
            });
        };

        if let Some(id) = update.get("trace_id").and_then(Value::as_str) {
            if id != self.trace_id {
                return Err(ValidationError::InvalidField {
                    field: "trace_id".to_string(),
                    reason: format!("update for '{id}' applied to '{}'", self.trace_id),
                });
            }
        }
        if let Some(Value::String(raw)) = update.get("ts") {
            parse_timestamp(raw)?;
        }
        if self.result.is_terminal() {
            update.remove("result");
        }

        let mut merged = serde_json::to_value(&*self).map_err(|e| ValidationError::InvalidPayload {
            reason: e.to_string(),
        })?;
        merge_values(&mut merged, Value::Object(update));

        let next: Self = serde_json::from_value(merged).map_err(|e| ValidationError::InvalidPayload {
            reason: format!("trace {}: {e}", self.trace_id),
        })?;
        *self = next;
        Ok(())
    }

    /// Partition key for the model, falling back to `"unknown"`.
    #[must_use]
    pub fn model_key(&self) -> &str {
        if self.model.trim().is_empty() {
            UNKNOWN_MODEL
        } else {
            &self.model
        }
    }

    /// Entity ids named by `parsed_action.target.entity_id`.
    ///
    /// Accepts a single string or a list of strings; duplicates are dropped.
    #[must_use]
    pub fn target_entity_ids(&self) -> Vec<String> {
        let Some(target) = self
            .parsed_action
            .as_ref()
            .and_then(|pa| pa.get("target"))
            .filter(|t| t.is_object())
        else {
            return Vec::new();
        };

        let mut out: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            let id = id.trim();
            if !id.is_empty() && !out.iter().any(|e| e == id) {
                out.push(id.to_string());
            }
        };
        match target.get("entity_id") {
            Some(Value::String(id)) => push(id),
            Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).for_each(&mut push),
            _ => {}
        }
        out
    }
}

/// Extracts and checks `trace_id` from a raw payload.
pub(crate) fn payload_trace_id(payload: &Value) -> Result<String, ValidationError> {
    let Value::Object(map) = payload else {
        return Err(ValidationError::InvalidPayload {
            reason: "trace payload must be an object".to_string(),
        });
    };
    match map.get("trace_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.clone()),
        Some(Value::String(_)) => Err(ValidationError::InvalidField {
            field: "trace_id".to_string(),
            reason: "must not be empty".to_string(),
        }),
        Some(Value::Null) | None => Err(ValidationError::MissingField {
            field: "trace_id".to_string(),
        }),
        Some(other) => Err(ValidationError::InvalidField {
            field: "trace_id".to_string(),
            reason: format!("expected string, got {other}"),
        }),
    }
}

/// Recursive merge: objects by key, arrays appended, everything else replaced.
pub fn merge_values(existing: &mut Value, update: Value) {
    match (existing, update) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (key, value) in incoming {
                if let Some(slot) = current.get_mut(&key) {
                    merge_values(slot, value);
                } else {
                    current.insert(key, value);
                }
            }
        }
        (Value::Array(items), Value::Array(more)) => items.extend(more),
        (slot, value) => *slot = value,
    }
}
