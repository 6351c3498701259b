//! PII redaction.
//!
//! Strings are scrubbed with a fixed list of patterns, applied in order, and
//! then with the configured names. `strict` also treats the values of a few
//! person-identifying keys as names, wherever they appear in the record.
//!
//! Identity and label fields are never rewritten: see [`PROTECTED_FIELDS`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::{NoExpand, Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::config::{RedactionLevel, TracesConfig};
use crate::error::{TracesError, TracesResult};
use crate::trace::AssistTrace;

/// Top-level trace fields left untouched by redaction.
pub const PROTECTED_FIELDS: [&str; 8] = [
    "trace_id",
    "ts",
    "model",
    "result",
    "audio_sha256",
    "prompt_template_id",
    "parsed_action",
    "gold_action",
];

/// Keys whose string values name a person under `strict`.
pub const STRICT_KEYS: [&str; 4] = ["user", "owner", "household_members", "user_id"];

const BASIC_PATTERNS: [(&str, &str); 7] = [
    ("<EMAIL>", r"[\w.%-]+@[\w.-]+"),
    ("<PHONE>", r"\+?\d[\d\s-]{7,}\d"),
    ("<IP>", r"\b\d{1,3}(?:\.\d{1,3}){3}\b"),
    ("<MAC>", r"\b(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}\b"),
    ("<URL>", r"https?://\S+"),
    ("<SSID>", r"(?i)ssid-\w+"),
    ("<ADDR>", r"\d{1,4} [A-Za-z0-9 .]{3,}"),
];

const NAME_CACHE_MAX: usize = 256;

static COMPILED: OnceLock<Result<Vec<(&'static str, Regex)>, String>> = OnceLock::new();

fn basic_patterns() -> TracesResult<&'static [(&'static str, Regex)]> {
    let compiled = COMPILED.get_or_init(|| {
        BASIC_PATTERNS
            .iter()
            .map(|(token, pattern)| {
                Regex::new(pattern)
                    .map(|re| (*token, re))
                    .map_err(|e| format!("invalid redaction pattern {token}: {e}"))
            })
            .collect()
    });
    compiled.as_deref().map_err(|e| TracesError::internal(e.clone()))
}

/// Scrubs PII from trace text.
#[derive(Debug)]
pub struct Redactor {
    level: RedactionLevel,
    known_names: Vec<String>,
    name_cache: RwLock<HashMap<String, Regex>>,
}

impl Redactor {
    /// Creates a redactor for `level` with the given known names.
    #[must_use]
    pub fn new(level: RedactionLevel, known_names: &[String]) -> Self {
        let mut names: Vec<String> = Vec::new();
        for name in known_names {
            push_name(&mut names, name);
        }
        Self {
            level,
            known_names: names,
            name_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a redactor from the integration options.
    #[must_use]
    pub fn from_config(cfg: &TracesConfig) -> Self {
        Self::new(cfg.redaction_level, &cfg.known_names)
    }

    /// Scrubs a single string with the patterns and the known names.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a pattern cannot be compiled.
    pub fn redact_text(&self, text: &str) -> TracesResult<String> {
        if self.level == RedactionLevel::None {
            return Ok(text.to_string());
        }
        self.scrub(text, &self.known_names)
    }

    /// Scrubs every string and map key inside `value`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a pattern cannot be compiled.
    pub fn redact_value(&self, value: &Value) -> TracesResult<Value> {
        if self.level == RedactionLevel::None {
            return Ok(value.clone());
        }
        let names = self.names_for(value);
        self.scrub_value(value, &names)
    }

    /// Returns a redacted copy of `trace`. Fields in [`PROTECTED_FIELDS`]
    /// are copied as they are.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace cannot be round-tripped through JSON or a
    /// pattern cannot be compiled.
    pub fn redact_trace(&self, trace: &AssistTrace) -> TracesResult<AssistTrace> {
        if self.level == RedactionLevel::None {
            return Ok(trace.clone());
        }

        let Value::Object(fields) = serde_json::to_value(trace)? else {
            return Err(TracesError::internal("trace did not serialize to an object"));
        };
        let names = self.names_for_fields(&fields);

        let mut out = Map::with_capacity(fields.len());
        for (key, value) in fields {
            let value = if PROTECTED_FIELDS.contains(&key.as_str()) {
                value
            } else {
                self.scrub_value(&value, &names)?
            };
            out.insert(key, value);
        }
        Ok(serde_json::from_value(Value::Object(out))?)
    }

    fn names_for(&self, value: &Value) -> Vec<String> {
        let mut names = self.known_names.clone();
        if self.level == RedactionLevel::Strict {
            collect_strict_names(value, &mut names);
        }
        names
    }

    fn names_for_fields(&self, fields: &Map<String, Value>) -> Vec<String> {
        let mut names = self.known_names.clone();
        if self.level == RedactionLevel::Strict {
            for (key, value) in fields {
                if STRICT_KEYS.contains(&key.as_str()) {
                    collect_name_values(value, &mut names);
                }
                collect_strict_names(value, &mut names);
            }
        }
        names
    }

    fn scrub_value(&self, value: &Value, names: &[String]) -> TracesResult<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.scrub(s, names)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.scrub_value(v, names))
                    .collect::<TracesResult<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, v) in map {
                    out.insert(self.scrub_patterns(key)?.into_owned(), self.scrub_value(v, names)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    fn scrub(&self, text: &str, names: &[String]) -> TracesResult<String> {
        let mut out = self.scrub_patterns(text)?.into_owned();
        for (idx, name) in names.iter().enumerate() {
            let re = self.name_regex(name)?;
            if re.is_match(&out) {
                let label = format!("<NAME_{idx}>");
                out = re.replace_all(&out, NoExpand(&label)).into_owned();
            }
        }
        Ok(out)
    }

    fn scrub_patterns<'a>(&self, text: &'a str) -> TracesResult<Cow<'a, str>> {
        let mut out = Cow::Borrowed(text);
        for (token, re) in basic_patterns()? {
            if re.is_match(&out) {
                out = Cow::Owned(re.replace_all(&out, NoExpand(*token)).into_owned());
            }
        }
        Ok(out)
    }

    fn name_regex(&self, name: &str) -> TracesResult<Regex> {
        {
            let cache = self
                .name_cache
                .read()
                .map_err(|_| TracesError::internal("redaction name cache lock poisoned"))?;
            if let Some(re) = cache.get(name) {
                return Ok(re.clone());
            }
        }

        let re = RegexBuilder::new(&regex::escape(name))
            .case_insensitive(true)
            .build()
            .map_err(|e| TracesError::internal(format!("invalid name pattern: {e}")))?;

        let mut cache = self
            .name_cache
            .write()
            .map_err(|_| TracesError::internal("redaction name cache lock poisoned"))?;
        if cache.len() >= NAME_CACHE_MAX {
            cache.clear();
        }
        cache.insert(name.to_string(), re.clone());
        Ok(re)
    }
}

fn push_name(names: &mut Vec<String>, name: &str) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    let lowered = name.to_lowercase();
    if !names.iter().any(|n| n.to_lowercase() == lowered) {
        names.push(name.to_string());
    }
}

fn collect_name_values(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => push_name(names, s),
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    push_name(names, s);
                }
            }
        }
        _ => {}
    }
}

fn collect_strict_names(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if STRICT_KEYS.contains(&key.as_str()) {
                    collect_name_values(v, names);
                }
                collect_strict_names(v, names);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_strict_names(item, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::time::parse_timestamp;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn basic_patterns_replace_with_tokens() {
        let r = Redactor::new(RedactionLevel::Basic, &[]);
        let out = r
            .redact_value(&json!({"msg": "Email me at test@example.com", "ip": "10.1.1.1"}))
            .unwrap();
        assert_eq!(out["msg"], "Email me at <EMAIL>");
        assert_eq!(out["ip"], "<IP>");

        assert_eq!(r.redact_text("see https://example.org/x now").unwrap(), "see <URL> now");
        assert_eq!(r.redact_text("joined SSID-Home5G").unwrap(), "joined <SSID>");
        assert_eq!(r.redact_text("mac aa:bb:cc:dd:ee:ff").unwrap(), "mac <MAC>");
        assert_eq!(r.redact_text("call +1 555-123-4567").unwrap(), "call <PHONE>");
    }

    #[test]
    fn known_names_are_case_insensitive_and_indexed() {
        let r = Redactor::new(RedactionLevel::Basic, &names(&["Teagan", "Rowan"]));
        assert_eq!(
            r.redact_text("teagan asked ROWAN").unwrap(),
            "<NAME_0> asked <NAME_1>"
        );
    }

    #[test]
    fn strict_scrubs_values_of_person_keys() {
        let r = Redactor::new(RedactionLevel::Strict, &names(&["Teagan"]));
        let out = r.redact_value(&json!({"user": "Teagan", "msg": "Teagan did it"})).unwrap();
        assert_eq!(out["user"], "<NAME_0>");
        assert_eq!(out["msg"], "<NAME_0> did it");

        let out = r
            .redact_value(&json!({"owner": "Morgan", "note": {"text": "morgan left"}}))
            .unwrap();
        assert_eq!(out["owner"], "<NAME_1>");
        assert_eq!(out["note"]["text"], "<NAME_1> left");
    }

    #[test]
    fn basic_ignores_person_keys() {
        let r = Redactor::new(RedactionLevel::Basic, &[]);
        let out = r.redact_value(&json!({"user": "Morgan"})).unwrap();
        assert_eq!(out["user"], "Morgan");
    }

    #[test]
    fn none_level_is_identity() {
        let r = Redactor::new(RedactionLevel::None, &names(&["Teagan"]));
        let v = json!({"msg": "Teagan test@example.com"});
        assert_eq!(r.redact_value(&v).unwrap(), v);
    }

    #[test]
    fn trace_redaction_keeps_protected_fields() {
        let mut trace = AssistTrace::new("t1", parse_timestamp("2024-06-01T00:00:00").unwrap());
        trace.model = "m".to_string();
        trace.user_text = Some("ping 192.168.1.20 for Teagan".to_string());
        trace.user_id = Some("Teagan".to_string());
        trace.parsed_action = Some(json!({"target": {"entity_id": "light.kitchen"}, "note": "10.0.0.1"}));
        trace.context.insert("where".to_string(), json!("12 Elm Street"));

        let r = Redactor::new(RedactionLevel::Strict, &[]);
        let out = r.redact_trace(&trace).unwrap();

        assert_eq!(out.user_text.as_deref(), Some("ping <IP> for <NAME_0>"));
        assert_eq!(out.user_id.as_deref(), Some("<NAME_0>"));
        assert_eq!(out.context["where"], "<ADDR>");
        assert_eq!(out.trace_id, "t1");
        assert_eq!(out.ts, trace.ts);
        assert_eq!(out.model, "m");
        assert_eq!(out.parsed_action, trace.parsed_action);
        // The source trace is not touched.
        assert_eq!(trace.user_id.as_deref(), Some("Teagan"));
    }
}
