//! Streaming response parser.
//!
//! Two independent halves:
//! - [`parse_data_stream`] relays a raw byte stream as text, decoding UTF-8
//!   incrementally and reporting every delta.
//! - [`parse_agent_response`] pulls a structured [`AgentResponse`] out of
//!   free-form model output. It never fails; unparseable text becomes a
//!   fallback response that carries the text through as `output`.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::AgentRole;
use crate::llm::LlmError;
use crate::queue::Priority;
use crate::util::{is_truthy, stringify_value};

/// Incremental UTF-8 decoder that holds back incomplete trailing sequences.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as forms complete characters.
    ///
    /// Invalid sequences become U+FFFD; a split multi-byte character at the
    /// end is carried over to the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is well-formed
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Read `stream` to completion, calling `on_delta(delta, accumulated)` for
/// every decoded chunk, and return the full text.
pub async fn parse_data_stream<S, B, F>(stream: S, mut on_delta: F) -> Result<String, LlmError>
where
    S: Stream<Item = Result<B, LlmError>>,
    B: AsRef<[u8]>,
    F: FnMut(&str, &str),
{
    futures::pin_mut!(stream);
    let mut decoder = Utf8Decoder::new();
    let mut full = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let delta = decoder.decode(chunk.as_ref());
        if delta.is_empty() {
            continue;
        }
        full.push_str(&delta);
        on_delta(&delta, &full);
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        full.push_str(&tail);
        on_delta(&tail, &full);
    }

    Ok(full)
}

/// A request from an agent to create a child agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "task")]
    pub objective: String,
    #[serde(default)]
    pub priority: Option<String>,
}

impl SpawnRequest {
    /// Requested role, defaulting to researcher for unknown values.
    pub fn role(&self) -> AgentRole {
        self.role
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(AgentRole::Researcher)
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority.as_deref().and_then(|p| p.parse().ok())
    }

    /// Best-effort read of one `spawn_agents` entry. A bare string is taken
    /// as the objective; anything else that is not an object is skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(objective) => Some(Self {
                role: None,
                name: None,
                objective: objective.clone(),
                priority: None,
            }),
            Value::Object(obj) => Some(Self {
                role: text_field(obj, "role"),
                name: text_field(obj, "name"),
                objective: text_field(obj, "objective")
                    .or_else(|| text_field(obj, "task"))
                    .unwrap_or_default(),
                priority: text_field(obj, "priority"),
            }),
            _ => None,
        }
    }
}

/// Non-empty text rendering of `obj[key]`.
fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .map(stringify_value)
        .filter(|s| !s.trim().is_empty())
}

/// What the agent needs from a human before it can continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Structured result of one model turn.
///
/// Only `complete` is guaranteed; every other field may be absent. Fields
/// the engine does not know about are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_agents: Option<Vec<SpawnRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searches: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentResponse {
    /// Response used when nothing structured could be recovered from `text`.
    pub fn fallback(text: &str) -> Self {
        Self {
            thinking: Some("Processing...".to_string()),
            activity: Some("Working on objective".to_string()),
            progress_delta: Some(5.0),
            output: Some(Value::String(text.to_string())),
            complete: false,
            spawn_agents: None,
            needs_input: None,
            searches: None,
            artifacts: None,
            extra: Map::new(),
        }
    }

    /// Read a response out of any JSON object.
    ///
    /// Each known field is read on its own and dropped if it has an unusable
    /// type, so one odd field never costs the rest of the reply.
    pub fn from_object(mut obj: Map<String, Value>) -> Self {
        let mut take = |key: &str| obj.remove(key).filter(|v| !v.is_null());

        let thinking = take("thinking").map(|v| stringify_value(&v));
        let activity = take("activity").map(|v| stringify_value(&v));
        let progress_delta = take("progress_delta").and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        let output = take("output");
        let complete = take("complete").is_some_and(|v| is_truthy(&v));
        let spawn_agents = take("spawn_agents").and_then(|v| match v {
            Value::Array(items) => Some(items.iter().filter_map(SpawnRequest::from_value).collect()),
            _ => None,
        });
        let needs_input = take("needs_input");
        let searches = take("searches").and_then(into_array);
        let artifacts = take("artifacts").and_then(into_array);

        Self {
            thinking,
            activity,
            progress_delta,
            output,
            complete,
            spawn_agents,
            needs_input,
            searches,
            artifacts,
            extra: obj,
        }
    }

    /// `output` rendered as text (empty when absent).
    pub fn output_text(&self) -> String {
        self.output.as_ref().map(stringify_value).unwrap_or_default()
    }

    /// Interpret `needs_input`, which models send as a string, an object or
    /// a bare `true` paired with a top-level `question`.
    pub fn input_request(&self) -> Option<InputRequest> {
        let value = self.needs_input.as_ref().filter(|v| is_truthy(v))?;
        match value {
            Value::String(question) => Some(InputRequest {
                question: question.clone(),
                options: Vec::new(),
            }),
            Value::Object(obj) => {
                let question = obj
                    .get("question")
                    .or_else(|| obj.get("prompt"))
                    .map(stringify_value)
                    .unwrap_or_else(|| "Input requested".to_string());
                let options = obj
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|opts| opts.iter().map(stringify_value).collect())
                    .unwrap_or_default();
                Some(InputRequest { question, options })
            }
            _ => Some(InputRequest {
                question: self
                    .extra
                    .get("question")
                    .map(stringify_value)
                    .unwrap_or_else(|| "Input requested".to_string()),
                options: Vec::new(),
            }),
        }
    }
}

/// Extract a structured response from raw model output. Never fails.
pub fn parse_agent_response(text: &str) -> AgentResponse {
    let body = strip_code_fence(text.trim());

    if let Some(parsed) = parse_object(body) {
        return parsed;
    }

    if let Some(candidate) = last_balanced_object(body) {
        if let Some(parsed) = parse_object(candidate) {
            return parsed;
        }
    }

    AgentResponse::fallback(text)
}

fn parse_object(s: &str) -> Option<AgentResponse> {
    match serde_json::from_str(s).ok()? {
        Value::Object(obj) => Some(AgentResponse::from_object(obj)),
        _ => None,
    }
}

fn into_array(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

/// Strip a surrounding ``` fence (with or without a language tag).
fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop the language tag line, if any.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Scan backward for the last `{...}` whose braces balance.
fn last_balanced_object(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let end = s.rfind('}')?;
    let mut depth = 0i32;

    for idx in (0..=end).rev() {
        match bytes[idx] {
            b'}' => depth += 1,
            b'{' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[idx..=end]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn chunks(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, LlmError>> {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    #[tokio::test]
    async fn data_stream_reassembles_split_multibyte_chars() {
        // "é" is 0xC3 0xA9, "€" is 0xE2 0x82 0xAC
        let stream = chunks(vec![
            &b"caf\xC3"[..],
            &b"\xA9 "[..],
            &b"\xE2\x82"[..],
            &b"\xAC!"[..],
        ]);
        let mut deltas = Vec::new();
        let text = parse_data_stream(stream, |delta, acc| {
            deltas.push((delta.to_string(), acc.to_string()));
        })
        .await
        .unwrap();

        assert_eq!(text, "café €!");
        assert!(deltas.iter().all(|(d, _)| !d.contains('\u{FFFD}')));
        assert_eq!(deltas.last().unwrap().1, "café €!");
    }

    #[tokio::test]
    async fn data_stream_propagates_errors() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(LlmError::network_error("reset")),
        ]);
        let result = parse_data_stream(stream, |_, _| {}).await;
        assert!(result.is_err());
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xE2"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn valid_json_round_trips() {
        let input = json!({
            "thinking": "plan",
            "activity": "Reading",
            "progress_delta": 10.0,
            "output": "found things",
            "complete": true,
            "custom_field": [1, 2]
        });
        let parsed = parse_agent_response(&input.to_string());
        assert_eq!(serde_json::to_value(&parsed).unwrap(), input);
    }

    #[test]
    fn strips_json_fence() {
        let text = "```json\n{\"output\": \"x\", \"complete\": false}\n```";
        let parsed = parse_agent_response(text);
        assert_eq!(parsed.output_text(), "x");
        assert!(!parsed.complete);

        let bare = "```\n{\"output\": \"y\", \"complete\": true}\n```";
        assert!(parse_agent_response(bare).complete);
    }

    #[test]
    fn recovers_last_balanced_object_from_prose() {
        let text = r#"Sure! Here is my answer: {"output": {"a": 1}, "complete": true} hope it helps"#;
        let parsed = parse_agent_response(text);
        assert!(parsed.complete);
        assert_eq!(parsed.output, Some(json!({"a": 1})));
    }

    #[test]
    fn non_json_returns_fallback_shape() {
        let text = "I could not format this as JSON";
        let parsed = parse_agent_response(text);
        assert_eq!(parsed, AgentResponse::fallback(text));
        assert_eq!(parsed.output_text(), text);
        assert!(!parsed.complete);
        assert_eq!(parsed.progress_delta, Some(5.0));
        assert_eq!(parsed.thinking.as_deref(), Some("Processing..."));
        assert_eq!(parsed.activity.as_deref(), Some("Working on objective"));
    }

    #[test]
    fn never_panics_on_degenerate_input() {
        for input in ["", "   ", "{", "}", "}{", "```", "```json", "{{}", "null", "[1,2]"] {
            let parsed = parse_agent_response(input);
            assert!(!parsed.complete, "input {:?}", input);
        }
    }

    #[test]
    fn spawn_requests_and_input_are_typed() {
        let text = r#"{
            "output": "delegating",
            "complete": false,
            "spawn_agents": [{"role": "validator", "name": "Checker", "objective": "verify", "priority": "high"}],
            "needs_input": {"question": "Which region?", "options": ["EU", "US"]}
        }"#;
        let parsed = parse_agent_response(text);
        let spawns = parsed.spawn_agents.clone().unwrap();
        assert_eq!(spawns[0].role(), AgentRole::Validator);
        assert_eq!(spawns[0].priority(), Some(Priority::High));

        let input = parsed.input_request().unwrap();
        assert_eq!(input.question, "Which region?");
        assert_eq!(input.options, vec!["EU", "US"]);
    }

    #[test]
    fn falsy_needs_input_is_ignored() {
        let parsed = parse_agent_response(r#"{"needs_input": false, "complete": false}"#);
        assert!(parsed.input_request().is_none());

        let parsed =
            parse_agent_response(r#"{"needs_input": true, "question": "Go?", "complete": false}"#);
        assert_eq!(parsed.input_request().unwrap().question, "Go?");
    }

    #[test]
    fn mistyped_optional_fields_do_not_reject_the_reply() {
        let parsed = parse_agent_response(
            r#"{"output": "all done", "complete": true, "progress_delta": "20"}"#,
        );
        assert!(parsed.complete);
        assert_eq!(parsed.output_text(), "all done");
        assert_eq!(parsed.progress_delta, Some(20.0));
        assert!(parsed.thinking.is_none());

        let parsed = parse_agent_response(
            r#"{"output": "noted", "complete": 1, "thinking": {"step": 2},
                "progress_delta": [5], "searches": "none", "artifacts": {"title": "x"}}"#,
        );
        assert!(parsed.complete);
        assert_eq!(parsed.thinking.as_deref(), Some(r#"{"step":2}"#));
        assert!(parsed.progress_delta.is_none());
        assert!(parsed.searches.is_none());
        assert!(parsed.artifacts.is_none());

        let parsed = parse_agent_response(r#"{"output": "still going", "complete": null}"#);
        assert!(!parsed.complete);
        assert_eq!(parsed.output_text(), "still going");
    }

    #[test]
    fn spawn_entries_are_read_one_by_one() {
        let parsed = parse_agent_response(
            r#"{"output": "splitting", "complete": false, "spawn_agents": [
                {"role": "executor", "task": "build it", "priority": 1},
                "look into the logs",
                42,
                {"name": "Nameless"}
            ]}"#,
        );
        let spawns = parsed.spawn_agents.unwrap();
        assert_eq!(spawns.len(), 3);
        assert_eq!(spawns[0].role(), AgentRole::Executor);
        assert_eq!(spawns[0].objective, "build it");
        assert_eq!(spawns[0].priority(), None);
        assert_eq!(spawns[1].objective, "look into the logs");
        assert_eq!(spawns[1].role(), AgentRole::Researcher);
        assert_eq!(spawns[2].objective, "");

        let parsed = parse_agent_response(r#"{"output": "x", "spawn_agents": "two helpers"}"#);
        assert!(parsed.spawn_agents.is_none());
    }
}
