//! Format normalizer - maps the JSON payloads produced by the transcript
//! endpoint (or exported from it) onto canonical messages.
//!
//! Handles:
//! - response envelopes: bare array, `{data: [...]}`, `{success, data}`, single object
//! - grouped sessions: `{session_id, author, first_message_text, conversations: [...]}`
//! - flat messages: `{session_id|sessionId|session, author|sender|from,
//!   message|text|content, timestamp|created_at|date}`
//! - summary-only sessions (`count_messages`, no `conversations`): rejected
//!
//! Every top-level record is classified into a [`RecordShape`] before any field
//! is read; each shape then has its own decoder.

use crate::diagnostics::{Diagnostic, DiagnosticSink, SkipReason};
use crate::error::LoadError;
use crate::sessions::{AuthorRole, CanonicalMessage};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const SESSION_ID_KEYS: &[&str] = &["session_id", "sessionId", "session"];
const AUTHOR_KEYS: &[&str] = &["author", "sender", "from"];
const MESSAGE_KEYS: &[&str] = &["message", "text", "content"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "created_at", "date"];
const EXECUTION_KEYS: &[&str] = &["execution_id", "executionId", "execution"];
const CONTACT_KEYS: &[&str] = &["contato", "contact"];
const PREVIEW_KEYS: &[&str] = &["first_message_text"];

/// Fields that only ever appear on aggregate (summary) records
const SUMMARY_KEYS: &[&str] = &["count_messages", "message_count", "first_message_text", "elapsed_time"];

/// Grouped sessions carry the contact as the session-level author
const CONTACT_PREFIX: &str = "whatsapp:+";

/// What to do with an author token outside both vocabularies (JSON shapes only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownAuthorPolicy {
    /// Map to bot-side and report an `UnknownAuthor` diagnostic
    #[default]
    Bot,
    /// Fail the load
    Reject,
}

impl UnknownAuthorPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "bot" => Some(Self::Bot),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Which wrapper the records arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Array,
    DataArray,
    SuccessData,
    SingleObject,
    Empty,
}

/// One top-level record after classification
#[derive(Debug)]
pub enum RecordShape<'a> {
    Grouped {
        record: &'a Map<String, Value>,
        conversations: &'a [Value],
    },
    Flat(&'a Map<String, Value>),
    SummaryOnly(&'a Map<String, Value>),
    NotAnObject,
}

/// Classify a record by field presence. A nested `conversations` array wins;
/// a record with summary fields but no message body is summary-only;
/// everything else decodes as a flat message.
pub fn classify(record: &Value) -> RecordShape<'_> {
    let Some(obj) = record.as_object() else {
        return RecordShape::NotAnObject;
    };
    if let Some(Value::Array(conversations)) = obj.get("conversations") {
        return RecordShape::Grouped {
            record: obj,
            conversations,
        };
    }
    if !has_any(obj, MESSAGE_KEYS) && has_any(obj, SUMMARY_KEYS) {
        return RecordShape::SummaryOnly(obj);
    }
    RecordShape::Flat(obj)
}

/// Strip the response envelope down to a list of records.
pub fn unwrap_envelope(root: Value) -> Result<(Envelope, Vec<Value>), LoadError> {
    match root {
        Value::Array(items) => Ok((Envelope::Array, items)),
        Value::Object(mut obj) => {
            match obj.remove("data") {
                Some(Value::Array(items)) => return Ok((Envelope::DataArray, items)),
                Some(data) if is_truthy(obj.get("success")) && is_truthy(Some(&data)) => {
                    return Ok((Envelope::SuccessData, vec![data]));
                }
                Some(data) => {
                    obj.insert("data".to_string(), data);
                }
                None => {}
            }
            if obj.is_empty() {
                Ok((Envelope::Empty, Vec::new()))
            } else {
                Ok((Envelope::SingleObject, vec![Value::Object(obj)]))
            }
        }
        other => Err(LoadError::Malformed(format!(
            "expected a JSON array or object, got {}",
            json_type(&other)
        ))),
    }
}

/// Parse JSON text and normalize it.
pub fn normalize_json(
    text: &str,
    policy: UnknownAuthorPolicy,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<CanonicalMessage>, LoadError> {
    let root: Value = serde_json::from_str(text)?;
    normalize_payload(root, policy, sink)
}

/// Normalize an already-parsed payload. Fails when nothing survives.
pub fn normalize_payload(
    root: Value,
    policy: UnknownAuthorPolicy,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<CanonicalMessage>, LoadError> {
    let (envelope, records) = unwrap_envelope(root)?;
    sink.emit(Diagnostic::EnvelopeUnwrapped {
        envelope,
        records: records.len(),
    });

    let messages = Normalizer::new(policy, sink).normalize_records(&records)?;
    if messages.is_empty() {
        return Err(LoadError::NoConversations);
    }
    Ok(messages)
}

/// Decodes classified records. Holds the author policy, the sink and the
/// fallback timestamp for one load.
pub struct Normalizer<'a> {
    policy: UnknownAuthorPolicy,
    sink: &'a dyn DiagnosticSink,
    loaded_at: String,
}

impl<'a> Normalizer<'a> {
    pub fn new(policy: UnknownAuthorPolicy, sink: &'a dyn DiagnosticSink) -> Self {
        Self {
            policy,
            sink,
            loaded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn normalize_records(&self, records: &[Value]) -> Result<Vec<CanonicalMessage>, LoadError> {
        let mut out = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match classify(record) {
                RecordShape::Grouped { record, conversations } => {
                    self.decode_grouped(index, record, conversations, &mut out)?;
                }
                RecordShape::Flat(record) => {
                    if let Some(message) = self.decode_flat(index, record)? {
                        out.push(message);
                    }
                }
                RecordShape::SummaryOnly(record) => {
                    let session_id = first_text(record, SESSION_ID_KEYS)
                        .unwrap_or_else(|| format!("#{}", index + 1));
                    return Err(LoadError::SummaryOnly { session_id });
                }
                RecordShape::NotAnObject => self.skip(index, None, SkipReason::NotAnObject),
            }
        }
        Ok(out)
    }

    fn decode_grouped(
        &self,
        index: usize,
        record: &Map<String, Value>,
        conversations: &[Value],
        out: &mut Vec<CanonicalMessage>,
    ) -> Result<(), LoadError> {
        let Some(session_id) = first_text(record, SESSION_ID_KEYS) else {
            self.skip(index, None, SkipReason::MissingSessionId);
            return Ok(());
        };
        let contact = first_text(record, &["author"]).and_then(|a| strip_contact_prefix(&a));
        let first_message_text = first_text(record, PREVIEW_KEYS);

        let before = out.len();
        for (position, entry) in conversations.iter().enumerate() {
            let Some(entry) = entry.as_object() else {
                self.skip(index, Some(position), SkipReason::NotAnObject);
                continue;
            };
            let Some(raw_author) = first_text(entry, AUTHOR_KEYS) else {
                self.skip(index, Some(position), SkipReason::MissingAuthor);
                continue;
            };
            let Some(body) = self.message_body(index, Some(position), entry) else {
                continue;
            };
            let author = self.resolve_author(&session_id, &raw_author)?;
            let timestamp = self.timestamp(&session_id, entry);

            out.push(CanonicalMessage {
                session_id: session_id.clone(),
                execution_id: Some(session_id.clone()),
                timestamp,
                author,
                message: body,
                contact: contact.clone(),
                first_message_text: first_message_text.clone(),
            });
        }

        self.sink.emit(Diagnostic::SessionDecoded {
            session_id,
            messages: out.len() - before,
        });
        Ok(())
    }

    fn decode_flat(
        &self,
        index: usize,
        record: &Map<String, Value>,
    ) -> Result<Option<CanonicalMessage>, LoadError> {
        let Some(session_id) = first_text(record, SESSION_ID_KEYS) else {
            self.skip(index, None, SkipReason::MissingSessionId);
            return Ok(None);
        };
        let Some(raw_author) = first_text(record, AUTHOR_KEYS) else {
            self.skip(index, None, SkipReason::MissingAuthor);
            return Ok(None);
        };
        let Some(body) = self.message_body(index, None, record) else {
            return Ok(None);
        };
        let author = self.resolve_author(&session_id, &raw_author)?;
        let timestamp = self.timestamp(&session_id, record);
        let execution_id = first_text(record, EXECUTION_KEYS).unwrap_or_else(|| session_id.clone());

        Ok(Some(CanonicalMessage {
            execution_id: Some(execution_id),
            timestamp,
            author,
            message: body,
            contact: first_text(record, CONTACT_KEYS).and_then(|c| strip_contact_prefix(&c)),
            first_message_text: first_text(record, PREVIEW_KEYS),
            session_id,
        }))
    }

    /// Trimmed body. Blank bodies are dropped without a diagnostic; absent
    /// bodies are reported.
    fn message_body(
        &self,
        index: usize,
        position: Option<usize>,
        record: &Map<String, Value>,
    ) -> Option<String> {
        let body = first_text(record, MESSAGE_KEYS);
        if body.is_none() && !has_any(record, MESSAGE_KEYS) {
            self.skip(index, position, SkipReason::MissingMessage);
        }
        body
    }

    fn resolve_author(&self, session_id: &str, raw: &str) -> Result<AuthorRole, LoadError> {
        if let Some(role) = AuthorRole::from_alias(raw) {
            return Ok(role);
        }
        match self.policy {
            UnknownAuthorPolicy::Bot => {
                self.sink.emit(Diagnostic::UnknownAuthor {
                    session_id: session_id.to_string(),
                    author: raw.to_string(),
                });
                Ok(AuthorRole::Bot)
            }
            UnknownAuthorPolicy::Reject => Err(LoadError::UnknownAuthor {
                session_id: session_id.to_string(),
                author: raw.to_string(),
            }),
        }
    }

    fn timestamp(&self, session_id: &str, record: &Map<String, Value>) -> String {
        first_text(record, TIMESTAMP_KEYS).unwrap_or_else(|| {
            self.sink.emit(Diagnostic::MissingTimestamp {
                session_id: session_id.to_string(),
            });
            self.loaded_at.clone()
        })
    }

    fn skip(&self, index: usize, position: Option<usize>, reason: SkipReason) {
        self.sink.emit(Diagnostic::RecordSkipped {
            index,
            position,
            reason,
        });
    }
}

/// First alias holding a non-blank string or a number, trimmed.
fn first_text(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn has_any(record: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|key| record.contains_key(*key))
}

fn strip_contact_prefix(raw: &str) -> Option<String> {
    let contact = raw.trim();
    let contact = contact.strip_prefix(CONTACT_PREFIX).unwrap_or(contact);
    (!contact.is_empty()).then(|| contact.to_string())
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
