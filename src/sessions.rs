//! Canonical message types and the in-memory dataset every handler reads from.
//!
//! A dataset is never edited in place: each load (remote fetch, upload or
//! import) builds a fresh [`Snapshot`] and swaps it in whole.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Who wrote a message. Every source vocabulary collapses onto these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorRole {
    Customer,
    Bot,
}

impl AuthorRole {
    /// Resolve a source author token. `None` means the token is in neither
    /// vocabulary and the caller's policy decides.
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cliente" | "customer" | "user" => Some(Self::Customer),
            "bot" | "assistant" | "sistema" => Some(Self::Bot),
            _ => None,
        }
    }

    /// Ordering used when two messages share a timestamp.
    pub fn tie_break_rank(self) -> u8 {
        match self {
            Self::Customer => 0,
            Self::Bot => 1,
        }
    }
}

/// One chat turn after shape detection and field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// ISO 8601, kept as received (trimmed)
    pub timestamp: String,
    pub author: AuthorRole,
    pub message: String,
    /// Contact number without the `whatsapp:+` prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// Session-level preview cached by the source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message_text: Option<String>,
}

impl CanonicalMessage {
    /// Execution id used for distinct-execution counting.
    pub fn execution_key(&self) -> &str {
        self.execution_id.as_deref().unwrap_or(&self.session_id)
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Parse the timestamp vocabularies seen in exports. Values without an
/// offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// Per-session aggregates. Derived from messages, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: usize,
    pub execution_count: usize,
    /// First customer message, else the chronologically first one
    pub preview: String,
    pub first_timestamp: String,
    pub last_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message_text: Option<String>,
}

/// A session's summary plus its chronologically sorted messages.
#[derive(Debug, Clone)]
pub struct SessionThread {
    pub summary: SessionSummary,
    pub messages: Vec<CanonicalMessage>,
}

/// Where the current dataset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Remote,
    Upload,
    ImportDir,
}

/// An immutable, ranked view of one load.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub source: Option<DataSource>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    /// Most recently active first
    threads: Vec<SessionThread>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    /// `threads` must already be ranked.
    pub fn new(source: DataSource, threads: Vec<SessionThread>) -> Self {
        let message_count = threads.iter().map(|t| t.messages.len()).sum();
        let index = threads
            .iter()
            .enumerate()
            .map(|(i, t)| (t.summary.session_id.clone(), i))
            .collect();
        Self {
            source: Some(source),
            loaded_at: Some(Utc::now()),
            message_count,
            threads,
            index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, session_id: &str) -> Option<&SessionThread> {
        self.index.get(session_id).map(|&i| &self.threads[i])
    }

    pub fn summaries(&self) -> impl Iterator<Item = &SessionSummary> {
        self.threads.iter().map(|t| &t.summary)
    }

    /// Previous and next session ids in ranking order.
    pub fn neighbors(&self, session_id: &str) -> (Option<&str>, Option<&str>) {
        let Some(&i) = self.index.get(session_id) else {
            return (None, None);
        };
        let prev = i
            .checked_sub(1)
            .map(|p| self.threads[p].summary.session_id.as_str());
        let next = self
            .threads
            .get(i + 1)
            .map(|t| t.summary.session_id.as_str());
        (prev, next)
    }

    /// The session to open directly when the load produced exactly one.
    pub fn sole_session(&self) -> Option<&str> {
        match self.threads.as_slice() {
            [only] => Some(only.summary.session_id.as_str()),
            _ => None,
        }
    }
}

/// Shared holder for the current snapshot
pub struct Dataset {
    current: RwLock<Arc<Snapshot>>,
}

impl Dataset {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
        })
    }

    pub async fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    /// Swap in a new snapshot, returning the one it replaced
    pub async fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let mut current = self.current.write().await;
        std::mem::replace(&mut *current, Arc::new(snapshot))
    }
}
