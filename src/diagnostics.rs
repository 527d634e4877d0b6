//! Diagnostics reported by the normalizer and the aggregator.
//!
//! Parsing code never logs directly; it reports to a [`DiagnosticSink`].
//! [`Collector`] is the sink used for loads: it forwards every event to
//! `tracing` and keeps them so `/api/diagnostics` can show what the last load
//! tripped over.

use crate::normalizer::Envelope;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAnObject,
    MissingSessionId,
    MissingAuthor,
    MissingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Diagnostic {
    EnvelopeUnwrapped {
        envelope: Envelope,
        records: usize,
    },
    RecordSkipped {
        /// Top-level record index
        index: usize,
        /// Position inside the record's `conversations` array
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
        reason: SkipReason,
    },
    UnknownAuthor {
        session_id: String,
        author: String,
    },
    MissingTimestamp {
        session_id: String,
    },
    /// A grouped session and how many of its nested messages survived
    SessionDecoded {
        session_id: String,
        messages: usize,
    },
    SessionsAggregated {
        sessions: usize,
        messages: usize,
    },
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Forwards to `tracing` and keeps nothing
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        log(&diagnostic);
    }
}

/// Forwards to `tracing` and records every event
#[derive(Default)]
pub struct Collector {
    events: Mutex<Vec<Diagnostic>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_events(self) -> Vec<Diagnostic> {
        self.events
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DiagnosticSink for Collector {
    fn emit(&self, diagnostic: Diagnostic) {
        log(&diagnostic);
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(diagnostic);
    }
}

fn log(diagnostic: &Diagnostic) {
    match diagnostic {
        Diagnostic::EnvelopeUnwrapped { envelope, records } => {
            debug!("Response envelope {:?} carried {} records", envelope, records);
        }
        Diagnostic::RecordSkipped { index, position, reason } => match position {
            Some(p) => warn!("Record {} message {}: skipped ({:?})", index + 1, p + 1, reason),
            None => warn!("Record {}: skipped ({:?})", index + 1, reason),
        },
        Diagnostic::UnknownAuthor { session_id, author } => {
            warn!("Session {}: unknown author '{}', treating as bot", session_id, author);
        }
        Diagnostic::MissingTimestamp { session_id } => {
            warn!("Session {}: message without timestamp, using load time", session_id);
        }
        Diagnostic::SessionDecoded { session_id, messages } => {
            debug!("Session {}: {} messages", session_id, messages);
        }
        Diagnostic::SessionsAggregated { sessions, messages } => {
            info!("Aggregated {} messages into {} sessions", messages, sessions);
        }
    }
}
