//! Session aggregator: groups canonical messages by session, orders each
//! session chronologically and ranks sessions by latest activity.

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::sessions::{parse_timestamp, AuthorRole, CanonicalMessage, SessionSummary, SessionThread};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

/// Group, sort and summarize. The result is ranked most recently active first.
pub fn aggregate(messages: Vec<CanonicalMessage>, sink: &dyn DiagnosticSink) -> Vec<SessionThread> {
    let total = messages.len();

    // first-seen order keeps ranking ties deterministic
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<CanonicalMessage>> = HashMap::new();
    for message in messages {
        groups
            .entry(message.session_id.clone())
            .or_insert_with(|| {
                order.push(message.session_id.clone());
                Vec::new()
            })
            .push(message);
    }

    let mut threads: Vec<SessionThread> = order
        .into_iter()
        .filter_map(|id| groups.remove(&id).map(|messages| build_thread(id, messages)))
        .collect();
    rank(&mut threads);

    sink.emit(Diagnostic::SessionsAggregated {
        sessions: threads.len(),
        messages: total,
    });
    threads
}

/// Timestamp ascending; at the same instant the customer goes first. Stable,
/// so equal timestamp and role keep input order.
pub fn sort_chronologically(messages: &mut [CanonicalMessage]) {
    messages.sort_by_cached_key(|m| (m.instant(), m.author.tie_break_rank()));
}

/// Most recently active first. Sessions whose last timestamp does not parse
/// go last; ties keep their current order.
pub fn rank(threads: &mut [SessionThread]) {
    threads.sort_by_cached_key(|t| Reverse(parse_timestamp(&t.summary.last_timestamp)));
}

fn build_thread(session_id: String, mut messages: Vec<CanonicalMessage>) -> SessionThread {
    sort_chronologically(&mut messages);

    let execution_count = messages
        .iter()
        .map(|m| m.execution_key())
        .collect::<HashSet<_>>()
        .len();
    let preview = messages
        .iter()
        .find(|m| m.author == AuthorRole::Customer)
        .or_else(|| messages.first())
        .map(|m| m.message.clone())
        .unwrap_or_default();
    let first = messages.first();
    let last = messages.last();

    let summary = SessionSummary {
        message_count: messages.len(),
        execution_count,
        preview,
        first_timestamp: first.map(|m| m.timestamp.clone()).unwrap_or_default(),
        last_timestamp: last.map(|m| m.timestamp.clone()).unwrap_or_default(),
        contact: messages.iter().find_map(|m| m.contact.clone()),
        first_message_text: messages.iter().find_map(|m| m.first_message_text.clone()),
        session_id,
    };
    SessionThread { summary, messages }
}
