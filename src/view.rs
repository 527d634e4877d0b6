//! View state computed for the browser: the filtered session list and the
//! single-session thread with date separators and search navigation.

use crate::sessions::{parse_timestamp, CanonicalMessage, SessionSummary, SessionThread, Snapshot};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Slider floors so the controls stay usable on small datasets
const MIN_MESSAGE_BOUND: usize = 100;
const MIN_EXECUTION_BOUND: usize = 10;

// ============================================================================
// Session list
// ============================================================================

/// Session list query. Every criterion is optional; set ones combine with AND.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub min_messages: Option<usize>,
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub min_executions: Option<usize>,
    #[serde(default)]
    pub max_executions: Option<usize>,
    /// Inclusive, compared against the session's first timestamp
    #[serde(default)]
    pub from: Option<NaiveDate>,
    /// Inclusive through the end of the day
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl SessionFilter {
    fn term(&self) -> Option<String> {
        self.q
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, summary: &SessionSummary) -> bool {
        if let Some(term) = self.term() {
            let hit = summary.session_id.to_lowercase().contains(&term)
                || summary.preview.to_lowercase().contains(&term);
            if !hit {
                return false;
            }
        }

        if !in_range(summary.message_count, self.min_messages, self.max_messages)
            || !in_range(summary.execution_count, self.min_executions, self.max_executions)
        {
            return false;
        }

        if self.from.is_some() || self.to.is_some() {
            let Some(first) = parse_timestamp(&summary.first_timestamp) else {
                return false;
            };
            if let Some(from) = self.from.and_then(start_of_day) {
                if first < from {
                    return false;
                }
            }
            if let Some(to) = self.to.and_then(|d| d.succ_opt()).and_then(start_of_day) {
                if first >= to {
                    return false;
                }
            }
        }
        true
    }

    /// Whether anything narrows the list. Range ends at the slider limits
    /// do not count.
    pub fn is_active(&self, bounds: &SliderBounds) -> bool {
        self.term().is_some()
            || self.from.is_some()
            || self.to.is_some()
            || self.min_messages.is_some_and(|v| v > 0)
            || self.max_messages.is_some_and(|v| v < bounds.max_messages)
            || self.min_executions.is_some_and(|v| v > 0)
            || self.max_executions.is_some_and(|v| v < bounds.max_executions)
    }
}

fn in_range(value: usize, min: Option<usize>, max: Option<usize>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

fn start_of_day(day: NaiveDate) -> Option<DateTime<Utc>> {
    day.and_hms_opt(0, 0, 0).map(|n| n.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SliderBounds {
    pub max_messages: usize,
    pub max_executions: usize,
}

impl SliderBounds {
    pub fn of(snapshot: &Snapshot) -> Self {
        let (messages, executions) = snapshot
            .summaries()
            .fold((0, 0), |(m, e), s| (m.max(s.message_count), e.max(s.execution_count)));
        Self {
            max_messages: messages.max(MIN_MESSAGE_BOUND),
            max_executions: executions.max(MIN_EXECUTION_BOUND),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
    pub bounds: SliderBounds,
    pub filters_active: bool,
    pub total_sessions: usize,
    pub total_messages: usize,
}

/// Filter the ranked sessions. Ranking order is preserved.
pub fn list_sessions(snapshot: &Snapshot, filter: &SessionFilter) -> SessionList {
    let bounds = SliderBounds::of(snapshot);
    SessionList {
        sessions: snapshot
            .summaries()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect(),
        filters_active: filter.is_active(&bounds),
        bounds,
        total_sessions: snapshot.session_count(),
        total_messages: snapshot.message_count,
    }
}

// ============================================================================
// Thread view
// ============================================================================

/// Ordered match positions plus the active one. Navigation wraps both ways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCursor {
    matches: Vec<usize>,
    active: usize,
}

impl SearchCursor {
    /// Positions of messages whose body contains `term`, ignoring case.
    pub fn new(messages: &[CanonicalMessage], term: &str) -> Self {
        let term = term.trim().to_lowercase();
        let matches = if term.is_empty() {
            Vec::new()
        } else {
            messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.message.to_lowercase().contains(&term))
                .map(|(i, _)| i)
                .collect()
        };
        Self { matches, active: 0 }
    }

    pub fn matches(&self) -> &[usize] {
        &self.matches
    }

    /// Select by index; out-of-range values wrap, negatives count from the end.
    pub fn select(&mut self, index: i64) {
        if let Ok(len) = i64::try_from(self.matches.len()) {
            if len > 0 {
                // rem_euclid on a positive len is in 0..len
                self.active = index.rem_euclid(len) as usize;
            }
        }
    }

    pub fn next(&mut self) {
        if !self.matches.is_empty() {
            self.active = (self.active + 1) % self.matches.len();
        }
    }

    pub fn prev(&mut self) {
        if !self.matches.is_empty() {
            self.active = (self.active + self.matches.len() - 1) % self.matches.len();
        }
    }

    pub fn active_index(&self) -> Option<usize> {
        (!self.matches.is_empty()).then_some(self.active)
    }

    /// Message position of the active match
    pub fn active_position(&self) -> Option<usize> {
        self.matches.get(self.active).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadItem {
    Separator {
        label: String,
        date: NaiveDate,
    },
    Message {
        position: usize,
        highlighted: bool,
        #[serde(flatten)]
        message: CanonicalMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Next,
    Prev,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreadQuery {
    #[serde(default)]
    pub q: Option<String>,
    /// Requested active match; wraps around the match list
    #[serde(default)]
    pub active: Option<i64>,
    /// Move one match from `active`
    #[serde(default)]
    pub step: Option<Step>,
}

#[derive(Debug, Serialize)]
pub struct ThreadView {
    pub summary: SessionSummary,
    pub items: Vec<ThreadItem>,
    pub matches: Vec<usize>,
    pub active_match: Option<usize>,
    pub scroll_to: Option<usize>,
    pub previous_session: Option<String>,
    pub next_session: Option<String>,
}

/// Build the thread for one session. `today` drives the separator labels.
pub fn thread_view(
    thread: &SessionThread,
    neighbors: (Option<&str>, Option<&str>),
    query: &ThreadQuery,
    today: NaiveDate,
) -> ThreadView {
    let mut cursor = SearchCursor::new(&thread.messages, query.q.as_deref().unwrap_or(""));
    cursor.select(query.active.unwrap_or(0));
    match query.step {
        Some(Step::Next) => cursor.next(),
        Some(Step::Prev) => cursor.prev(),
        None => {}
    }
    let matches = cursor.matches().to_vec();

    let mut items = Vec::with_capacity(thread.messages.len() + 4);
    let mut current_day: Option<NaiveDate> = None;
    for (position, message) in thread.messages.iter().enumerate() {
        if let Some(day) = message.instant().map(|dt| dt.date_naive()) {
            if current_day != Some(day) {
                items.push(ThreadItem::Separator {
                    label: day_label(day, today),
                    date: day,
                });
                current_day = Some(day);
            }
        }
        items.push(ThreadItem::Message {
            position,
            highlighted: matches.binary_search(&position).is_ok(),
            message: message.clone(),
        });
    }

    ThreadView {
        summary: thread.summary.clone(),
        items,
        active_match: cursor.active_index(),
        scroll_to: cursor.active_position(),
        matches,
        previous_session: neighbors.0.map(str::to_string),
        next_session: neighbors.1.map(str::to_string),
    }
}

pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        "Today".to_string()
    } else if Some(day) == today.checked_sub_signed(Duration::days(1)) {
        "Yesterday".to_string()
    } else {
        day.format("%d/%m/%Y").to_string()
    }
}
