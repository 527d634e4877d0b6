//! Load failures and their HTTP rendering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification the UI uses to pick a fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Timeout,
    Aborted,
    Upstream,
    Malformed,
    Unsupported,
    Validation,
    Empty,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not reach the transcript endpoint: {0}")]
    Connectivity(String),

    #[error("the transcript endpoint did not answer within {0:?}")]
    Timeout(Duration),

    #[error("the request was cancelled")]
    Aborted,

    #[error("the transcript endpoint returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("session `{session_id}` only carries summary fields (message count, preview); each session needs a nested `conversations` array with its messages")]
    SummaryOnly { session_id: String },

    #[error("unsupported file `{0}`: select a .xlsx or .json file")]
    UnsupportedFile(String),

    #[error("could not read spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("the spreadsheet is empty or has no data rows")]
    EmptyFile,

    #[error("missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("invalid value for 'author' on row {row}: '{value}'. Accepted values: 'cliente' or 'bot'")]
    InvalidAuthor { row: usize, value: String },

    #[error("row {row} has no value for '{column}'")]
    MissingValue { row: usize, column: &'static str },

    #[error("unrecognized author '{author}' in session `{session_id}`")]
    UnknownAuthor { session_id: String, author: String },

    #[error("no conversations found")]
    NoConversations,
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Aborted => ErrorKind::Aborted,
            Self::Upstream { .. } | Self::Request(_) => ErrorKind::Upstream,
            Self::Json(_) | Self::Malformed(_) | Self::Spreadsheet(_) => ErrorKind::Malformed,
            Self::SummaryOnly { .. } | Self::UnsupportedFile(_) => ErrorKind::Unsupported,
            Self::MissingColumns(_)
            | Self::InvalidAuthor { .. }
            | Self::MissingValue { .. }
            | Self::UnknownAuthor { .. } => ErrorKind::Validation,
            Self::EmptyFile | Self::NoConversations => ErrorKind::Empty,
        }
    }

    /// Failures where the remote source is unusable and manual upload is the way forward.
    pub fn offers_upload(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connectivity | ErrorKind::Timeout | ErrorKind::Aborted
        )
    }

    /// Message shown to the user, with the fallback spelled out where there is one.
    pub fn user_message(&self) -> String {
        if self.offers_upload() {
            format!("{}. Use the manual upload instead.", self)
        } else {
            self.to_string()
        }
    }

    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_connect() {
            Self::Connectivity(err.to_string())
        } else if err.is_decode() || err.is_body() {
            Self::Malformed(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Errors returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("no remote endpoint configured; upload a file instead")]
    RemoteDisabled,

    #[error("invalid request body: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            Self::Load(e) => {
                let status = match e.kind() {
                    ErrorKind::Connectivity | ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    ErrorKind::Aborted => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::Malformed
                    | ErrorKind::Unsupported
                    | ErrorKind::Validation
                    | ErrorKind::Empty => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, Some(e.kind()))
            }
            Self::SessionNotFound(_) => (StatusCode::NOT_FOUND, None),
            Self::RemoteDisabled => (StatusCode::CONFLICT, None),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
        };
        let error = match &self {
            Self::Load(e) => e.user_message(),
            other => other.to_string(),
        };
        (status, Json(ErrorBody { error, kind })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_columns_lists_names() {
        let err = LoadError::MissingColumns(vec!["author".into(), "message".into()]);
        assert_eq!(err.to_string(), "missing columns: author, message");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_upload_fallback_only_for_transport_failures() {
        assert!(LoadError::Timeout(Duration::from_secs(30)).offers_upload());
        assert!(LoadError::Connectivity("refused".into()).offers_upload());
        assert!(!LoadError::NoConversations.offers_upload());
        assert!(LoadError::Timeout(Duration::from_secs(30))
            .user_message()
            .ends_with("Use the manual upload instead."));
    }

    #[test]
    fn test_summary_only_message_names_conversations() {
        let err = LoadError::SummaryOnly { session_id: "S1".into() };
        assert!(err.to_string().contains("`conversations`"));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_api_error_status() {
        let resp = ApiError::from(LoadError::Timeout(Duration::from_secs(30))).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let resp = ApiError::SessionNotFound("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
