//! Client for the webhook-style transcript endpoint.
//!
//! One POST per request, no retries. The whole exchange (connect, send, read)
//! is bounded by a single deadline so a stalled body read cannot hang a load.

use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream error bodies are cut to this many chars before they reach the UI
const MAX_ERROR_BODY: usize = 300;

/// Tenant and inclusive date range sent with `searchAll`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRange {
    pub tenant: String,
    pub start_date: String,
    pub end_date: String,
}

impl FetchRange {
    fn request_body(&self) -> Value {
        json!({
            "action": "searchAll",
            "filter": [
                { "tenant": self.tenant },
                { "start_date": self.start_date },
                { "end_date": self.end_date },
            ]
        })
    }
}

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token,
            timeout: FETCH_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Every session in the range. Returns the raw payload; the normalizer
    /// deals with the envelope.
    pub async fn search_all(&self, range: &FetchRange) -> Result<Value, LoadError> {
        info!(
            "Fetching transcripts for tenant {} ({} to {})",
            range.tenant, range.start_date, range.end_date
        );
        self.post(range.request_body()).await
    }

    /// A single session by id.
    pub async fn search_session(&self, session_id: &str) -> Result<Value, LoadError> {
        debug!("Fetching session {}", session_id);
        self.post(json!({
            "action": "search",
            "filter": [{ "session_id": session_id }]
        }))
        .await
    }

    /// Equivalent shell command for reproducing a fetch by hand. The token is
    /// left as an environment variable reference.
    pub fn curl_command(&self, range: &FetchRange) -> String {
        let mut cmd = format!(
            "curl -X POST '{}' -H 'content-type: application/json'",
            self.endpoint
        );
        if self.token.is_some() {
            cmd.push_str(" -H \"x-authorization: $VIEWER_API_TOKEN\"");
        }
        cmd.push_str(&format!(" -d '{}'", range.request_body()));
        cmd
    }

    async fn post(&self, body: Value) -> Result<Value, LoadError> {
        let exchange = async {
            let mut request = self.http.post(&self.endpoint).json(&body);
            if let Some(token) = &self.token {
                request = request.header("x-authorization", token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| LoadError::from_reqwest(e, self.timeout))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| LoadError::from_reqwest(e, self.timeout))?;

            if !status.is_success() {
                return Err(LoadError::Upstream {
                    status: status.as_u16(),
                    body: text.chars().take(MAX_ERROR_BODY).collect(),
                });
            }
            serde_json::from_str::<Value>(&text)
                .map_err(|e| LoadError::Malformed(format!("response is not JSON ({e})")))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| LoadError::Timeout(self.timeout))?
    }
}
