//! Startup configuration from environment variables.

use crate::normalizer::UnknownAuthorPolicy;
use crate::remote::FetchRange;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

const DEFAULT_PORT: u16 = 4860;
const DEFAULT_TENANT: &str = "pucrs";
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Unset disables remote fetching; only uploads and imports remain
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub tenant: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub lookback_days: i64,
    pub unknown_author: UnknownAuthorPolicy,
    pub static_dir: PathBuf,
    pub import_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset; invalid ones
    /// fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let unknown_author = match get("VIEWER_UNKNOWN_AUTHOR") {
            None => UnknownAuthorPolicy::default(),
            Some(raw) => UnknownAuthorPolicy::parse(&raw).unwrap_or_else(|| {
                warn!("Ignoring VIEWER_UNKNOWN_AUTHOR={:?}, expected bot or reject", raw);
                UnknownAuthorPolicy::default()
            }),
        };

        Self {
            port: parsed(get("PORT"), "PORT", DEFAULT_PORT),
            endpoint: get("VIEWER_ENDPOINT_URL"),
            token: get("VIEWER_API_TOKEN"),
            tenant: get("VIEWER_TENANT").unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            start_date: get("VIEWER_START_DATE"),
            end_date: get("VIEWER_END_DATE"),
            lookback_days: parsed(get("VIEWER_LOOKBACK_DAYS"), "VIEWER_LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS)
                .max(1),
            unknown_author,
            static_dir: get("VIEWER_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("static")),
            import_dir: get("VIEWER_IMPORT_DIR").map(PathBuf::from),
        }
    }

    /// Range for the startup fetch: configured dates, else the lookback
    /// window ending at `now`.
    pub fn fetch_range(&self, now: DateTime<Utc>) -> FetchRange {
        let iso = |dt: DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::Millis, true);
        FetchRange {
            tenant: self.tenant.clone(),
            start_date: self
                .start_date
                .clone()
                .unwrap_or_else(|| iso(now - Duration::days(self.lookback_days))),
            end_date: self.end_date.clone().unwrap_or_else(|| iso(now)),
        }
    }
}

fn parsed<T: FromStr + std::fmt::Display>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring {}={:?}, using {}", key, raw, default);
            default
        }),
    }
}
