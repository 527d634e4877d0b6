//! Manual file ingestion. Files arrive fully buffered; the extension picks the
//! decoder.

use crate::diagnostics::DiagnosticSink;
use crate::error::LoadError;
use crate::normalizer::{normalize_json, UnknownAuthorPolicy};
use crate::sessions::CanonicalMessage;
use crate::spreadsheet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Xlsx,
    Json,
}

impl FileKind {
    /// Case-insensitive on the extension; anything else is unsupported.
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "xlsx" => Some(Self::Xlsx),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Decode an uploaded file into canonical messages.
pub fn parse_file(
    name: &str,
    bytes: &[u8],
    policy: UnknownAuthorPolicy,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<CanonicalMessage>, LoadError> {
    let kind = FileKind::from_name(name).ok_or_else(|| LoadError::UnsupportedFile(name.to_string()))?;

    match kind {
        FileKind::Json => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| LoadError::Malformed(format!("file is not UTF-8 text ({e})")))?;
            // editors on Windows like to prepend a BOM
            let text = text.strip_prefix('\u{feff}').unwrap_or(text);
            normalize_json(text, policy, sink)
        }
        FileKind::Xlsx => {
            let messages = spreadsheet::read_xlsx(bytes)?;
            if messages.is_empty() {
                return Err(LoadError::NoConversations);
            }
            Ok(messages)
        }
    }
}
