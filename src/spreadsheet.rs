//! `.xlsx` ingestion. Reads the first worksheet: a header row, then one
//! message per row.
//!
//! Stricter than the JSON shapes: the author column only accepts `cliente`
//! or `bot` (any case), and anything else fails the whole file.

use crate::error::LoadError;
use crate::sessions::{AuthorRole, CanonicalMessage};
use calamine::{Data, Reader, Xlsx};
use chrono::SecondsFormat;
use std::io::Cursor;

/// Header names that must be present, in lookup order
pub const REQUIRED_COLUMNS: [&str; 4] = ["session_id", "timestamp", "author", "message"];
const EXECUTION_COLUMN: &str = "execution_id";

/// Decode an `.xlsx` workbook held in memory.
pub fn read_xlsx(bytes: &[u8]) -> Result<Vec<CanonicalMessage>, LoadError> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes)).map_err(|e| LoadError::Spreadsheet(e.to_string()))?;

    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Err(LoadError::EmptyFile);
    };
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| LoadError::Spreadsheet(e.to_string()))?;

    let rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();
    decode_rows(&rows)
}

/// Decode header + data rows. Row numbers in errors are 1-based with the
/// header as row 1, matching what a spreadsheet application shows.
pub fn decode_rows(rows: &[Vec<String>]) -> Result<Vec<CanonicalMessage>, LoadError> {
    let [header, data @ ..] = rows else {
        return Err(LoadError::EmptyFile);
    };
    if data.is_empty() {
        return Err(LoadError::EmptyFile);
    }

    let header: Vec<&str> = header.iter().map(|h| h.trim()).collect();
    let column = |name: &str| header.iter().position(|h| *h == name);

    let mut positions = [0usize; REQUIRED_COLUMNS.len()];
    let mut missing = Vec::new();
    for (slot, name) in REQUIRED_COLUMNS.iter().enumerate() {
        match column(name) {
            Some(i) => positions[slot] = i,
            None => missing.push(name.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(LoadError::MissingColumns(missing));
    }
    let [session_col, timestamp_col, author_col, message_col] = positions;
    let execution_col = column(EXECUTION_COLUMN);

    let mut messages = Vec::new();
    for (offset, row) in data.iter().enumerate() {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let row_number = offset + 2;
        let cell = |i: usize| row.get(i).map(|c| c.trim()).unwrap_or("");

        let raw_author = cell(author_col);
        let author = match raw_author.to_lowercase().as_str() {
            "cliente" => AuthorRole::Customer,
            "bot" => AuthorRole::Bot,
            _ => {
                return Err(LoadError::InvalidAuthor {
                    row: row_number,
                    value: raw_author.to_string(),
                })
            }
        };

        let body = cell(message_col);
        if body.is_empty() {
            continue;
        }

        let session_id = cell(session_col);
        if session_id.is_empty() {
            return Err(LoadError::MissingValue {
                row: row_number,
                column: "session_id",
            });
        }
        let execution_id = execution_col
            .map(cell)
            .filter(|e| !e.is_empty())
            .unwrap_or(session_id);

        messages.push(CanonicalMessage {
            session_id: session_id.to_string(),
            execution_id: Some(execution_id.to_string()),
            timestamp: cell(timestamp_col).to_string(),
            author,
            message: body.to_string(),
            contact: None,
            first_message_text: None,
        });
    }

    Ok(messages)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|naive| naive.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| dt.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Collector;
    use crate::error::ErrorKind;
    use crate::normalizer::{normalize_json, UnknownAuthorPolicy};

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    const HEADER: &[&str] = &["session_id", "execution_id", "timestamp", "author", "message"];

    #[test]
    fn test_matches_grouped_json() {
        let sheet = rows(&[
            HEADER,
            &["S1", "", "2025-10-20T10:00:00Z", "cliente", "Oi"],
            &["S1", "", "2025-10-20T10:00:05Z", "BOT", "Olá! Como posso ajudar?"],
            &["S1", "", "2025-10-20T10:01:00Z", "Cliente", "Quero saber do curso"],
        ]);
        let json = r#"[{"session_id":"S1","conversations":[
            {"author":"customer","message":"Oi","timestamp":"2025-10-20T10:00:00Z"},
            {"author":"bot","message":"Olá! Como posso ajudar?","timestamp":"2025-10-20T10:00:05Z"},
            {"author":"customer","message":"Quero saber do curso","timestamp":"2025-10-20T10:01:00Z"}]}]"#;

        let from_sheet = decode_rows(&sheet).unwrap();
        let from_json = normalize_json(json, UnknownAuthorPolicy::Bot, &Collector::new()).unwrap();
        assert_eq!(from_sheet, from_json);
    }

    const MAIN_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
    const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

    /// Minimal two-sheet workbook. Style 1 is the built-in `m/d/yy h:mm`
    /// date format; session ids are stored as plain numbers.
    fn workbook() -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let strings = ["session_id", "timestamp", "author", "message", "cliente", "Oi", "bot", "Olá!", "scratch"];
        let shared: String = strings.iter().map(|s| format!("<si><t>{s}</t></si>")).collect();
        let parts = [
            (
                "xl/workbook.xml",
                format!(
                    r#"<workbook xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><sheets><sheet name="Transcripts" sheetId="1" r:id="rId1"/><sheet name="Notes" sheetId="2" r:id="rId2"/></sheets></workbook>"#
                ),
            ),
            (
                "xl/_rels/workbook.xml.rels",
                format!(
                    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{REL_NS}/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="{REL_NS}/worksheet" Target="worksheets/sheet2.xml"/></Relationships>"#
                ),
            ),
            (
                "xl/styles.xml",
                format!(r#"<styleSheet xmlns="{MAIN_NS}"><cellXfs count="2"><xf numFmtId="0"/><xf numFmtId="22"/></cellXfs></styleSheet>"#),
            ),
            (
                "xl/sharedStrings.xml",
                format!(r#"<sst xmlns="{MAIN_NS}" count="{0}" uniqueCount="{0}">{shared}</sst>"#, strings.len()),
            ),
            (
                "xl/worksheets/sheet1.xml",
                format!(
                    r#"<worksheet xmlns="{MAIN_NS}"><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c><c r="C1" t="s"><v>2</v></c><c r="D1" t="s"><v>3</v></c></row><row r="2"><c r="A2"><v>1001</v></c><c r="B2" s="1"><v>45950.5</v></c><c r="C2" t="s"><v>4</v></c><c r="D2" t="s"><v>5</v></c></row><row r="3"><c r="A3"><v>1001</v></c><c r="B3" s="1"><v>45950.75</v></c><c r="C3" t="s"><v>6</v></c><c r="D3" t="s"><v>7</v></c></row></sheetData></worksheet>"#
                ),
            ),
            (
                "xl/worksheets/sheet2.xml",
                format!(r#"<worksheet xmlns="{MAIN_NS}"><sheetData><row r="1"><c r="A1" t="s"><v>8</v></c></row></sheetData></worksheet>"#),
            ),
        ];

        let mut archive = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in parts {
            archive.start_file(name, SimpleFileOptions::default()).unwrap();
            archive.write_all(body.as_bytes()).unwrap();
        }
        archive.finish().unwrap().into_inner()
    }

    #[test]
    fn test_real_workbook_first_sheet_numbers_and_dates() {
        let from_sheet = read_xlsx(&workbook()).unwrap();
        assert_eq!(from_sheet.len(), 2);
        assert_eq!(from_sheet[0].session_id, "1001");
        assert_eq!(from_sheet[0].execution_id.as_deref(), Some("1001"));
        assert_eq!(from_sheet[0].timestamp, "2025-10-20T12:00:00.000Z");
        assert_eq!(from_sheet[1].timestamp, "2025-10-20T18:00:00.000Z");
        assert_eq!(from_sheet[1].author, AuthorRole::Bot);

        let json = r#"[{"session_id":1001,"conversations":[
            {"author":"cliente","message":"Oi","timestamp":"2025-10-20T12:00:00Z"},
            {"author":"bot","message":"Olá!","timestamp":"2025-10-20T18:00:00Z"}]}]"#;
        let from_json = normalize_json(json, UnknownAuthorPolicy::Bot, &Collector::new()).unwrap();
        assert_eq!(from_sheet.len(), from_json.len());
        for (sheet, grouped) in from_sheet.iter().zip(&from_json) {
            assert_eq!(sheet.instant(), grouped.instant());
            let respelled = CanonicalMessage { timestamp: grouped.timestamp.clone(), ..sheet.clone() };
            assert_eq!(&respelled, grouped);
        }
    }

    #[test]
    fn test_missing_author_column() {
        let sheet = rows(&[
            &["session_id", "timestamp", "message"],
            &["S1", "2025-10-20T10:00:00Z", "Oi"],
        ]);
        match decode_rows(&sheet).unwrap_err() {
            LoadError::MissingColumns(cols) => assert_eq!(cols, vec!["author".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_all_missing_columns_listed() {
        let sheet = rows(&[&["foo"], &["bar"]]);
        let err = decode_rows(&sheet).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing columns: session_id, timestamp, author, message"
        );
    }

    #[test]
    fn test_invalid_author_is_fatal() {
        let sheet = rows(&[
            HEADER,
            &["S1", "E1", "2025-10-20T10:00:00Z", "cliente", "Oi"],
            &["S1", "E1", "2025-10-20T10:00:01Z", "robot", "beep"],
        ]);
        let err = decode_rows(&sheet).unwrap_err();
        match &err {
            LoadError::InvalidAuthor { row, value } => {
                assert_eq!(*row, 3);
                assert_eq!(value, "robot");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_json_aliases_not_accepted_in_sheet() {
        let sheet = rows(&[HEADER, &["S1", "", "2025-10-20T10:00:00Z", "customer", "Oi"]]);
        assert!(matches!(
            decode_rows(&sheet),
            Err(LoadError::InvalidAuthor { row: 2, .. })
        ));
    }

    #[test]
    fn test_blank_rows_and_messages_skipped() {
        let sheet = rows(&[
            HEADER,
            &["", "", "", "", ""],
            &["S1", "E1", "2025-10-20T10:00:00Z", "bot", "   "],
            &["S1", "E1", "2025-10-20T10:00:01Z", "bot", "kept"],
        ]);
        let messages = decode_rows(&sheet).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message, "kept");
        assert_eq!(messages[0].execution_id.as_deref(), Some("E1"));
    }

    #[test]
    fn test_short_rows_and_missing_session() {
        let sheet = rows(&[HEADER, &["", "", "2025-10-20T10:00:00Z", "bot", "hi"]]);
        assert!(matches!(
            decode_rows(&sheet),
            Err(LoadError::MissingValue { row: 2, column: "session_id" })
        ));

        // a row shorter than the header reads absent cells as blank
        let sheet = rows(&[HEADER, &["S1", "", "2025-10-20T10:00:00Z", "bot"]]);
        assert!(decode_rows(&sheet).unwrap().is_empty());
    }

    #[test]
    fn test_header_only_is_empty_file() {
        assert!(matches!(decode_rows(&rows(&[HEADER])), Err(LoadError::EmptyFile)));
        assert!(matches!(decode_rows(&[]), Err(LoadError::EmptyFile)));
    }

    #[test]
    fn test_garbage_bytes() {
        let err = read_xlsx(b"definitely not a zip archive").unwrap_err();
        assert!(matches!(err, LoadError::Spreadsheet(_)));
    }
}
