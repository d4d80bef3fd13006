// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw payloads into message trees.
//!
//! JSON payloads may carry several messages, selected with `json_top_level`. CSV and RAW
//! payloads are read line by line; every line becomes one flat map of strings.

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::DecodeError;
use crate::path::FieldPath;

pub const DEFAULT_CSV_DELIMITER: &str = ",|\t";
/// Key holding the full matched line for RAW messages.
pub const RAW_LINE_KEY: &str = "_raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataFormat {
    #[default]
    Json,
    Csv,
    Raw,
}

/// Where individual messages live inside a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopLevel {
    /// The payload is the message, or a list of messages.
    Root,
    /// Messages are found at this path; a list there yields one message per element.
    Path(FieldPath),
}

impl From<&str> for TopLevel {
    fn from(setting: &str) -> Self {
        let setting = setting.trim();
        if setting.is_empty() || setting == "[]" {
            TopLevel::Root
        } else {
            TopLevel::Path(FieldPath::parse(setting))
        }
    }
}

#[derive(Debug, Clone)]
pub enum Decoder {
    Json {
        top_level: TopLevel,
    },
    Csv {
        field_names: Vec<String>,
        delimiter: Regex,
    },
    Raw {
        pattern: Regex,
    },
}

impl Decoder {
    #[must_use]
    pub fn json(top_level: TopLevel) -> Self {
        Decoder::Json { top_level }
    }

    #[must_use]
    pub fn csv(field_names: Vec<String>, delimiter: Regex) -> Self {
        Decoder::Csv {
            field_names,
            delimiter,
        }
    }

    #[must_use]
    pub fn raw(pattern: Regex) -> Self {
        Decoder::Raw { pattern }
    }

    /// Decodes one payload into zero or more messages.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<Value>, DecodeError> {
        match self {
            Decoder::Json { top_level } => {
                let value: Value = serde_json::from_slice(payload)?;
                Ok(split_top_level(value, top_level))
            }
            Decoder::Csv { .. } | Decoder::Raw { .. } => {
                let text = std::str::from_utf8(payload)?;
                self.decode_lines(text)
            }
        }
    }

    fn decode_lines(&self, text: &str) -> Result<Vec<Value>, DecodeError> {
        let mut messages = Vec::new();
        let mut last_error = None;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match self.decode_line(line) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => {
                    debug!("skipping line '{}': {}", line, e);
                    last_error = Some(e);
                }
            }
        }
        if messages.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
            if let Decoder::Csv { .. } = self {
                if text.trim().is_empty() {
                    return Err(DecodeError::CsvEmpty);
                }
            }
        }
        Ok(messages)
    }

    fn decode_line(&self, line: &str) -> Result<Option<Value>, DecodeError> {
        match self {
            Decoder::Csv {
                field_names,
                delimiter,
            } => {
                let cells: Vec<&str> = delimiter.split(line).map(str::trim).collect();
                if cells.iter().all(|c| c.is_empty()) {
                    return Err(DecodeError::CsvEmpty);
                }
                // a header row repeating the configured names carries no data
                if cells.len() == field_names.len()
                    && cells.iter().zip(field_names).all(|(c, n)| *c == n.as_str())
                {
                    return Ok(None);
                }
                if cells.len() != field_names.len() {
                    warn!(
                        "CSV row has {} cells but {} field names are configured",
                        cells.len(),
                        field_names.len()
                    );
                }
                let row: Map<String, Value> = field_names
                    .iter()
                    .zip(cells)
                    .map(|(name, cell)| (name.clone(), Value::String(cell.to_string())))
                    .collect();
                Ok(Some(Value::Object(row)))
            }
            Decoder::Raw { pattern } => {
                let caps = pattern
                    .captures(line)
                    .filter(|c| c.get(0).is_some_and(|m| m.start() == 0))
                    .ok_or(DecodeError::RawNoMatch)?;
                let mut row = Map::new();
                for name in pattern.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        row.insert(name.to_string(), Value::String(m.as_str().to_string()));
                    }
                }
                row.insert(RAW_LINE_KEY.to_string(), Value::String(line.to_string()));
                Ok(Some(Value::Object(row)))
            }
            Decoder::Json { .. } => Ok(Some(serde_json::from_str(line)?)),
        }
    }
}

fn split_top_level(value: Value, top_level: &TopLevel) -> Vec<Value> {
    let mut messages = Vec::new();
    match top_level {
        TopLevel::Root => match value {
            Value::Array(items) => messages.extend(items),
            other => messages.push(other),
        },
        TopLevel::Path(path) => select_subtrees(value, path.segments(), &mut messages),
    }
    messages
}

fn select_subtrees(value: Value, segments: &[String], out: &mut Vec<Value>) {
    match (segments.split_first(), value) {
        (None, Value::Array(items)) => out.extend(items),
        (None, other) => out.push(other),
        (Some(_), Value::Array(items)) => {
            for item in items {
                select_subtrees(item, segments, out);
            }
        }
        (Some((head, rest)), Value::Object(mut map)) => {
            if let Some(next) = map.remove(head) {
                select_subtrees(next, rest, out);
            } else {
                debug!("json_top_level segment '{}' not found", head);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn csv(names: &str) -> Decoder {
        Decoder::csv(
            names.split(',').map(String::from).collect(),
            Regex::new(DEFAULT_CSV_DELIMITER).unwrap(),
        )
    }

    #[test]
    fn test_json_single_and_list() {
        let d = Decoder::json(TopLevel::Root);
        assert_eq!(d.decode(br#"{"a":1}"#).unwrap(), vec![json!({"a": 1})]);
        assert_eq!(
            d.decode(br#"[{"a":1},{"a":2}]"#).unwrap(),
            vec![json!({"a": 1}), json!({"a": 2})]
        );
        assert!(matches!(d.decode(b"{nope"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_json_top_level_path() {
        let d = Decoder::json(TopLevel::from("body.records"));
        let payload = br#"{"body":{"records":[{"v":1},{"v":2}]},"meta":{}}"#;
        assert_eq!(
            d.decode(payload).unwrap(),
            vec![json!({"v": 1}), json!({"v": 2})]
        );
        assert!(d.decode(br#"{"other":1}"#).unwrap().is_empty());
    }

    #[test]
    fn test_top_level_setting() {
        assert_eq!(TopLevel::from(""), TopLevel::Root);
        assert_eq!(TopLevel::from("[]"), TopLevel::Root);
        assert_eq!(
            TopLevel::from("a.b"),
            TopLevel::Path(FieldPath::parse("a.b"))
        );
    }

    #[test]
    fn test_csv_row_is_labelled() {
        let d = csv("timestamp,cpu,mem");
        assert_eq!(
            d.decode(b"1700000000,10,20").unwrap(),
            vec![json!({"timestamp": "1700000000", "cpu": "10", "mem": "20"})]
        );
        assert_eq!(
            d.decode(b"1700000000\t10\t20").unwrap(),
            vec![json!({"timestamp": "1700000000", "cpu": "10", "mem": "20"})]
        );
    }

    #[test]
    fn test_csv_skips_header_and_reads_many_lines() {
        let d = csv("timestamp,cpu");
        let out = d.decode(b"timestamp,cpu\n1,2\n\n3,4\n").unwrap();
        assert_eq!(
            out,
            vec![
                json!({"timestamp": "1", "cpu": "2"}),
                json!({"timestamp": "3", "cpu": "4"})
            ]
        );
    }

    #[test]
    fn test_csv_empty_payload() {
        let d = csv("timestamp,cpu");
        assert!(matches!(d.decode(b"  \n"), Err(DecodeError::CsvEmpty)));
        assert!(matches!(d.decode(b",,"), Err(DecodeError::CsvEmpty)));
    }

    #[test]
    fn test_raw_named_groups() {
        let d = Decoder::raw(Regex::new(r"(?P<ts>\d+) (?P<host>\S+) cpu=(?P<cpu>\d+)").unwrap());
        assert_eq!(
            d.decode(b"1700000000 web-1 cpu=42").unwrap(),
            vec![json!({
                "ts": "1700000000",
                "host": "web-1",
                "cpu": "42",
                "_raw": "1700000000 web-1 cpu=42"
            })]
        );
        assert!(matches!(
            d.decode(b"garbage 1700000000 web-1 cpu=42"),
            Err(DecodeError::RawNoMatch)
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let d = csv("a");
        assert!(matches!(d.decode(&[0xff, 0xfe]), Err(DecodeError::Utf8(_))));
    }
}
