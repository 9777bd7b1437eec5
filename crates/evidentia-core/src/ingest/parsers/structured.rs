use serde_json::{json, Value};

use super::decode_utf8;
use crate::evidence::{FragmentDraft, FragmentType};
use crate::ingest::parser::{DocumentFormat, ParseError, ParseResult, Parser};

const ROWS_PER_FRAGMENT: usize = 50;

/// CSV and JSON. Each produces a schema fragment followed by content
/// fragments; malformed structure fails the whole parse.
pub struct StructuredParser {
    rows_per_fragment: usize,
}

impl StructuredParser {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rows_per_fragment: ROWS_PER_FRAGMENT,
        }
    }

    #[must_use]
    pub fn with_rows_per_fragment(mut self, rows: usize) -> Self {
        self.rows_per_fragment = rows.max(1);
        self
    }

    fn parse_csv(&self, data: &[u8]) -> ParseResult<Vec<FragmentDraft>> {
        let text = decode_utf8(data)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| ParseError::Malformed(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.iter().all(String::is_empty) {
            return Err(ParseError::Malformed("CSV has no header row".into()));
        }

        let mut drafts = vec![schema_fragment(&headers, "csv")];
        let mut block: Vec<String> = Vec::new();
        let mut block_start = 0;

        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| ParseError::Malformed(e.to_string()))?;
            block.push(render_pairs(
                headers.iter().map(String::as_str).zip(record.iter()),
            ));

            if block.len() == self.rows_per_fragment {
                drafts.push(table_fragment(&block, block_start));
                block.clear();
                block_start = index + 1;
            }
        }
        if !block.is_empty() {
            drafts.push(table_fragment(&block, block_start));
        }

        Ok(drafts)
    }

    fn parse_json(data: &[u8]) -> ParseResult<Vec<FragmentDraft>> {
        let text = decode_utf8(data)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let mut drafts = Vec::new();
        match &value {
            Value::Array(items) => {
                let keys = items
                    .iter()
                    .find_map(Value::as_object)
                    .map(|obj| obj.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();
                if !keys.is_empty() {
                    drafts.push(schema_fragment(&keys, "json"));
                }
                for (index, item) in items.iter().enumerate() {
                    drafts.push(
                        FragmentDraft::new(FragmentType::Table, render_value(item))
                            .with_metadata(json!({ "index": index })),
                    );
                }
            }
            Value::Object(map) => {
                let keys: Vec<String> = map.keys().cloned().collect();
                drafts.push(schema_fragment(&keys, "json"));
                for (key, item) in map {
                    drafts.push(
                        FragmentDraft::text(format!("{key}: {}", render_value(item)))
                            .with_metadata(json!({ "key": key })),
                    );
                }
            }
            scalar => drafts.push(FragmentDraft::text(render_value(scalar))),
        }

        Ok(drafts)
    }
}

impl Default for StructuredParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Parser for StructuredParser {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Csv, DocumentFormat::Json]
    }

    async fn parse_bytes(
        &self,
        data: &[u8],
        format: DocumentFormat,
    ) -> ParseResult<Vec<FragmentDraft>> {
        match format {
            DocumentFormat::Csv => self.parse_csv(data),
            DocumentFormat::Json => Self::parse_json(data),
            other => Err(ParseError::NoParserAvailable(other)),
        }
    }
}

fn schema_fragment(columns: &[String], source: &str) -> FragmentDraft {
    FragmentDraft::new(FragmentType::Schema, format!("Columns: {}", columns.join(", ")))
        .with_metadata(json!({ "columns": columns, "source": source }))
}

fn table_fragment(rows: &[String], start: usize) -> FragmentDraft {
    FragmentDraft::new(FragmentType::Table, rows.join("\n")).with_metadata(json!({
        "row_start": start,
        "row_count": rows.len(),
    }))
}

fn render_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}: {}", render_value(v)))
            .collect::<Vec<_>>()
            .join(" | "),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}
