use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::parsers::{OfficeParser, ProcessModelParser, StructuredParser, TextParser};
use crate::evidence::FragmentDraft;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No parser available for {0}")]
    NoParserAvailable(DocumentFormat),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Malformed content: {0}")]
    Malformed(String),
    #[error("Unsafe content: {0}")]
    UnsafeContent(String),
    #[error("Content exceeds parser limits: {0}")]
    LimitExceeded(String),
    #[error("Document produced no content")]
    NoContent,
}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Csv,
    Json,
    Bpmn,
    Xes,
    Vsdx,
    Docx,
}

impl DocumentFormat {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "plain_text",
            Self::Markdown => "markdown",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Bpmn => "bpmn",
            Self::Xes => "xes",
            Self::Vsdx => "vsdx",
            Self::Docx => "docx",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "text" => Some(Self::PlainText),
            "md" | "markdown" => Some(Self::Markdown),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "bpmn" | "bpmn2" => Some(Self::Bpmn),
            "xes" => Some(Self::Xes),
            "vsdx" => Some(Self::Vsdx),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "text/plain" => Some(Self::PlainText),
            "text/markdown" => Some(Self::Markdown),
            "text/csv" => Some(Self::Csv),
            "application/json" => Some(Self::Json),
            "application/bpmn+xml" => Some(Self::Bpmn),
            "application/xes+xml" => Some(Self::Xes),
            "application/vnd.ms-visio.drawing.main+xml" | "application/vnd.ms-visio.drawing" => {
                Some(Self::Vsdx)
            }
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            _ => None,
        }
    }

    /// Format named by the upload metadata, content type first.
    pub fn declared(file_name: &str, content_type: Option<&str>) -> Option<Self> {
        content_type.and_then(Self::from_mime).or_else(|| {
            std::path::Path::new(file_name)
                .extension()
                .and_then(|e| e.to_str())
                .and_then(Self::from_extension)
        })
    }

    #[must_use]
    pub const fn is_archive(&self) -> bool {
        matches!(self, Self::Vsdx | Self::Docx)
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain_text" => Ok(Self::PlainText),
            "markdown" => Ok(Self::Markdown),
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "bpmn" => Ok(Self::Bpmn),
            "xes" => Ok(Self::Xes),
            "vsdx" => Ok(Self::Vsdx),
            "docx" => Ok(Self::Docx),
            _ => Err(crate::Error::invalid("document format", s)),
        }
    }
}

/// Turns raw bytes into ordered fragment drafts. Implementations are pure:
/// no access to any store.
#[async_trait::async_trait]
pub trait Parser: Send + Sync {
    fn supported_formats(&self) -> &[DocumentFormat];

    fn can_parse(&self, format: DocumentFormat) -> bool {
        self.supported_formats().contains(&format)
    }

    async fn parse_bytes(&self, data: &[u8], format: DocumentFormat)
        -> ParseResult<Vec<FragmentDraft>>;
}

/// Capability table from format to parser.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<DocumentFormat, Arc<dyn Parser>>,
}

impl ParserRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registers `parser` for every format it supports, replacing any
    /// previous entry for those formats.
    pub fn register(&mut self, parser: Arc<dyn Parser>) {
        for format in parser.supported_formats() {
            self.parsers.insert(*format, Arc::clone(&parser));
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.register(parser);
        self
    }

    pub fn parser_for(&self, format: DocumentFormat) -> ParseResult<Arc<dyn Parser>> {
        self.parsers
            .get(&format)
            .cloned()
            .ok_or(ParseError::NoParserAvailable(format))
    }

    pub fn formats(&self) -> Vec<DocumentFormat> {
        let mut formats: Vec<_> = self.parsers.keys().copied().collect();
        formats.sort();
        formats
    }

    /// Parses `data`, treating an empty result as a failure.
    pub async fn parse(
        &self,
        data: &[u8],
        format: DocumentFormat,
    ) -> ParseResult<Vec<FragmentDraft>> {
        let parser = self.parser_for(format)?;
        let drafts = parser.parse_bytes(data, format).await?;

        if drafts.iter().all(|d| d.content.trim().is_empty()) {
            return Err(ParseError::NoContent);
        }

        Ok(drafts
            .into_iter()
            .filter(|d| !d.content.trim().is_empty())
            .collect())
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
            .with_parser(Arc::new(TextParser::new()))
            .with_parser(Arc::new(StructuredParser::new()))
            .with_parser(Arc::new(ProcessModelParser::new()))
            .with_parser(Arc::new(OfficeParser::new()))
    }
}
