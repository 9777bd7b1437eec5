use serde_json::json;

use super::decode_utf8;
use crate::evidence::FragmentDraft;
use crate::ingest::parser::{DocumentFormat, ParseResult, Parser};

/// Plain text splits into paragraphs on blank lines; Markdown splits into
/// heading sections.
pub struct TextParser;

impl TextParser {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Parser for TextParser {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::PlainText, DocumentFormat::Markdown]
    }

    async fn parse_bytes(
        &self,
        data: &[u8],
        format: DocumentFormat,
    ) -> ParseResult<Vec<FragmentDraft>> {
        let text = decode_utf8(data)?;

        Ok(if format == DocumentFormat::Markdown {
            markdown_sections(text)
        } else {
            paragraphs(text)
        })
    }
}

fn paragraphs(text: &str) -> Vec<FragmentDraft> {
    let mut drafts = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if !current.is_empty() {
                let index = drafts.len();
                drafts.push(
                    FragmentDraft::text(current.join("\n")).with_metadata(json!({ "paragraph": index })),
                );
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }

    drafts
}

struct Section {
    title: Option<String>,
    level: u8,
    lines: Vec<String>,
}

impl Section {
    fn into_draft(self) -> Option<FragmentDraft> {
        let body = self.lines.join("\n").trim().to_string();
        let content = match (&self.title, body.is_empty()) {
            (Some(title), true) => title.clone(),
            (Some(title), false) => format!("{title}\n{body}"),
            (None, _) => body,
        };
        if content.is_empty() {
            return None;
        }
        Some(FragmentDraft::text(content).with_metadata(json!({
            "title": self.title,
            "level": self.level,
        })))
    }
}

fn markdown_sections(text: &str) -> Vec<FragmentDraft> {
    let mut drafts = Vec::new();
    let mut current = Section {
        title: None,
        level: 0,
        lines: Vec::new(),
    };

    for line in text.lines() {
        if let Some(level) = heading_level(line) {
            let title = line.trim_start().trim_start_matches('#').trim().to_string();
            let finished = std::mem::replace(
                &mut current,
                Section {
                    title: Some(title),
                    level,
                    lines: Vec::new(),
                },
            );
            drafts.extend(finished.into_draft());
        } else {
            current.lines.push(line.to_string());
        }
    }
    drafts.extend(current.into_draft());

    drafts
}

fn heading_level(line: &str) -> Option<u8> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&level) && trimmed[level..].starts_with(' ') {
        u8::try_from(level).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paragraphs_split_on_blank_lines() {
        let parser = TextParser::new();
        let data = b"Approve Invoice in the Finance System.\n\n\nApprove Invoice again.\r\n\r\nClose the books.";

        let drafts = parser
            .parse_bytes(data, DocumentFormat::PlainText)
            .await
            .unwrap();

        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].content, "Approve Invoice in the Finance System.");
        assert_eq!(drafts[2].metadata["paragraph"], 2);
    }

    #[tokio::test]
    async fn test_markdown_sections() {
        let parser = TextParser::new();
        let data = b"Intro line\n\n# Title\n\nBody\n\n## Sub\n\nMore\n#hashtag not heading";

        let drafts = parser
            .parse_bytes(data, DocumentFormat::Markdown)
            .await
            .unwrap();

        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].content, "Intro line");
        assert_eq!(drafts[1].content, "Title\nBody");
        assert_eq!(drafts[2].metadata["level"], 2);
        assert!(drafts[2].content.ends_with("#hashtag not heading"));
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let parser = TextParser::new();
        let result = parser
            .parse_bytes(&[0x66, 0xff, 0xfe], DocumentFormat::PlainText)
            .await;
        assert!(matches!(
            result,
            Err(crate::ingest::parser::ParseError::Encoding(_))
        ));
    }
}
