use std::collections::BTreeMap;

use quick_xml::events::Event;
use serde_json::json;

use super::archive::SafeArchive;
use super::xml::{attr, local_name, text, XmlEvents};
use crate::evidence::{FragmentDraft, FragmentType};
use crate::ingest::parser::{DocumentFormat, ParseError, ParseResult, Parser};

const DOCX_BODY: &str = "word/document.xml";
const VSDX_PAGES: &str = "visio/pages/";

/// Word documents and Visio drawings, both zip containers of XML parts.
pub struct OfficeParser {
    paragraphs_per_fragment: usize,
}

impl OfficeParser {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            paragraphs_per_fragment: 20,
        }
    }

    #[must_use]
    pub const fn with_paragraphs_per_fragment(mut self, count: usize) -> Self {
        self.paragraphs_per_fragment = if count == 0 { 1 } else { count };
        self
    }
}

impl Default for OfficeParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Parser for OfficeParser {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Docx, DocumentFormat::Vsdx]
    }

    async fn parse_bytes(
        &self,
        data: &[u8],
        format: DocumentFormat,
    ) -> ParseResult<Vec<FragmentDraft>> {
        match format {
            DocumentFormat::Docx => self.parse_docx(data),
            DocumentFormat::Vsdx => parse_vsdx(data),
            other => Err(ParseError::NoParserAvailable(other)),
        }
    }
}

impl OfficeParser {
    fn parse_docx(&self, data: &[u8]) -> ParseResult<Vec<FragmentDraft>> {
        let mut archive = SafeArchive::open(data)?;
        if !archive.contains(DOCX_BODY) {
            return Err(ParseError::Malformed(format!("missing {DOCX_BODY}")));
        }
        let body = archive.read_entry(DOCX_BODY)?;
        let paragraphs = docx_paragraphs(&body)?;

        let mut drafts = Vec::new();
        let mut section: Vec<String> = Vec::new();
        let mut first_paragraph = 0;
        for (index, paragraph) in paragraphs.into_iter().enumerate() {
            let blank = paragraph.trim().is_empty();
            if blank || section.len() >= self.paragraphs_per_fragment {
                flush_section(&mut drafts, &mut section, first_paragraph);
            }
            if blank {
                continue;
            }
            if section.is_empty() {
                first_paragraph = index;
            }
            section.push(paragraph.trim().to_string());
        }
        flush_section(&mut drafts, &mut section, first_paragraph);
        Ok(drafts)
    }
}

fn flush_section(drafts: &mut Vec<FragmentDraft>, section: &mut Vec<String>, first: usize) {
    if section.is_empty() {
        return;
    }
    let count = section.len();
    drafts.push(
        FragmentDraft::text(section.join("\n")).with_metadata(json!({
            "paragraph_start": first,
            "paragraph_count": count,
        })),
    );
    section.clear();
}

fn docx_paragraphs(body: &[u8]) -> ParseResult<Vec<String>> {
    let mut events = XmlEvents::new(body, false);
    let mut paragraphs = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;

    while let Some(event) = events.next()? {
        match event {
            Event::Start(e) => match local_name(&e).as_str() {
                "p" => current = Some(String::new()),
                "t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) => match local_name(&e).as_str() {
                "p" => paragraphs.push(String::new()),
                "tab" => {
                    if let Some(p) = current.as_mut() {
                        p.push('\t');
                    }
                }
                "br" => {
                    if let Some(p) = current.as_mut() {
                        p.push(' ');
                    }
                }
                _ => {}
            },
            Event::Text(t) if in_text => {
                if let Some(p) = current.as_mut() {
                    p.push_str(&text(&t)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(p) = current.take() {
                        paragraphs.push(p);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    Ok(paragraphs)
}

#[derive(Default)]
struct Shape {
    text: String,
    master: Option<String>,
}

#[derive(Default)]
struct Connector {
    begin: Option<String>,
    end: Option<String>,
}

fn parse_vsdx(data: &[u8]) -> ParseResult<Vec<FragmentDraft>> {
    let mut archive = SafeArchive::open(data)?;
    let mut pages: Vec<String> = archive
        .names()
        .iter()
        .filter(|n| {
            n.strip_prefix(VSDX_PAGES)
                .is_some_and(|rest| rest.starts_with("page") && rest.ends_with(".xml"))
        })
        .cloned()
        .collect();
    if pages.is_empty() {
        return Err(ParseError::Malformed("drawing has no pages".into()));
    }
    pages.sort();

    let mut drafts = Vec::new();
    for page in pages {
        let xml = archive.read_entry(&page)?;
        page_fragments(&page, &xml, &mut drafts)?;
    }
    Ok(drafts)
}

fn page_fragments(page: &str, xml: &[u8], drafts: &mut Vec<FragmentDraft>) -> ParseResult<()> {
    let mut events = XmlEvents::new(xml, true);
    let mut shapes: BTreeMap<String, Shape> = BTreeMap::new();
    let mut connectors: BTreeMap<String, Connector> = BTreeMap::new();
    let mut shape_stack: Vec<String> = Vec::new();
    let mut text_depth = 0usize;

    while let Some(event) = events.next()? {
        let (e, is_start) = match event {
            Event::Start(e) => (e, true),
            Event::Empty(e) => (e, false),
            Event::Text(t) if text_depth > 0 => {
                if let Some(shape) = shape_stack.last().and_then(|id| shapes.get_mut(id)) {
                    if !shape.text.is_empty() {
                        shape.text.push(' ');
                    }
                    shape.text.push_str(text(&t)?.trim());
                }
                continue;
            }
            Event::End(e) => {
                match e.local_name().as_ref() {
                    b"Text" => text_depth = text_depth.saturating_sub(1),
                    b"Shape" => {
                        shape_stack.pop();
                    }
                    _ => {}
                }
                continue;
            }
            _ => continue,
        };

        match local_name(&e).as_str() {
            "Shape" => {
                let id = attr(&e, b"ID")?.unwrap_or_default();
                let master = attr(&e, b"NameU")?.or(attr(&e, b"Name")?);
                shapes.entry(id.clone()).or_default().master = master;
                if is_start {
                    shape_stack.push(id);
                }
            }
            "Text" if is_start => text_depth += 1,
            "Connect" => {
                let Some(connector) = attr(&e, b"FromSheet")? else {
                    continue;
                };
                let target = attr(&e, b"ToSheet")?;
                let cell = attr(&e, b"FromCell")?.unwrap_or_default();
                let entry = connectors.entry(connector).or_default();
                match cell.as_str() {
                    "BeginX" => entry.begin = target,
                    "EndX" => entry.end = target,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let label = |id: &str| -> String {
        shapes
            .get(id)
            .filter(|s| !s.text.is_empty())
            .map_or_else(|| format!("shape {id}"), |s| s.text.clone())
    };

    for (id, shape) in &shapes {
        if shape.text.is_empty() || connectors.contains_key(id) {
            continue;
        }
        drafts.push(
            FragmentDraft::new(FragmentType::ProcessElement, shape.text.clone()).with_metadata(
                json!({
                    "element_type": "shape",
                    "element_id": id,
                    "master": shape.master,
                    "page": page,
                }),
            ),
        );
    }

    for (id, connector) in &connectors {
        let (Some(begin), Some(end)) = (&connector.begin, &connector.end) else {
            continue;
        };
        let content = match shapes.get(id).filter(|s| !s.text.is_empty()) {
            Some(shape) => format!("{} -> {} [{}]", label(begin), label(end), shape.text),
            None => format!("{} -> {}", label(begin), label(end)),
        };
        drafts.push(
            FragmentDraft::new(FragmentType::Relationship, content).with_metadata(json!({
                "element_type": "connector",
                "element_id": id,
                "source_ref": begin,
                "target_ref": end,
                "page": page,
            })),
        );
    }

    Ok(())
}
