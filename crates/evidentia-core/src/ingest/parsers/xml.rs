use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use crate::ingest::parser::{ParseError, ParseResult};

/// Pull reader over an in-memory XML document that refuses DTDs and
/// reports unbalanced documents as malformed.
///
/// Entity references other than the five predefined ones fail to
/// unescape, so no entity is ever expanded.
pub(crate) struct XmlEvents<'a> {
    reader: Reader<&'a [u8]>,
    depth: usize,
}

impl<'a> XmlEvents<'a> {
    pub(crate) fn new(data: &'a [u8], trim_text: bool) -> Self {
        let mut reader = Reader::from_reader(data);
        reader.trim_text(trim_text);
        Self { reader, depth: 0 }
    }

    /// Next event, or `None` at a well-formed end of document.
    pub(crate) fn next(&mut self) -> ParseResult<Option<Event<'a>>> {
        let event = self.reader.read_event().map_err(|e| {
            ParseError::Malformed(format!(
                "XML error at byte {}: {e}",
                self.reader.buffer_position()
            ))
        })?;

        match &event {
            Event::DocType(_) => {
                return Err(ParseError::UnsafeContent(
                    "DOCTYPE declarations are not accepted".into(),
                ))
            }
            Event::Start(_) => self.depth += 1,
            Event::End(_) => self.depth = self.depth.saturating_sub(1),
            Event::Eof if self.depth > 0 => {
                return Err(ParseError::Malformed(
                    "document ended before all elements were closed".into(),
                ))
            }
            Event::Eof => return Ok(None),
            _ => {}
        }

        Ok(Some(event))
    }
}

/// Value of the attribute whose local name is `name`.
pub(crate) fn attr(element: &BytesStart<'_>, name: &[u8]) -> ParseResult<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|e| ParseError::Malformed(e.to_string()))?;
        if attribute.key.local_name().as_ref() == name {
            let value = attribute
                .unescape_value()
                .map_err(|e| ParseError::Malformed(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

pub(crate) fn text(event: &BytesText<'_>) -> ParseResult<String> {
    event
        .unescape()
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| ParseError::Malformed(e.to_string()))
}

pub(crate) fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}
