mod archive;
mod office;
mod process;
mod structured;
mod text;
mod xml;

pub use office::OfficeParser;
pub use process::ProcessModelParser;
pub use structured::StructuredParser;
pub use text::TextParser;

use super::parser::{ParseError, ParseResult};

pub(crate) fn decode_utf8(data: &[u8]) -> ParseResult<&str> {
    let body = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    std::str::from_utf8(body).map_err(|e| ParseError::Encoding(e.to_string()))
}
