use super::parser::DocumentFormat;

/// Leading bytes inspected to classify an upload.
pub const SNIFF_WINDOW: usize = 8 * 1024;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const BPMN_NAMESPACE: &str = "http://www.omg.org/spec/BPMN/20100524/MODEL";
const XES_NAMESPACE: &str = "http://www.xes-standard.org";

/// Classifies content by its leading bytes. The declared format only
/// chooses between formats the content is already compatible with; it
/// never admits content on its own. Returns a rejection reason on failure.
pub fn detect_format(
    window: &[u8],
    declared: Option<DocumentFormat>,
) -> Result<DocumentFormat, String> {
    let window = &window[..window.len().min(SNIFF_WINDOW)];

    if window.starts_with(ZIP_MAGIC) {
        return match declared {
            Some(format) if format.is_archive() => Ok(format),
            _ => Err("zip container is only accepted as .vsdx or .docx".into()),
        };
    }

    let text = sniff_text(window).ok_or_else(|| "binary content is not supported".to_string())?;
    let trimmed = text.trim_start();

    if trimmed.starts_with('<') {
        if let Some(format) = detect_xml(trimmed, declared) {
            return Ok(format);
        }
        // Markup inside notes or a README stays text when declared as such.
        return match declared {
            Some(format @ (DocumentFormat::PlainText | DocumentFormat::Markdown)) => Ok(format),
            _ => Err("XML content is neither BPMN 2.0 nor XES".into()),
        };
    }

    match declared {
        Some(format @ (DocumentFormat::Csv | DocumentFormat::Markdown | DocumentFormat::Json)) => {
            Ok(format)
        }
        Some(DocumentFormat::PlainText) => Ok(DocumentFormat::PlainText),
        Some(other) => Err(format!("content is plain text but was declared as {other}")),
        None if trimmed.starts_with('{') || trimmed.starts_with('[') => Ok(DocumentFormat::Json),
        None => Ok(DocumentFormat::PlainText),
    }
}

fn detect_xml(text: &str, declared: Option<DocumentFormat>) -> Option<DocumentFormat> {
    if text.contains(BPMN_NAMESPACE) {
        return Some(DocumentFormat::Bpmn);
    }

    let looks_like_xes = text.contains(XES_NAMESPACE) || text.contains("xes.version");
    if looks_like_xes || (declared == Some(DocumentFormat::Xes) && text.contains("<log")) {
        return Some(DocumentFormat::Xes);
    }

    None
}

/// Returns the window as text when it is UTF-8 without NUL bytes. A
/// multi-byte sequence cut off by the window edge is tolerated.
fn sniff_text(window: &[u8]) -> Option<&str> {
    let body = window.strip_prefix(UTF8_BOM).unwrap_or(window);
    if body.contains(&0) {
        return None;
    }

    match std::str::from_utf8(body) {
        Ok(text) => Some(text),
        Err(e) if e.error_len().is_none() && window.len() == SNIFF_WINDOW => {
            std::str::from_utf8(&body[..e.valid_up_to()]).ok()
        }
        Err(_) => None,
    }
}
