use std::io::{Cursor, Read};
use std::path::{Component, Path};

use zip::ZipArchive;

use crate::ingest::parser::{ParseError, ParseResult};

/// Uncompressed bytes allowed across all entries of one archive.
pub(crate) const MAX_UNPACKED_BYTES: u64 = 256 * 1024 * 1024;
pub(crate) const MAX_ENTRIES: usize = 10_000;

const LOCAL_HEADER_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const LOCAL_HEADER_LEN: usize = 30;

/// Zip container opened only after every entry name and the declared
/// sizes have been checked.
pub(crate) struct SafeArchive<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    names: Vec<String>,
}

impl<'a> SafeArchive<'a> {
    pub(crate) fn open(data: &'a [u8]) -> ParseResult<Self> {
        let mut archive = ZipArchive::new(Cursor::new(data))
            .map_err(|e| ParseError::Malformed(format!("invalid archive: {e}")))?;

        if archive.len() > MAX_ENTRIES {
            return Err(ParseError::LimitExceeded(format!(
                "archive has {} entries, limit is {MAX_ENTRIES}",
                archive.len()
            )));
        }

        let mut names = Vec::with_capacity(archive.len());
        let mut total: u64 = 0;
        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|e| ParseError::Malformed(format!("invalid archive entry: {e}")))?;
            let name = entry.name().to_string();
            if entry.enclosed_name().is_none() || !is_safe_name(&name) {
                return Err(ParseError::UnsafeContent(format!(
                    "archive entry escapes its root: {name:?}"
                )));
            }
            if local_name(data, entry.header_start()) != Some(entry.name_raw()) {
                return Err(ParseError::UnsafeContent(format!(
                    "archive entry {name:?} has a different name in its local header"
                )));
            }
            total = total.saturating_add(entry.size());
            if total > MAX_UNPACKED_BYTES {
                return Err(ParseError::LimitExceeded(format!(
                    "archive expands beyond {MAX_UNPACKED_BYTES} bytes"
                )));
            }
            names.push(name);
        }

        Ok(Self { archive, names })
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Reads a whole entry, stopping at its declared size so a lying
    /// header cannot inflate past the archive limit.
    pub(crate) fn read_entry(&mut self, name: &str) -> ParseResult<Vec<u8>> {
        let entry = self
            .archive
            .by_name(name)
            .map_err(|e| ParseError::Malformed(format!("missing archive entry {name}: {e}")))?;

        let declared = entry.size();
        let mut buf = Vec::with_capacity(usize::try_from(declared).unwrap_or(0).min(1 << 20));
        entry
            .take(declared.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| ParseError::Malformed(format!("cannot read {name}: {e}")))?;
        if buf.len() as u64 > declared {
            return Err(ParseError::LimitExceeded(format!(
                "entry {name} is larger than declared"
            )));
        }
        Ok(buf)
    }
}

/// File name recorded in the local header at `offset`, the name an
/// extractor streaming the archive would see.
fn local_name(data: &[u8], offset: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let header = data.get(start..start.checked_add(LOCAL_HEADER_LEN)?)?;
    if header[..4] != LOCAL_HEADER_SIGNATURE {
        return None;
    }
    let len = usize::from(u16::from_le_bytes([header[26], header[27]]));
    let name_start = start + LOCAL_HEADER_LEN;
    data.get(name_start..name_start.checked_add(len)?)
}

fn is_safe_name(name: &str) -> bool {
    if name.is_empty() || name.contains('\\') || name.contains('\0') || name.contains(':') {
        return false;
    }
    if name.starts_with('/') {
        return false;
    }
    let trimmed = name.strip_suffix('/').unwrap_or(name);
    if trimmed.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return false;
    }
    Path::new(trimmed)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}
