//! Extraction of the `##key=value` metadata lines from the VCF header.

use std::{collections::HashSet, io::BufRead};

use crate::common::truncate_with;

/// Prefix of metadata lines.
pub const METADATA_MARKER: &str = "##";

/// Descriptive tags are cut to this many characters.
pub const MAX_TAG_CHARS: usize = 20;
/// Descriptive values are cut to this many characters.
pub const MAX_VALUE_CHARS: usize = 95;
/// Appended to cut tags.
pub const TAG_ELLIPSIS: &str = "...";
/// Appended to cut values.
pub const VALUE_ELLIPSIS: &str = "...<truncated due to length>";

/// One metadata line from the header.
///
/// Descriptive entries (`source`, `reference`, ...) are truncated to bound
/// the size of the persisted table, so `tag` and `value` may be lossy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeaderMetadataEntry {
    /// The key left of the first `=`.
    pub tag: String,
    /// Everything right of the first `=`.
    pub value: String,
    /// Whether the tag is a structural declaration such as `INFO` or `FILTER`.
    pub is_structured: bool,
}

/// Structural declarations are conventionally written in upper case.
///
/// Mirrors "has at least one cased character and no lower case one".
pub fn is_structural_tag(tag: &str) -> bool {
    tag.chars().any(char::is_alphabetic) && !tag.chars().any(char::is_lowercase)
}

/// Parse one `##tag=value` line, `None` for anything else.
pub fn parse_metadata_line(line: &str) -> Option<HeaderMetadataEntry> {
    let rest = line.strip_prefix(METADATA_MARKER)?;
    let (tag, value) = rest.trim_end_matches(['\n', '\r']).split_once('=')?;
    let is_structured = is_structural_tag(tag);
    let (tag, value) = if is_structured {
        (tag.to_owned(), value.to_owned())
    } else {
        (
            truncate_with(tag, MAX_TAG_CHARS, TAG_ELLIPSIS),
            truncate_with(value, MAX_VALUE_CHARS, VALUE_ELLIPSIS),
        )
    };
    Some(HeaderMetadataEntry {
        tag,
        value,
        is_structured,
    })
}

/// Incrementally collects metadata entries, collapsing exact duplicates.
#[derive(Debug, Default)]
pub struct MetadataExtractor {
    entries: Vec<HeaderMetadataEntry>,
    seen: HashSet<HeaderMetadataEntry>,
    skipped: usize,
}

impl MetadataExtractor {
    /// Feed one line; returns `false` once the metadata block has ended.
    pub fn push_line(&mut self, line: &str) -> bool {
        if !line.starts_with(METADATA_MARKER) {
            return line.trim().is_empty();
        }
        match parse_metadata_line(line) {
            Some(entry) => {
                if self.seen.insert(entry.clone()) {
                    self.entries.push(entry);
                }
            }
            None => {
                tracing::debug!("skipping metadata line without '=': {:?}", line);
                self.skipped += 1;
            }
        }
        true
    }

    /// Return all entries in first-seen order.
    pub fn finish(self) -> Vec<HeaderMetadataEntry> {
        if self.skipped > 0 {
            tracing::debug!("skipped {} metadata lines without '='", self.skipped);
        }
        self.entries
    }
}

/// Read the metadata block from `reader`, stopping at the first other line.
pub fn extract_metadata<R: BufRead>(reader: R) -> Result<Vec<HeaderMetadataEntry>, std::io::Error> {
    let mut extractor = MetadataExtractor::default();
    for line in reader.lines() {
        if !extractor.push_line(&line?) {
            break;
        }
    }
    Ok(extractor.finish())
}

/// Only the descriptive entries, those that are shown and persisted.
pub fn descriptive(entries: &[HeaderMetadataEntry]) -> impl Iterator<Item = &HeaderMetadataEntry> {
    entries.iter().filter(|entry| !entry.is_structured)
}
