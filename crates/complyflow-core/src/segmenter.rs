//! Content Segmenter: splits raw document text into ordered content units.
//!
//! Two modes are supported:
//! - `chunk`: paragraph-aligned chunks packed up to a character budget
//! - `line`: one unit per non-blank line, used by deep analysis
//!
//! Segmentation is deterministic. Unit ids are UUIDv5 digests of
//! mode, ordinal, position and text, so location strings survive a resume.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::ConfigError;

lazy_static! {
    static ref PARAGRAPH_BREAK: Regex = Regex::new(r"\n[ \t\r]*\n").unwrap();
    /// Terminal punctuation, optional closing quotes or brackets, then whitespace.
    static ref SENTENCE_END: Regex = Regex::new(r#"[.!?]["')\]]*\s"#).unwrap();
}

/// Namespace for deterministic unit ids.
const UNIT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_3d2a_94b8_4e0f_a1c7_52e9_0b7d_c43e);

/// Errors that can occur while segmenting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Invalid segmenter configuration: {0}")]
    InvalidConfig(String),

    #[error("Document too large: {chars} characters exceeds limit of {limit}")]
    DocumentTooLarge { chars: usize, limit: usize },
}

/// How a document is cut into units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentMode {
    #[default]
    Chunk,
    Line,
}

impl SegmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentMode::Chunk => "chunk",
            SegmentMode::Line => "line",
        }
    }
}

impl fmt::Display for SegmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a unit sits in its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMetadata {
    /// Character (not byte) offset of the unit's first character within its page or document.
    pub char_offset: usize,

    /// Length of the unit in characters.
    pub char_len: usize,

    /// 1-based page number, when the source was paginated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,

    /// 1-based line number, in line mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
}

/// An analyzable segment of a document. Never mutated after segmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: String,
    pub ordinal_index: usize,
    pub text: String,
    pub position: PositionMetadata,
    pub kind: SegmentMode,
}

impl ContentUnit {
    /// Stable location string used on violations.
    ///
    /// - `chunk:<id>:page:<n>` for paginated chunks
    /// - `chunk:<id>:offset:<o>` otherwise
    /// - `line:<id>:line:<n>` in line mode
    pub fn location(&self) -> String {
        match self.kind {
            SegmentMode::Chunk => match self.position.page_number {
                Some(page) => format!("chunk:{}:page:{}", self.id, page),
                None => format!("chunk:{}:offset:{}", self.id, self.position.char_offset),
            },
            SegmentMode::Line => format!(
                "line:{}:line:{}",
                self.id,
                self.position.line_number.unwrap_or(self.ordinal_index + 1)
            ),
        }
    }

    /// First `max_chars` characters of the text, for logs and ledger previews.
    pub fn preview(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}

/// Segmenter limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Upper bound on a chunk's length in characters.
    pub max_chunk_chars: usize,

    /// Documents longer than this are rejected. `None` disables the check.
    pub max_document_chars: Option<usize>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1500,
            max_document_chars: Some(2_000_000),
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_chars == 0 {
            return Err(ConfigError::invalid(
                "segmenter.max_chunk_chars",
                "must be greater than zero",
            ));
        }
        if self.max_document_chars == Some(0) {
            return Err(ConfigError::invalid(
                "segmenter.max_document_chars",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }
}

/// Splits documents into [`ContentUnit`]s.
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            config: SegmenterConfig::default(),
        }
    }
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Result<Self, SegmentError> {
        config
            .validate()
            .map_err(|e| SegmentError::InvalidConfig(e.to_string()))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segment an unpaginated document.
    ///
    /// An empty or whitespace-only document yields an empty list.
    pub fn segment(&self, text: &str, mode: SegmentMode) -> Result<Vec<ContentUnit>, SegmentError> {
        self.check_size(text.chars().count())?;
        let mut units = Vec::new();
        self.segment_into(text, mode, None, &mut units);
        tracing::debug!(mode = %mode, units = units.len(), "Segmented document");
        Ok(units)
    }

    /// Segment a paginated document. Ordinals run across pages; offsets are page-relative.
    pub fn segment_pages<S: AsRef<str>>(
        &self,
        pages: &[S],
        mode: SegmentMode,
    ) -> Result<Vec<ContentUnit>, SegmentError> {
        let total: usize = pages.iter().map(|p| p.as_ref().chars().count()).sum();
        self.check_size(total)?;

        let mut units = Vec::new();
        for (i, page) in pages.iter().enumerate() {
            let page_number = u32::try_from(i + 1).unwrap_or(u32::MAX);
            self.segment_into(page.as_ref(), mode, Some(page_number), &mut units);
        }
        tracing::debug!(mode = %mode, pages = pages.len(), units = units.len(), "Segmented paginated document");
        Ok(units)
    }

    fn check_size(&self, chars: usize) -> Result<(), SegmentError> {
        match self.config.max_document_chars {
            Some(limit) if chars > limit => Err(SegmentError::DocumentTooLarge { chars, limit }),
            _ => Ok(()),
        }
    }

    fn segment_into(
        &self,
        text: &str,
        mode: SegmentMode,
        page: Option<u32>,
        out: &mut Vec<ContentUnit>,
    ) {
        let spans = match mode {
            SegmentMode::Chunk => self.chunk_spans(text),
            SegmentMode::Line => line_spans(text),
        };

        let mut cursor = CharCursor::default();
        for span in spans {
            let char_offset = cursor.advance_to(text, span.start);
            let slice = &text[span.start..span.end];
            let ordinal_index = out.len();
            out.push(ContentUnit {
                id: unit_id(mode, page, ordinal_index, char_offset, slice),
                ordinal_index,
                text: slice.to_string(),
                position: PositionMetadata {
                    char_offset,
                    char_len: slice.chars().count(),
                    page_number: page,
                    line_number: span.line_number,
                },
                kind: mode,
            });
        }
    }

    /// Byte spans of chunks: paragraphs packed greedily, oversized paragraphs split
    /// at the last sentence end that fits, else the last whitespace, else hard-cut.
    fn chunk_spans(&self, text: &str) -> Vec<Span> {
        let max = self.config.max_chunk_chars;
        let pieces: Vec<(usize, usize)> = paragraph_spans(text)
            .into_iter()
            .flat_map(|(start, end)| split_oversized(text, start, end, max))
            .collect();

        let mut spans = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        for (start, end) in pieces {
            current = match current {
                None => Some((start, end)),
                Some((chunk_start, chunk_end)) => {
                    if text[chunk_start..end].chars().count() <= max {
                        Some((chunk_start, end))
                    } else {
                        spans.push(Span::new(chunk_start, chunk_end));
                        Some((start, end))
                    }
                }
            };
        }
        if let Some((start, end)) = current {
            spans.push(Span::new(start, end));
        }
        spans
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    line_number: Option<usize>,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            line_number: None,
        }
    }
}

/// Tracks a byte position together with its character offset so that
/// converting increasing byte offsets stays linear.
#[derive(Default)]
struct CharCursor {
    byte: usize,
    chars: usize,
}

impl CharCursor {
    fn advance_to(&mut self, text: &str, byte: usize) -> usize {
        self.chars += text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

/// Trimmed, non-empty paragraph spans.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for sep in PARAGRAPH_BREAK.find_iter(text) {
        push_trimmed(text, start, sep.start(), &mut spans);
        start = sep.end();
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, start: usize, end: usize, out: &mut Vec<(usize, usize)>) {
    if let Some((s, e)) = trim_span(text, start, end) {
        out.push((s, e));
    }
}

fn trim_span(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        None
    } else {
        let s = start + leading;
        Some((s, s + trimmed.len()))
    }
}

fn split_oversized(text: &str, start: usize, end: usize, max: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let rest = &text[cursor..end];
        let limit = match rest.char_indices().nth(max) {
            Some((idx, _)) => idx,
            None => {
                push_trimmed(text, cursor, end, &mut pieces);
                break;
            }
        };

        // A whitespace exactly at the limit still lets the first `max` chars fit.
        let sentence_cut = SENTENCE_END
            .find_iter(rest)
            .map(|m| m.end() - rest[..m.end()].chars().next_back().map_or(0, char::len_utf8))
            .take_while(|idx| *idx <= limit)
            .last();
        let cut = sentence_cut.unwrap_or_else(|| {
            rest.char_indices()
                .take_while(|(idx, _)| *idx <= limit)
                .filter(|(idx, c)| *idx > 0 && c.is_whitespace())
                .map(|(idx, _)| idx)
                .last()
                .unwrap_or(limit)
        });

        push_trimmed(text, cursor, cursor + cut, &mut pieces);
        cursor += cut;
        // Skip the whitespace we cut on.
        let skipped = text[cursor..end].len() - text[cursor..end].trim_start().len();
        cursor += skipped;
    }

    pieces
}

/// Trimmed spans of non-blank lines with their 1-based line numbers.
fn line_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for (i, line) in text.split('\n').enumerate() {
        let line_end = offset + line.len();
        if let Some((s, e)) = trim_span(text, offset, line_end) {
            spans.push(Span {
                start: s,
                end: e,
                line_number: Some(i + 1),
            });
        }
        offset = line_end + 1;
    }
    spans
}

fn unit_id(mode: SegmentMode, page: Option<u32>, ordinal: usize, offset: usize, text: &str) -> String {
    let seed = format!(
        "{}:{}:{}:{}:{}",
        mode,
        page.map(|p| p.to_string()).unwrap_or_default(),
        ordinal,
        offset,
        text
    );
    Uuid::new_v5(&UNIT_NAMESPACE, seed.as_bytes()).to_string()
}
