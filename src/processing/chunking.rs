//! Paragraph-level chunk boundary policy.
//!
//! Each page is cut independently, so a chunk never spans pages:
//!
//! - Boundaries: blank lines, plus structural starts (bullets `-`, `*`, `•` and enumerators
//!   such as `1.` or `2)`). Wrapped lines inside a unit are joined with a space.
//! - Short units: a unit with fewer than `min_words` words is merged into the following unit
//!   on the same page. A short tail with no successor joins its predecessor when that fits
//!   `max_chars`.
//! - Long units: a unit over `max_chars` characters is cut at the last sentence boundary before
//!   the limit. A single sentence longer than the limit is split on word boundaries with
//!   `semchunk-rs`, counting characters.

use semchunk_rs::Chunker;

use super::sanitize::normalize_text;
use super::types::Document;

/// Default minimum words per unit.
pub const DEFAULT_MIN_WORDS: usize = 2;
/// Default maximum characters per unit.
pub const DEFAULT_MAX_CHARS: usize = 1000;

/// Thresholds controlling chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Units with fewer words are merged into the next unit on the page.
    pub min_words: usize,
    /// Units longer than this many characters are split.
    pub max_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_words: DEFAULT_MIN_WORDS,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

/// Chunk text and provenance before an identifier has been assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    /// Page the draft was cut from.
    pub page_number: u32,
    /// 0-based position within the page.
    pub paragraph_index: u32,
    /// Trimmed, non-empty text.
    pub text: String,
}

impl ChunkPolicy {
    /// Split every page of `document` into drafts, in document order.
    pub fn split_document(&self, document: &Document) -> Vec<ChunkDraft> {
        let mut drafts = Vec::new();
        for page in &document.pages {
            let text = page.blocks.join("\n\n");
            let units = self.split_page(&text);
            drafts.extend(
                units
                    .into_iter()
                    .enumerate()
                    .map(|(index, text)| ChunkDraft {
                        page_number: page.number,
                        paragraph_index: index as u32,
                        text,
                    }),
            );
        }
        drafts
    }

    /// Split the text of a single page into final units.
    pub fn split_page(&self, text: &str) -> Vec<String> {
        let max_chars = self.max_chars.max(1);
        let normalized = normalize_text(text);
        let units = structural_units(&normalized);
        let merged = merge_short_units(units, self.min_words, max_chars);

        merged
            .into_iter()
            .flat_map(|unit| split_oversized(&unit, max_chars))
            .map(|unit| unit.trim().to_string())
            .filter(|unit| !unit.is_empty())
            .collect()
    }
}

fn structural_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut current, &mut units);
            continue;
        }
        if starts_structural_unit(line) {
            flush(&mut current, &mut units);
        }
        current.push(line);
    }
    flush(&mut current, &mut units);
    units
}

fn flush(current: &mut Vec<&str>, units: &mut Vec<String>) {
    if !current.is_empty() {
        units.push(current.join(" "));
        current.clear();
    }
}

fn starts_structural_unit(line: &str) -> bool {
    structural_marker_len(line).is_some()
}

/// Byte length of a leading bullet or enumerator marker, including its trailing space.
fn structural_marker_len(line: &str) -> Option<usize> {
    if line.starts_with("- ") || line.starts_with("* ") {
        return Some(2);
    }
    if line.starts_with('•') {
        return Some('•'.len_utf8());
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 || digits > 3 {
        return None;
    }
    let mut rest = line[digits..].chars();
    (matches!(rest.next(), Some('.') | Some(')')) && matches!(rest.next(), Some(' ')))
        .then_some(digits + 2)
}

/// Words in `text`, not counting the bullet or enumerator marker opening each line.
fn word_count(text: &str) -> usize {
    text.lines()
        .map(|line| {
            let line = line.trim();
            let body = structural_marker_len(line).map_or(line, |marker| &line[marker..]);
            body.split_whitespace().count()
        })
        .sum()
}

fn merge_short_units(units: Vec<String>, min_words: usize, max_chars: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(units.len());
    let mut carry: Option<String> = None;

    for unit in units {
        let unit = match carry.take() {
            Some(previous) => format!("{previous}\n{unit}"),
            None => unit,
        };
        if word_count(&unit) < min_words {
            carry = Some(unit);
        } else {
            merged.push(unit);
        }
    }

    if let Some(tail) = carry {
        match merged.last_mut() {
            Some(last) if last.chars().count() + 1 + tail.chars().count() <= max_chars => {
                last.push('\n');
                last.push_str(&tail);
            }
            _ => merged.push(tail),
        }
    }

    merged
}

fn split_oversized(unit: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = unit.trim();

    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(offset, _)| offset)
            .unwrap_or(rest.len());
        let ends = sentence_ends(rest);

        if let Some(cut) = ends.iter().rev().copied().find(|end| *end <= limit) {
            pieces.push(rest[..cut].trim().to_string());
            rest = rest[cut..].trim_start();
            continue;
        }

        // The first sentence alone exceeds the limit: split it on word boundaries.
        let sentence_end = ends.first().copied().unwrap_or(rest.len());
        pieces.extend(split_on_words(&rest[..sentence_end], max_chars));
        rest = rest[sentence_end..].trim_start();
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Byte offsets just past each sentence terminator followed by whitespace or end of text.
fn sentence_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let mut end = offset + c.len_utf8();
        while let Some(&(next_offset, next)) = chars.peek() {
            if matches!(next, '"' | '\'' | ')' | ']' | '”' | '’') {
                end = next_offset + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        match chars.peek() {
            Some(&(_, next)) if next.is_whitespace() => ends.push(end),
            None => ends.push(end),
            _ => {}
        }
    }

    ends
}

fn split_on_words(sentence: &str, max_chars: usize) -> Vec<String> {
    let chunker = Chunker::new(
        max_chars,
        Box::new(|segment: &str| segment.chars().count()),
    );
    chunker
        .chunk(sentence)
        .into_iter()
        .map(|piece| piece.trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}
