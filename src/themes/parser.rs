//! Strict parser for the theme-pass output.
//!
//! Expected shape:
//!
//! ```text
//! THEMES:
//! 1. Title
//!    - Summary sentence.
//!    - Documents: D1, D3
//!
//! SYNTHESIZED ANSWER:
//! Free text.
//! ```
//!
//! The parser only extracts structure; references are resolved against the input batch by
//! [`resolve_reference`] and anything unresolvable is left for the caller to drop.

use crate::processing::types::DocumentId;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedTheme {
    pub(crate) title: String,
    pub(crate) summary: String,
    pub(crate) references: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedReport {
    pub(crate) themes: Vec<ParsedTheme>,
    pub(crate) synthesized_answer: Option<String>,
}

fn section_marker() -> &'static Regex {
    static SECTION: OnceLock<Regex> = OnceLock::new();
    SECTION.get_or_init(|| {
        Regex::new(r"(?i)synthesi[sz]ed\s+answer\s*:").expect("answer marker pattern is valid")
    })
}

fn themes_marker() -> &'static Regex {
    static THEMES: OnceLock<Regex> = OnceLock::new();
    THEMES.get_or_init(|| Regex::new(r"(?i)themes\s*:").expect("themes marker pattern is valid"))
}

fn theme_heading() -> &'static Regex {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    HEADING.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:#{1,4}\s*)?(?:theme\s*)?\d{1,2}\s*[.):]\s*(.+)$")
            .expect("theme heading pattern is valid")
    })
}

fn documents_line() -> &'static Regex {
    static DOCUMENTS: OnceLock<Regex> = OnceLock::new();
    DOCUMENTS.get_or_init(|| {
        Regex::new(r"(?i)^\s*[-*•]?\s*(?:supporting\s+)?documents?\s*:\s*(.*)$")
            .expect("documents pattern is valid")
    })
}

/// Split raw model output into theme blocks and the synthesized answer.
pub(crate) fn parse_theme_response(text: &str) -> ParsedReport {
    let (themes_part, synthesized_answer) = match section_marker().find(text) {
        Some(marker) => {
            let answer = text[marker.end()..].trim();
            (
                &text[..marker.start()],
                (!answer.is_empty()).then(|| answer.to_string()),
            )
        }
        None => (text, None),
    };

    let themes_part = match themes_marker().find(themes_part) {
        Some(marker) => &themes_part[marker.end()..],
        None => themes_part,
    };

    let mut themes = Vec::new();
    let mut current: Option<ParsedTheme> = None;

    for line in themes_part.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(references) = documents_line().captures(trimmed).and_then(|c| c.get(1)) {
            if let Some(theme) = current.as_mut() {
                theme.references.extend(split_references(references.as_str()));
            }
            continue;
        }

        if let Some(title) = theme_heading().captures(trimmed).and_then(|c| c.get(1)) {
            if let Some(finished) = current.take() {
                themes.push(finished);
            }
            current = Some(ParsedTheme {
                title: clean_fragment(title.as_str()),
                ..ParsedTheme::default()
            });
            continue;
        }

        if let Some(theme) = current.as_mut() {
            let fragment = clean_fragment(trimmed.trim_start_matches(['-', '*', '•']));
            if fragment.is_empty() {
                continue;
            }
            if !theme.summary.is_empty() {
                theme.summary.push(' ');
            }
            theme.summary.push_str(&fragment);
        }
    }
    if let Some(finished) = current {
        themes.push(finished);
    }

    themes.retain(|theme| !theme.title.is_empty());
    ParsedReport {
        themes,
        synthesized_answer,
    }
}

fn clean_fragment(fragment: &str) -> String {
    fragment
        .trim()
        .trim_matches(|c: char| matches!(c, '[' | ']' | '*' | '"'))
        .trim()
        .to_string()
}

fn split_references(raw: &str) -> Vec<String> {
    raw.split([',', ';', '&'])
        .flat_map(|part| part.split(" and "))
        .map(|part| {
            part.trim()
                .trim_matches(|c: char| matches!(c, '[' | ']' | '(' | ')' | '"' | '\'' | '.'))
                .trim()
                .to_string()
        })
        .filter(|part| !part.is_empty())
        .collect()
}

/// Resolve a reference (`D2`, `2`, `Document 2` or a raw document id) to an input position.
pub(crate) fn resolve_reference(reference: &str, documents: &[DocumentId]) -> Option<usize> {
    let normalized = reference.trim();
    let lowered = normalized.to_lowercase();
    let label = lowered
        .strip_prefix("document")
        .map(str::trim)
        .unwrap_or(&lowered);
    let label = label.strip_prefix('d').unwrap_or(label);

    let labelled = label
        .parse::<usize>()
        .ok()
        .filter(|number| (1..=documents.len()).contains(number))
        .map(|number| number - 1);
    if labelled.is_some() {
        return labelled;
    }

    documents
        .iter()
        .position(|document_id| document_id.as_str().eq_ignore_ascii_case(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbered_blocks_and_answer() {
        let output = "THEMES:\n1. [Rising Costs]\n   - Prices increased across regions.\n   - Documents: D1, D3\n\n2. Labour Shortages\n   - Hiring stalled.\n   - Documents: 2\n\nSYNTHESIZED ANSWER:\nCosts rose and hiring stalled.";
        let report = parse_theme_response(output);

        assert_eq!(report.themes.len(), 2);
        assert_eq!(report.themes[0].title, "Rising Costs");
        assert_eq!(report.themes[0].summary, "Prices increased across regions.");
        assert_eq!(report.themes[0].references, vec!["D1", "D3"]);
        assert_eq!(report.themes[1].references, vec!["2"]);
        assert_eq!(
            report.synthesized_answer.as_deref(),
            Some("Costs rose and hiring stalled.")
        );
    }

    #[test]
    fn tolerates_missing_sections() {
        let report = parse_theme_response("Nothing structured here.");
        assert!(report.themes.is_empty());
        assert!(report.synthesized_answer.is_none());
    }

    #[test]
    fn references_split_on_common_separators() {
        assert_eq!(
            split_references("D1 and D2; [D4], Document 5."),
            vec!["D1", "D2", "D4", "Document 5"]
        );
    }

    #[test]
    fn resolves_labels_numbers_and_raw_ids() {
        let documents = vec![DocumentId::new("alpha.pdf"), DocumentId::new("beta.txt")];
        assert_eq!(resolve_reference("D2", &documents), Some(1));
        assert_eq!(resolve_reference("d1", &documents), Some(0));
        assert_eq!(resolve_reference("1", &documents), Some(0));
        assert_eq!(resolve_reference("Document 2", &documents), Some(1));
        assert_eq!(resolve_reference("BETA.TXT", &documents), Some(1));
        assert_eq!(resolve_reference("D3", &documents), None);
        assert_eq!(resolve_reference("D0", &documents), None);
        assert_eq!(resolve_reference("gamma", &documents), None);
    }

    #[test]
    fn numeric_document_ids_resolve_when_no_label_matches() {
        let documents = vec![DocumentId::new("7"), DocumentId::new("d12")];
        assert_eq!(resolve_reference("7", &documents), Some(0));
        assert_eq!(resolve_reference("D12", &documents), Some(1));
        assert_eq!(resolve_reference("2", &documents), Some(1));
        assert_eq!(resolve_reference("9", &documents), None);
    }
}
