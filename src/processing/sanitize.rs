//! Helpers for normalizing extracted text and caller-supplied identifiers.

use super::types::DocumentId;

/// Sanitize arbitrary string input by trimming whitespace and dropping empties.
pub(crate) fn sanitize_string(value: Option<String>) -> Option<String> {
    value.and_then(|input| {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Resolve the identifier for an incoming document.
///
/// An explicit identifier wins; otherwise the display name is used, mirroring how uploads are
/// keyed by file name. Control characters are stripped so ids stay printable in prompts.
pub fn sanitize_document_id(explicit: Option<String>, name: &str) -> Option<DocumentId> {
    let raw = sanitize_string(explicit).or_else(|| sanitize_string(Some(name.to_string())))?;
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let id = DocumentId::new(cleaned);
    if id.is_empty() { None } else { Some(id) }
}

/// Normalize extracted page text before boundary detection.
///
/// - CRLF and lone CR become LF.
/// - Non-breaking and other unicode spaces become ASCII spaces.
/// - Runs of inline whitespace collapse to one space and line ends are trimmed.
///
/// Line structure, including blank lines, is preserved.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());

    for (idx, line) in unified.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let mut previous_space = true;
        let start = out.len();
        for c in line.chars() {
            if c.is_whitespace() {
                if !previous_space {
                    out.push(' ');
                }
                previous_space = true;
            } else {
                out.push(c);
                previous_space = false;
            }
        }
        let trimmed_len = out[start..].trim_end().len();
        out.truncate(start + trimmed_len);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_document_id_prefers_explicit_value() {
        let id = sanitize_document_id(Some("  report-7 ".into()), "report.pdf").unwrap();
        assert_eq!(id.as_str(), "report-7");
    }

    #[test]
    fn sanitize_document_id_falls_back_to_name() {
        let id = sanitize_document_id(Some("   ".into()), "minutes.txt").unwrap();
        assert_eq!(id.as_str(), "minutes.txt");
        assert!(sanitize_document_id(None, " \t ").is_none());
    }

    #[test]
    fn sanitize_document_id_strips_control_characters() {
        let id = sanitize_document_id(Some("a\u{7}b".into()), "ignored").unwrap();
        assert_eq!(id.as_str(), "ab");
    }

    #[test]
    fn normalize_text_collapses_inline_whitespace() {
        let text = "Alpha\u{a0}\u{a0}beta \t gamma  \r\n\r\n  Delta   ";
        assert_eq!(normalize_text(text), "Alpha beta gamma\n\nDelta");
    }

    #[test]
    fn normalize_text_keeps_blank_lines() {
        assert_eq!(normalize_text("one\n\n\ntwo"), "one\n\n\ntwo");
    }
}
