//! Reconciliation of `[[chunk:<id>]]` markers in model output with the chunks actually sent.

use crate::processing::types::ChunkId;
use regex::Regex;
use std::sync::OnceLock;

/// Model output after citation validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reconciled {
    /// Prose with invalid markers removed and valid ones normalised.
    pub(crate) text: String,
    /// Valid cited chunks, deduplicated, in order of first appearance.
    pub(crate) cited: Vec<ChunkId>,
    /// Raw references that did not match any sent chunk.
    pub(crate) rejected: Vec<String>,
}

fn marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"\[\[\s*chunk\s*:\s*([^\]]*?)\s*\]\]").expect("citation pattern is valid")
    })
}

/// Validate every marker in `output` against `allowed`.
pub(crate) fn reconcile(output: &str, allowed: &[ChunkId]) -> Reconciled {
    let mut text = String::with_capacity(output.len());
    let mut cited = Vec::new();
    let mut rejected = Vec::new();
    let mut last = 0;

    for captures in marker().captures_iter(output) {
        let (Some(whole), Some(reference)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        text.push_str(&output[last..whole.start()]);
        last = whole.end();

        let valid = reference
            .as_str()
            .parse::<u64>()
            .ok()
            .map(ChunkId::new)
            .filter(|chunk_id| allowed.contains(chunk_id));

        match valid {
            Some(chunk_id) => {
                text.push_str(&format!("[[chunk:{chunk_id}]]"));
                if !cited.contains(&chunk_id) {
                    cited.push(chunk_id);
                }
            }
            None => {
                let trimmed = text.trim_end_matches([' ', '\t']).len();
                text.truncate(trimmed);
                rejected.push(reference.as_str().to_string());
            }
        }
    }
    text.push_str(&output[last..]);

    Reconciled {
        text: text.trim().to_string(),
        cited,
        rejected,
    }
}
