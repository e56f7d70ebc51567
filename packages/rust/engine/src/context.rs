//! Context carrying between chunks.
//!
//! After a chunk's results are reconciled, a compact digest of the decisions
//! made (terms used, style observed) is extracted and injected into the next
//! chunk's prompts. Extraction is lossy by design: the digest has its own
//! token budget, a small fraction of the per-request ceiling.
//!
//! Digest propagation is strictly sequential — chunk *k*'s payload may only
//! see material derived from chunks before it, which is why chunks are never
//! submitted in parallel.

use tracing::debug;

use fieldsmith_shared::{ContextDigest, ResultRecord, RetentionPolicy, ValidationStatus};

use crate::budget::estimate_text;

/// Longest string value considered a reusable "term" rather than prose.
const TERM_MAX_CHARS: usize = 80;

/// Owns the digest history and applies the configured retention policy.
#[derive(Debug)]
pub struct ContextCarrier {
    policy: RetentionPolicy,
    last_k: usize,
    /// Token budget for any digest handed to the payload builder.
    budget: u64,
    history: Vec<ContextDigest>,
}

impl ContextCarrier {
    pub fn new(policy: RetentionPolicy, last_k: usize, budget: u64) -> Self {
        Self {
            policy,
            last_k: last_k.max(1),
            budget,
            history: Vec::new(),
        }
    }

    /// Extract a digest from one chunk's reconciled results and retain it.
    ///
    /// Only valid and QA-flagged results contribute; schema errors and
    /// missing outputs carry no decisions worth propagating.
    pub fn digest(&mut self, chunk_index: usize, results: &[ResultRecord]) -> ContextDigest {
        let mut terms: Vec<String> = Vec::new();
        let mut style_notes: Vec<String> = Vec::new();
        let mut seen_fields: Vec<String> = Vec::new();

        for result in results {
            if !matches!(
                result.status,
                ValidationStatus::Valid | ValidationStatus::QaFlagged
            ) {
                continue;
            }

            for (field, value) in &result.fields {
                let Some(text) = extracted_value(value) else {
                    continue;
                };
                if text.is_empty() || text.len() > TERM_MAX_CHARS {
                    continue;
                }
                if !terms.iter().any(|t| t == &text) {
                    terms.push(text.clone());
                }
                if !seen_fields.iter().any(|f| f == field) {
                    seen_fields.push(field.clone());
                    style_notes.push(format!("{field}: {text}"));
                }
            }
        }

        let digest = truncate_to_budget(chunk_index, terms, style_notes, self.budget);

        debug!(
            chunk = chunk_index,
            terms = digest.terms.len(),
            weight = digest.weight,
            "context digest extracted"
        );

        self.history.push(digest.clone());
        digest
    }

    /// The digest the next chunk's payload builder should see, per policy.
    ///
    /// `None` before any chunk has completed (the first chunk always runs
    /// without inherited context).
    pub fn effective(&self) -> Option<ContextDigest> {
        if self.history.is_empty() {
            return None;
        }
        match self.policy {
            RetentionPolicy::Replace => self.history.last().cloned(),
            RetentionPolicy::LastK => {
                let start = self.history.len().saturating_sub(self.last_k);
                Some(self.merge(&self.history[start..]))
            }
            RetentionPolicy::Union => Some(self.merge(&self.history)),
        }
    }

    fn merge(&self, digests: &[ContextDigest]) -> ContextDigest {
        let chunk_index = digests.last().map(|d| d.chunk_index).unwrap_or(0);
        let mut terms: Vec<String> = Vec::new();
        let mut style_notes: Vec<String> = Vec::new();

        for digest in digests {
            for term in &digest.terms {
                if !terms.iter().any(|t| t == term) {
                    terms.push(term.clone());
                }
            }
            for note in &digest.style_notes {
                let field = note.split(':').next().unwrap_or(note);
                if !style_notes
                    .iter()
                    .any(|n| n.split(':').next().unwrap_or(n) == field)
                {
                    style_notes.push(note.clone());
                }
            }
        }

        truncate_to_budget(chunk_index, terms, style_notes, self.budget)
    }
}

/// Drop trailing entries until the digest fits its token budget.
fn truncate_to_budget(
    chunk_index: usize,
    mut terms: Vec<String>,
    mut style_notes: Vec<String>,
    budget: u64,
) -> ContextDigest {
    let weight_of = |terms: &[String], notes: &[String]| -> u64 {
        terms.iter().map(|t| estimate_text(t)).sum::<u64>()
            + notes.iter().map(|n| estimate_text(n)).sum::<u64>()
    };

    let mut weight = weight_of(&terms, &style_notes);
    while weight > budget {
        // Terms are more redundant than style notes; shed them first.
        if terms.len() > style_notes.len() || style_notes.is_empty() {
            terms.pop();
        } else {
            style_notes.pop();
        }
        if terms.is_empty() && style_notes.is_empty() {
            weight = 0;
            break;
        }
        weight = weight_of(&terms, &style_notes);
    }

    ContextDigest {
        chunk_index,
        terms,
        style_notes,
        weight,
    }
}

/// Append the digest as a compact context section on a prompt draft.
pub fn inject(digest: &ContextDigest, prompt: &mut String) {
    if digest.terms.is_empty() && digest.style_notes.is_empty() {
        return;
    }

    prompt.push_str("\n# Prior Batch Context\n");
    if !digest.style_notes.is_empty() {
        prompt.push_str("Field style established by earlier batches:\n");
        for note in &digest.style_notes {
            prompt.push_str("- ");
            prompt.push_str(note);
            prompt.push('\n');
        }
    }
    if !digest.terms.is_empty() {
        prompt.push_str("Phrases already used (avoid repeating verbatim; keep naming consistent):\n");
        for term in &digest.terms {
            prompt.push_str("- ");
            prompt.push_str(term);
            prompt.push('\n');
        }
    }
}

/// Pull the representative string out of an output value.
///
/// Provider outputs wrap each field as `{reasoning, confidence, value, …}`;
/// bare strings are accepted as-is.
pub(crate) fn extracted_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Object(map) => match map.get("value") {
            Some(serde_json::Value::String(s)) => Some(s.trim().to_string()),
            _ => None,
        },
        _ => None,
    }
}
