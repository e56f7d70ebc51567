//! Result reconciliation: raw output lines → validated result records.
//!
//! Reconciliation is a pure function of the raw lines and the originating
//! chunk, so replaying a persisted output artifact always yields identical
//! results. Every output line must map to exactly one known record
//! identifier; unmatched lines and unmatched records are both reported,
//! never silently dropped.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use fieldsmith_shared::{Chunk, OutputSchema, Record, ResultRecord, ValidationStatus};

use crate::context::extracted_value;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Everything the reconciler learned from one chunk's raw output.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// One result per input record, in chunk record order. Records the
    /// provider returned nothing for carry status `MissingOutput`.
    pub results: Vec<ResultRecord>,
    /// Output lines that matched no known record identifier (or were
    /// malformed/duplicated), described for the report.
    pub unmatched_lines: Vec<String>,
    /// Provider-reported token usage summed across matched lines.
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl ReconcileOutcome {
    pub fn count_status(&self, status: ValidationStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// One parsed provider output line before validation.
struct ParsedLine {
    /// Extracted structured fields, or the provider's per-request error.
    payload: std::result::Result<BTreeMap<String, serde_json::Value>, String>,
    tokens_in: u64,
    tokens_out: u64,
}

/// Parse one raw JSONL output line. Returns `(custom_id, parsed)`;
/// `None` when the line is not even attributable to a record.
fn parse_line(line: &str) -> Option<(String, ParsedLine)> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let custom_id = value.get("custom_id")?.as_str()?.to_string();

    // Per-request provider errors come back as lines too.
    if let Some(message) = error_message(&value) {
        return Some((
            custom_id,
            ParsedLine {
                payload: Err(message),
                tokens_in: 0,
                tokens_out: 0,
            },
        ));
    }

    let body = value.get("response").and_then(|r| r.get("body"));
    let (tokens_in, tokens_out) = usage(body);

    let payload = match body.and_then(content_text) {
        Some(text) => match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&text) {
            Ok(fields) => Ok(fields),
            Err(e) => Err(format!("output is not a JSON object: {e}")),
        },
        None => Err("no structured output content in response".into()),
    };

    Some((
        custom_id,
        ParsedLine {
            payload,
            tokens_in,
            tokens_out,
        },
    ))
}

fn error_message(value: &serde_json::Value) -> Option<String> {
    let error = value
        .get("error")
        .filter(|e| !e.is_null())
        .or_else(|| {
            value
                .get("response")
                .and_then(|r| r.get("body"))
                .and_then(|b| b.get("error"))
                .filter(|e| !e.is_null())
        })?;
    Some(
        error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}

/// Extract the structured-output text from either a responses-style
/// `output[].content[].text` body or a chat-style `choices[].message.content`.
fn content_text(body: &serde_json::Value) -> Option<String> {
    let outputs = body
        .get("output")
        .or_else(|| body.get("choices"))?
        .as_array()?;

    for output in outputs {
        let content = output
            .get("content")
            .or_else(|| output.get("message").and_then(|m| m.get("content")))?;

        match content {
            serde_json::Value::String(s) => return Some(s.clone()),
            serde_json::Value::Array(parts) => {
                if let Some(text) = parts
                    .iter()
                    .find_map(|p| p.get("text").and_then(|t| t.as_str()))
                {
                    return Some(text.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn usage(body: Option<&serde_json::Value>) -> (u64, u64) {
    let Some(usage) = body.and_then(|b| b.get("usage")) else {
        return (0, 0);
    };
    let pick = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(|v| v.as_u64()))
            .unwrap_or(0)
    };
    (
        pick(["input_tokens", "prompt_tokens"]),
        pick(["output_tokens", "completion_tokens"]),
    )
}

// ---------------------------------------------------------------------------
// QA heuristics
// ---------------------------------------------------------------------------

/// Suspicious boilerplate the model falls back on when it has nothing real
/// to say about a product.
fn boilerplate_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bas an ai\b",
            r"(?i)lorem ipsum",
            r"(?i)perfect for any (home|room|occasion)",
            r"(?i)high[- ]quality (product|materials|craftsmanship)",
            r"(?i)elevate your (space|home|style)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

fn qa_notes(
    record: &Record,
    fields: &BTreeMap<String, serde_json::Value>,
    schema: &OutputSchema,
    context_incomplete: bool,
) -> Vec<String> {
    let mut notes = Vec::new();

    for (field, value) in fields {
        let Some(text) = extracted_value(value) else {
            continue;
        };

        // Output identical to input: no normalization was applied.
        if let Some(input) = record.fields.get(field) {
            if !text.is_empty()
                && text.trim().eq_ignore_ascii_case(input.trim())
            {
                notes.push(format!("field `{field}` identical to input, no normalization applied"));
            }
        }

        for pattern in boilerplate_patterns() {
            if pattern.is_match(&text) {
                notes.push(format!("field `{field}` contains boilerplate: {}", pattern.as_str()));
            }
        }

        if let Some(min) = schema.min_value_len {
            if !text.is_empty() && text.len() < min {
                notes.push(format!("field `{field}` shorter than expected ({} < {min})", text.len()));
            }
        }
        if let Some(max) = schema.max_value_len {
            if text.len() > max {
                notes.push(format!("field `{field}` longer than expected ({} > {max})", text.len()));
            }
        }
    }

    for field in &schema.required_fields {
        if let Some(value) = fields.get(field) {
            if extracted_value(value).is_some_and(|t| t.is_empty()) || value.is_null() {
                notes.push(format!("required field `{field}` is empty"));
            }
        }
    }

    if context_incomplete {
        notes.push("derived from a context-incomplete fragment; sibling data was split".into());
    }

    notes
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Reconcile a completed chunk's raw output lines against its input records.
pub fn reconcile(chunk: &Chunk, raw_lines: &[String], schema: &OutputSchema) -> ReconcileOutcome {
    let mut parsed: BTreeMap<String, ParsedLine> = BTreeMap::new();
    let mut unmatched_lines: Vec<String> = Vec::new();

    for line in raw_lines {
        match parse_line(line) {
            Some((custom_id, parsed_line)) => {
                if parsed.contains_key(&custom_id) {
                    unmatched_lines.push(format!("duplicate output line for {custom_id}"));
                } else {
                    parsed.insert(custom_id, parsed_line);
                }
            }
            None => {
                let snippet: String = line.chars().take(120).collect();
                unmatched_lines.push(format!("unparseable output line: {snippet}"));
            }
        }
    }

    let known_ids: std::collections::BTreeSet<&str> =
        chunk.records().map(|r| r.id.as_str()).collect();
    for custom_id in parsed.keys() {
        if !known_ids.contains(custom_id.as_str()) {
            unmatched_lines.push(format!("output line for unknown record {custom_id}"));
        }
    }

    let mut results = Vec::new();
    let mut tokens_in = 0u64;
    let mut tokens_out = 0u64;

    for fragment in &chunk.fragments {
        for record in &fragment.records {
            let result = match parsed.remove(record.id.as_str()) {
                Some(line) => {
                    tokens_in += line.tokens_in;
                    tokens_out += line.tokens_out;
                    validate(record, line, schema, fragment.context_incomplete)
                }
                None => ResultRecord {
                    id: record.id.clone(),
                    fields: BTreeMap::new(),
                    status: ValidationStatus::MissingOutput,
                    qa_notes: vec!["no output line returned by provider".into()],
                    tokens_in: 0,
                    tokens_out: 0,
                },
            };
            results.push(result);
        }
    }

    let missing = results
        .iter()
        .filter(|r| r.status == ValidationStatus::MissingOutput)
        .count();
    if missing > 0 || !unmatched_lines.is_empty() {
        warn!(
            chunk = chunk.index,
            missing,
            unmatched = unmatched_lines.len(),
            "reconciliation found identifier mismatches"
        );
    }

    info!(
        chunk = chunk.index,
        records = results.len(),
        tokens_in,
        tokens_out,
        "chunk reconciled"
    );

    ReconcileOutcome {
        results,
        unmatched_lines,
        tokens_in,
        tokens_out,
    }
}

fn validate(
    record: &Record,
    line: ParsedLine,
    schema: &OutputSchema,
    context_incomplete: bool,
) -> ResultRecord {
    let mut result = ResultRecord {
        id: record.id.clone(),
        fields: BTreeMap::new(),
        status: ValidationStatus::Valid,
        qa_notes: Vec::new(),
        tokens_in: line.tokens_in,
        tokens_out: line.tokens_out,
    };

    let fields = match line.payload {
        Ok(fields) => fields,
        Err(message) => {
            result.status = ValidationStatus::SchemaError;
            result.qa_notes.push(format!("provider error: {message}"));
            return result;
        }
    };

    let missing: Vec<&str> = schema
        .required_fields
        .iter()
        .map(String::as_str)
        .filter(|f| !fields.contains_key(*f))
        .collect();

    result.qa_notes = qa_notes(record, &fields, schema, context_incomplete);
    result.fields = fields;

    if !missing.is_empty() {
        result.status = ValidationStatus::SchemaError;
        result
            .qa_notes
            .insert(0, format!("missing required fields: {}", missing.join(", ")));
    } else if !result.qa_notes.is_empty() {
        result.status = ValidationStatus::QaFlagged;
    }

    result
}
