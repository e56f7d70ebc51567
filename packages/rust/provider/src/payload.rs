//! Provider wire format for batch submissions.
//!
//! One [`ChunkPayload`] is serialized as a JSONL artifact — one
//! [`RecordRequest`] per line — and uploaded as a single batch job.

use fieldsmith_shared::Result;
use serde::{Deserialize, Serialize};

/// One per-record request line in a batch payload.
///
/// Mirrors the provider's batch request envelope: the `custom_id` carries the
/// record identifier so outputs can be re-associated regardless of output
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
}

impl RecordRequest {
    /// Standard POST request against the responses endpoint.
    pub fn new(custom_id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".into(),
            url: "/v1/responses".into(),
            body,
        }
    }
}

/// An ordered set of per-record requests submitted as one batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Index of the chunk this payload carries.
    pub chunk_index: usize,
    /// Requests in record order.
    pub requests: Vec<RecordRequest>,
}

impl ChunkPayload {
    /// Serialize to the JSONL upload format, one request per line.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for request in &self.requests {
            let line = serde_json::to_string(request).map_err(|e| {
                fieldsmith_shared::FieldsmithError::validation(format!(
                    "payload serialization failed for {}: {e}",
                    request.custom_id
                ))
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ChunkPayload {
        ChunkPayload {
            chunk_index: 0,
            requests: vec![
                RecordRequest::new("sku-1", serde_json::json!({"model": "test"})),
                RecordRequest::new("sku-2", serde_json::json!({"model": "test"})),
            ],
        }
    }

    #[test]
    fn jsonl_has_one_line_per_request() {
        let jsonl = payload().to_jsonl().expect("serialize");
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("parse line");
        assert_eq!(first["custom_id"], "sku-1");
        assert_eq!(first["method"], "POST");
        assert_eq!(first["url"], "/v1/responses");
    }

    #[test]
    fn requests_keep_payload_order() {
        let jsonl = payload().to_jsonl().expect("serialize");
        let ids: Vec<String> = jsonl
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).expect("parse line"))
            .map(|v| v["custom_id"].as_str().expect("custom_id").to_string())
            .collect();
        assert_eq!(ids, vec!["sku-1", "sku-2"]);
    }
}
