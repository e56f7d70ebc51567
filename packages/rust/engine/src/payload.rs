//! Payload building: fragment + inherited context → provider request objects.
//!
//! The instruction text and output-schema descriptor come from the
//! prompt/schema collaborator and are treated as opaque; this module supplies
//! structure, record ordering, and the injected context section. Record order
//! inside a payload always mirrors fragment order, and every request carries
//! the record identifier as `custom_id` so the reconciler can re-associate
//! outputs even if the provider reorders them.

use fieldsmith_shared::{Chunk, ContextDigest, Fragment, OutputSchema, Record};
use fieldsmith_provider::{ChunkPayload, RecordRequest};

use crate::context;

/// Builds provider request objects for fragments and chunks.
pub struct PayloadBuilder {
    model: String,
    instructions: String,
    schema: OutputSchema,
}

impl PayloadBuilder {
    pub fn new(model: impl Into<String>, instructions: impl Into<String>, schema: OutputSchema) -> Self {
        Self {
            model: model.into(),
            instructions: instructions.into(),
            schema,
        }
    }

    /// Schema the run's outputs are validated against.
    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Build the full payload for one chunk, in global record order.
    pub fn build_chunk(&self, chunk: &Chunk, digest: Option<&ContextDigest>) -> ChunkPayload {
        let mut requests = Vec::with_capacity(chunk.record_count());
        for fragment in &chunk.fragments {
            requests.extend(self.build_fragment(fragment, digest));
        }
        ChunkPayload {
            chunk_index: chunk.index,
            requests,
        }
    }

    /// Build one request per record for a fragment.
    pub fn build_fragment(
        &self,
        fragment: &Fragment,
        digest: Option<&ContextDigest>,
    ) -> Vec<RecordRequest> {
        fragment
            .records
            .iter()
            .map(|record| self.build_record(record, fragment, digest))
            .collect()
    }

    fn build_record(
        &self,
        record: &Record,
        fragment: &Fragment,
        digest: Option<&ContextDigest>,
    ) -> RecordRequest {
        let mut prompt = compose_prompt(record, fragment);
        if let Some(digest) = digest {
            context::inject(digest, &mut prompt);
        }

        let mut content = vec![serde_json::json!({
            "type": "input_text",
            "text": prompt,
        })];
        for url in &record.image_urls {
            content.push(serde_json::json!({
                "type": "input_image",
                "image_url": url,
                "detail": "low",
            }));
        }

        let body = serde_json::json!({
            "model": self.model,
            "instructions": self.instructions,
            "input": [{
                "role": "user",
                "content": content,
            }],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": self.schema.name,
                    "strict": true,
                    "schema": self.schema.schema,
                },
            },
        });

        RecordRequest::new(record.id.as_str(), body)
    }
}

/// Compose the per-record user prompt from its field-mapped source data.
fn compose_prompt(record: &Record, fragment: &Fragment) -> String {
    let mut prompt = String::from(
        "Extract the data as structured output for the fields specified in the system instructions.\n\n",
    );

    if fragment.record_count() > 1 {
        let siblings: Vec<&str> = fragment
            .records
            .iter()
            .filter(|r| r.id != record.id)
            .map(|r| r.id.as_str())
            .collect();
        prompt.push_str(&format!(
            "This record is processed alongside related records: {}.\n\n",
            siblings.join(", ")
        ));
    }

    if fragment.context_incomplete {
        prompt.push_str(
            "Note: related records for this group were split across separate requests, so sibling data may be incomplete. Lower your confidence accordingly.\n\n",
        );
    }

    prompt.push_str(&format!("# Supplier Data\n## Record: {}\n", record.id));
    for (field, value) in &record.fields {
        prompt.push_str(&format!("- **{}**: {}\n", field.replace(':', ""), value));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fieldsmith_shared::RecordId;

    fn record(id: &str, fields: &[(&str, &str)], images: usize) -> Record {
        Record {
            id: RecordId::new(id),
            group_key: "g".into(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            image_urls: (0..images).map(|i| format!("https://img/{i}.jpg")).collect(),
            weight: 10,
        }
    }

    fn fragment(records: Vec<Record>, flagged: bool) -> Fragment {
        let weight = records.iter().map(|r| r.weight).sum();
        Fragment {
            index: 0,
            records,
            weight,
            context_incomplete: flagged,
        }
    }

    fn builder() -> PayloadBuilder {
        PayloadBuilder::new(
            "test-model",
            "Act as a product data analyst.",
            OutputSchema::permissive("fields_extracted_response"),
        )
    }

    #[test]
    fn requests_preserve_record_order() {
        let chunk = Chunk {
            index: 0,
            fragments: vec![
                fragment(vec![record("a", &[], 0), record("b", &[], 0)], false),
                fragment(vec![record("c", &[], 0)], false),
            ],
        };
        let payload = builder().build_chunk(&chunk, None);

        let ids: Vec<&str> = payload.requests.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(payload.chunk_index, 0);
    }

    #[test]
    fn body_carries_model_instructions_and_schema() {
        let frag = fragment(vec![record("sku-1", &[("title", "Oak Table")], 0)], false);
        let requests = builder().build_fragment(&frag, None);

        let body = &requests[0].body;
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["instructions"], "Act as a product data analyst.");
        assert_eq!(body["text"]["format"]["type"], "json_schema");
        assert_eq!(body["text"]["format"]["name"], "fields_extracted_response");

        let text = body["input"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("**title**: Oak Table"));
    }

    #[test]
    fn images_are_attached_at_low_detail() {
        let frag = fragment(vec![record("sku-1", &[], 2)], false);
        let requests = builder().build_fragment(&frag, None);

        let content = requests[0].body["input"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3); // prompt + 2 images
        assert_eq!(content[1]["type"], "input_image");
        assert_eq!(content[1]["detail"], "low");
    }

    #[test]
    fn digest_is_injected_into_every_prompt() {
        let digest = ContextDigest {
            chunk_index: 0,
            terms: vec!["Oak Side Table".into()],
            style_notes: vec!["title: Oak Side Table".into()],
            weight: 8,
        };
        let frag = fragment(vec![record("a", &[], 0), record("b", &[], 0)], false);
        let requests = builder().build_fragment(&frag, Some(&digest));

        for request in &requests {
            let text = request.body["input"][0]["content"][0]["text"].as_str().unwrap();
            assert!(text.contains("# Prior Batch Context"));
        }
    }

    #[test]
    fn first_chunk_has_no_context_section() {
        let frag = fragment(vec![record("a", &[], 0)], false);
        let requests = builder().build_fragment(&frag, None);
        let text = requests[0].body["input"][0]["content"][0]["text"].as_str().unwrap();
        assert!(!text.contains("# Prior Batch Context"));
    }

    #[test]
    fn context_incomplete_fragments_warn_the_model() {
        let frag = fragment(vec![record("a", &[], 0)], true);
        let requests = builder().build_fragment(&frag, None);
        let text = requests[0].body["input"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("split across separate requests"));
    }

    #[test]
    fn sibling_records_are_listed() {
        let frag = fragment(vec![record("a", &[], 0), record("b", &[], 0)], false);
        let requests = builder().build_fragment(&frag, None);
        let text = requests[0].body["input"][0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("related records: b"));
    }
}
