//! Extraction stage: one inference round-trip per job, plus corrective retries
//! when the reply does not parse as a draft.

use std::sync::Arc;

use tap_adapters::{Correction, InferenceClient, InferenceError, InferenceRequest};
use tap_core::{CanonicalDraft, ConfidenceMeta, DraftParse, RawEvent, StageError};
use tracing::{debug, warn};

/// Confidence assumed for a field the model did not score.
pub const DEFAULT_FIELD_CONFIDENCE: f32 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub draft: CanonicalDraft,
    pub confidence: ConfidenceMeta,
}

pub struct Extractor {
    client: Arc<dyn InferenceClient>,
    max_corrective_retries: u32,
}

impl Extractor {
    pub fn new(client: Arc<dyn InferenceClient>, max_corrective_retries: u32) -> Self {
        Self {
            client,
            max_corrective_retries,
        }
    }

    /// `Transient` when the capability is unreachable, `Malformed` once the
    /// corrective retries are used up.
    pub async fn extract(&self, raw: &RawEvent) -> Result<Extraction, StageError> {
        let mut request = InferenceRequest {
            source_id: raw.source_id.clone(),
            channel_id: raw.channel_id.clone(),
            observed_at: raw.last_changed_at(),
            text: normalize_post_text(raw.current_content()),
            correction: None,
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let (previous_output, problem) = match self.client.infer(&request).await {
                Err(InferenceError::Unavailable(reason)) => {
                    return Err(StageError::Transient(format!("inference_unavailable: {reason}")));
                }
                Err(InferenceError::Malformed(problem)) => (String::new(), problem),
                Ok(response) => match DraftParse::from_json(&response.raw) {
                    DraftParse::Ok(draft) => {
                        debug!(source_id = %raw.source_id, attempts, "draft parsed");
                        let confidence = confidence_meta(&draft, &response.model, attempts);
                        return Ok(Extraction { draft, confidence });
                    }
                    DraftParse::SchemaError(problem) => (response.raw, problem),
                },
            };

            if attempts > self.max_corrective_retries {
                return Err(StageError::Malformed(problem));
            }
            warn!(source_id = %raw.source_id, attempts, %problem, "draft rejected, asking for a correction");
            request.correction = Some(Correction {
                previous_output,
                problem,
            });
        }
    }
}

fn confidence_meta(draft: &CanonicalDraft, model: &str, attempts: u32) -> ConfidenceMeta {
    let per_field = draft
        .confidence
        .iter()
        .map(|(k, v)| (k.clone(), v.clamp(0.0, 1.0)))
        .collect::<std::collections::BTreeMap<_, _>>();
    let overall = if per_field.is_empty() {
        DEFAULT_FIELD_CONFIDENCE
    } else {
        per_field.values().sum::<f32>() / per_field.len() as f32
    };
    ConfidenceMeta {
        model: model.to_string(),
        overall,
        per_field,
        attempts,
    }
}

/// Collapses runs of whitespace, drops zero-width characters and blank lines.
pub fn normalize_post_text(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'))
        .collect::<String>()
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
