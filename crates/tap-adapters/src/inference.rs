//! Inference capability: turns post text into a draft JSON document.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tap_core::SUPPORTED_DRAFT_SCHEMA;
use tap_storage::{BackoffPolicy, FetchError, HttpClient, HttpClientConfig};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// Connectivity, timeout or upstream failure.
    #[error("inference unavailable: {0}")]
    Unavailable(String),
    /// The reply did not match the draft schema.
    #[error("inference malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub source_id: String,
    pub channel_id: String,
    pub observed_at: DateTime<Utc>,
    pub text: String,
    /// Previous reply and the reason it was rejected, for corrective retries.
    pub correction: Option<Correction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub previous_output: String,
    pub problem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResponse {
    pub model: String,
    pub raw: String,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn model(&self) -> &str;

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub system_prompt: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(45),
            system_prompt: None,
        }
    }
}

fn default_system_prompt() -> String {
    format!(
        "You read tuition assignment posts and reply with ONE JSON object only. \
         Fields: schema_version (always {SUPPORTED_DRAFT_SCHEMA}), is_assignment (bool), subjects (array of strings), \
         level, rate, location, postal_code, availability, agency, assignment_code, \
         lesson_duration, frequency, tutor_gender, tutor_type, remarks (strings or null), \
         confidence (object of field name to number 0..1). \
         Copy values from the post; do not invent values that are not present."
    )
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client (OpenAI-compatible wire format).
#[derive(Debug)]
pub struct OpenAiInferenceClient {
    http: HttpClient,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
}

impl OpenAiInferenceClient {
    pub fn new(config: InferenceConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(format!("{}/{}", crate::CRATE_NAME, env!("CARGO_PKG_VERSION"))),
            global_concurrency: 8,
            // The worker loop owns retry policy for unavailability.
            backoff: BackoffPolicy {
                max_retries: 1,
                ..BackoffPolicy::default()
            },
            token_bucket: None,
        })?;
        Ok(Self {
            http,
            endpoint: config.endpoint,
            api_key: config.api_key,
            model: config.model,
            system_prompt: config.system_prompt.unwrap_or_else(default_system_prompt),
        })
    }
}

fn user_prompt(request: &InferenceRequest) -> String {
    format!(
        "channel: {}\nposted_at: {}\n---\n{}",
        request.channel_id,
        request.observed_at.to_rfc3339(),
        request.text
    )
}

fn correction_prompt(correction: &Correction) -> String {
    format!(
        "Your previous reply could not be used: {}. Reply again with only the corrected JSON object.",
        correction.problem
    )
}

fn content_from_response(response: ChatResponse, fallback_model: &str) -> Result<InferenceResponse, InferenceError> {
    let model = response.model.unwrap_or_else(|| fallback_model.to_string());
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| InferenceError::Malformed("empty completion".to_string()))?;
    Ok(InferenceResponse {
        model,
        raw: content,
    })
}

fn map_fetch_error(err: FetchError) -> InferenceError {
    match err {
        FetchError::HttpStatus { status, body, .. } => {
            InferenceError::Unavailable(format!("http {status}: {body}"))
        }
        other => InferenceError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl InferenceClient for OpenAiInferenceClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let user = user_prompt(request);
        let correction = request.correction.as_ref().map(correction_prompt);

        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: &self.system_prompt,
            },
            ChatMessage {
                role: "user",
                content: &user,
            },
        ];
        if let (Some(previous), Some(follow_up)) = (request.correction.as_ref(), correction.as_deref()) {
            messages.push(ChatMessage {
                role: "assistant",
                content: &previous.previous_output,
            });
            messages.push(ChatMessage {
                role: "user",
                content: follow_up,
            });
        }
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };

        debug!(source_id = %request.source_id, corrective = request.correction.is_some(), "calling inference");
        let resp = self
            .http
            .send(|client| {
                let builder = client.post(&self.endpoint).json(&body);
                match &self.api_key {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            })
            .await
            .map_err(map_fetch_error)?;

        let parsed: ChatResponse = resp
            .json()
            .map_err(|e| InferenceError::Malformed(format!("completion envelope: {e}")))?;
        content_from_response(parsed, &self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest {
            source_id: "S1".into(),
            channel_id: "chan-a".into(),
            observed_at: DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            text: "Sec 3 Math @ Tampines $60/hr".into(),
            correction: None,
        }
    }

    #[test]
    fn completion_content_is_extracted() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"model":"m-1","choices":[{"message":{"role":"assistant","content":"  {\"a\":1} "}}]}"#,
        )
        .expect("envelope");
        let out = content_from_response(resp, "fallback").expect("content");
        assert_eq!(out.model, "m-1");
        assert_eq!(out.raw, "{\"a\":1}");
    }

    #[test]
    fn empty_completion_is_malformed() {
        let resp: ChatResponse =
            serde_json::from_str(r#"{"choices":[]}"#).expect("envelope");
        assert!(matches!(
            content_from_response(resp, "m"),
            Err(InferenceError::Malformed(_))
        ));
    }

    #[test]
    fn prompts_carry_channel_context_and_correction() {
        let prompt = user_prompt(&request());
        assert!(prompt.contains("channel: chan-a"));
        assert!(prompt.contains("2026-03-02T08:00:00+00:00"));
        let follow_up = correction_prompt(&Correction {
            previous_output: "{".into(),
            problem: "invalid json".into(),
        });
        assert!(follow_up.contains("invalid json"));
        assert!(default_system_prompt().contains("schema_version (always 2)"));
    }

    #[test]
    fn every_http_failure_is_unavailability() {
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 401,
            url: "http://x".into(),
            body: "bad key".into(),
        });
        assert!(matches!(err, InferenceError::Unavailable(m) if m.contains("401")));
    }
}
