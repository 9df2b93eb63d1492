//! Bot-API broadcast/notification channel and the HTTP recipient matcher.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tap_core::CanonicalRecord;
use tap_storage::{HttpClient, HttpClientConfig, TokenBucketConfig};
use tracing::debug;

use crate::{
    AdapterError, BroadcastChannel, Notifier, OutboundMessage, RecipientMatch, RecipientMatcher,
};

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Base including the bot token, e.g. `https://api.telegram.org/bot<token>`.
    pub api_base: String,
    /// Public channel that receives broadcasts.
    pub broadcast_chat_id: String,
    pub timeout: Duration,
    /// Outbound messages per second across both sub-channels.
    pub messages_per_second: u32,
}

impl TelegramConfig {
    pub fn new(api_base: impl Into<String>, broadcast_chat_id: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            broadcast_chat_id: broadcast_chat_id.into(),
            timeout: Duration::from_secs(10),
            messages_per_second: 20,
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct DeleteMessage<'a> {
    chat_id: &'a str,
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    description: Option<String>,
}

fn message_id_from_reply(reply: BotReply) -> Result<String, AdapterError> {
    if !reply.ok {
        return Err(AdapterError::Rejected(
            reply.description.unwrap_or_else(|| "ok=false".to_string()),
        ));
    }
    reply
        .result
        .as_ref()
        .and_then(|r| r.get("message_id"))
        .and_then(JsonValue::as_i64)
        .map(|id| id.to_string())
        .ok_or_else(|| AdapterError::InvalidResponse("missing result.message_id".to_string()))
}

/// Posts through a Telegram-compatible bot API. Serves as both the public
/// broadcast channel and the direct-message notifier.
#[derive(Debug)]
pub struct TelegramChannel {
    http: HttpClient,
    api_base: String,
    broadcast_chat_id: String,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(format!("{}/{}", crate::CRATE_NAME, env!("CARGO_PKG_VERSION"))),
            global_concurrency: 4,
            token_bucket: Some(TokenBucketConfig {
                capacity: config.messages_per_second.max(1),
                refill_every: Duration::from_millis(1000 / u64::from(config.messages_per_second.max(1))),
            }),
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            broadcast_chat_id: config.broadcast_chat_id,
        })
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, AdapterError> {
        let url = format!("{}/sendMessage", self.api_base);
        let body = SendMessage {
            chat_id,
            text,
            disable_web_page_preview: true,
        };
        let resp = self.http.send(|client| client.post(&url).json(&body)).await?;
        let reply: BotReply = resp
            .json()
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;
        message_id_from_reply(reply)
    }
}

#[async_trait]
impl BroadcastChannel for TelegramChannel {
    async fn post(&self, message: &OutboundMessage) -> Result<String, AdapterError> {
        let id = self.send_text(&self.broadcast_chat_id, &message.text).await?;
        debug!(assignment_id = %message.assignment_id, message_id = %id, "broadcast posted");
        Ok(id)
    }

    async fn retract(&self, post_ref: &str) -> Result<(), AdapterError> {
        let message_id = post_ref
            .parse::<i64>()
            .map_err(|_| AdapterError::Rejected(format!("not a message id: {post_ref}")))?;
        let url = format!("{}/deleteMessage", self.api_base);
        let body = DeleteMessage {
            chat_id: &self.broadcast_chat_id,
            message_id,
        };
        let resp = self.http.send(|client| client.post(&url).json(&body)).await?;
        let reply: BotReply = resp
            .json()
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;
        if reply.ok {
            Ok(())
        } else {
            Err(AdapterError::Rejected(
                reply.description.unwrap_or_else(|| "ok=false".to_string()),
            ))
        }
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    async fn notify(
        &self,
        recipient: &str,
        message: &OutboundMessage,
    ) -> Result<String, AdapterError> {
        self.send_text(recipient, &message.text).await
    }
}

#[derive(Debug, Serialize)]
struct MatchRequest<'a> {
    record: &'a CanonicalRecord,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    #[serde(default)]
    matches: Vec<RecipientMatch>,
}

fn rank_matches(mut matches: Vec<RecipientMatch>, limit: usize) -> Vec<RecipientMatch> {
    matches.retain(|m| !m.recipient_id.trim().is_empty() && m.score.is_finite());
    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.recipient_id.cmp(&b.recipient_id))
    });
    let mut seen = HashSet::new();
    matches.retain(|m| seen.insert(m.recipient_id.clone()));
    matches.truncate(limit);
    matches
}

/// Calls an external scoring service: POST `{record, limit}` → `{matches: [...]}`.
#[derive(Debug)]
pub struct HttpRecipientMatcher {
    http: HttpClient,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRecipientMatcher {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(10),
            user_agent: Some(format!("{}/{}", crate::CRATE_NAME, env!("CARGO_PKG_VERSION"))),
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl RecipientMatcher for HttpRecipientMatcher {
    async fn match_recipients(
        &self,
        record: &CanonicalRecord,
        limit: usize,
    ) -> Result<Vec<RecipientMatch>, AdapterError> {
        let body = MatchRequest { record, limit };
        let resp = self
            .http
            .send(|client| {
                let builder = client.post(&self.endpoint).json(&body);
                match &self.api_key {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            })
            .await?;
        let parsed: MatchResponse = resp
            .json()
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;
        Ok(rank_matches(parsed.matches, limit))
    }
}
