//! External collaborator contracts + HTTP-backed implementations.
//!
//! The pipeline only talks to the outside world through the traits in this
//! crate: the inference capability, lookup tables, the recipient matcher and
//! the broadcast/notification channels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tap_core::CanonicalRecord;
use tap_storage::FetchError;
use thiserror::Error;
use uuid::Uuid;

pub mod channels;
pub mod inference;
pub mod lookup;

pub use channels::{HttpRecipientMatcher, TelegramChannel, TelegramConfig};
pub use inference::{
    Correction, InferenceClient, InferenceConfig, InferenceError, InferenceRequest, InferenceResponse,
    OpenAiInferenceClient,
};
pub use lookup::{GeoLookup, GeoPoint, SectorTable, Taxonomy};

pub const CRATE_NAME: &str = "tap-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_))
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        if err.is_transient() {
            AdapterError::Unavailable(err.to_string())
        } else {
            AdapterError::Rejected(err.to_string())
        }
    }
}

/// Text rendered once per dispatch and handed to every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub assignment_id: Uuid,
    pub text: String,
    pub bumped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientMatch {
    pub recipient_id: String,
    pub score: f32,
}

/// Resolves who should hear about a record, best match first.
#[async_trait]
pub trait RecipientMatcher: Send + Sync {
    async fn match_recipients(
        &self,
        record: &CanonicalRecord,
        limit: usize,
    ) -> Result<Vec<RecipientMatch>, AdapterError>;
}

/// Public channel: post once, retract when the assignment closes.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Returns the channel's reference for the post.
    async fn post(&self, message: &OutboundMessage) -> Result<String, AdapterError>;

    async fn retract(&self, post_ref: &str) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        message: &OutboundMessage,
    ) -> Result<String, AdapterError>;
}
