use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 6)
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(format!("req_{:016x}", fastrand::u64(..)))
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 12)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// --- MESSAGE CONTENT ---

/// Plain text or an ordered multimodal parts array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    /// `url` is either a remote URL or a base64 data-URL.
    Image { url: String },
}

impl MessageContent {
    pub fn empty() -> Self {
        MessageContent::Text(String::new())
    }

    /// Flattens the content to plain text, ignoring image parts.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

/// One linearized conversation turn, the input unit of request projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// --- STREAM DELIVERY PAYLOADS ---

/// Full accumulated stream state at a point in time. Consumers repaint from
/// this rather than appending, so resent or reordered upstream fragments are
/// harmless.
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    pub node_id: Uuid,
    pub text: String,
    pub thoughts: String,
    pub grounding: Option<serde_json::Value>,
}

/// External sink for incremental delivery. `on_updated` is a full-state
/// repaint; `on_created` fires exactly once per stream, before any update.
pub trait StreamConsumer: Send + Sync {
    fn on_created(&self, node_id: Uuid, text: &str, thoughts: &str);
    fn on_updated(
        &self,
        node_id: Uuid,
        text: &str,
        thoughts: &str,
        grounding: Option<&serde_json::Value>,
    );
    fn on_error(&self, error: &ObservedError);
}

/// Terminal result of one turn. Cancellation is an outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { node_id: Uuid },
    Cancelled { node_id: Uuid },
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum AqueductError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Model error: {0}")]
    UpstreamModel(String),

    #[error("Stream parse error: {0}")]
    Parse(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: AqueductError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<AqueductError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl ObservedError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner, AqueductError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
