use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// --- SCHEMA A: CHAT-COMPLETIONS WIRE TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Caller overrides and parsed custom params, merged at the root.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAiMessage {
    System { content: String },
    User { content: OpenAiContent },
    Assistant { content: OpenAiContent },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    String(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiImageUrl {
    pub url: String,
}

/// --- SCHEMA A: SSE CHUNK TYPES ---

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<OpenAiChunkChoice>,
    /// Top-level error embedded in a 200 stream.
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChunkChoice {
    #[serde(default)]
    pub delta: OpenAiDelta,
    pub finish_reason: Option<String>,
    /// Some aggregators attach per-choice errors instead of a top-level one.
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub reasoning: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl OpenAiDelta {
    /// Reasoning arrives under `reasoning_content` or `reasoning` depending
    /// on the upstream; both feed the thoughts accumulator, never the answer.
    pub fn reasoning_delta(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .or(self.reasoning.as_deref())
            .filter(|s| !s.is_empty())
    }
}
