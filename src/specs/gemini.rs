use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// --- SCHEMA B: GENERATE-CONTENT WIRE TYPES ---

#[derive(Debug, Clone, Serialize)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,

    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,

    #[serde(rename = "generationConfig", skip_serializing_if = "Map::is_empty")]
    pub generation_config: Map<String, Value>,

    /// Hoisted out of custom params; lives at the request root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
        /// Set on response parts carrying reasoning rather than answer text.
        #[serde(default, skip_serializing_if = "is_false")]
        thought: bool,
    },
    InlineData {
        inline_data: GeminiInlineData,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiInlineData {
    pub mime_type: String,
    /// Base64 body, already stripped of its data-URL prefix.
    pub data: String,
}

/// --- SCHEMA B: STREAM CHUNK TYPES ---

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiChunk {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    /// Error embedded in an otherwise-200 stream.
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiCandidate {
    pub content: Option<GeminiContent>,
    #[serde(rename = "groundingMetadata")]
    pub grounding_metadata: Option<Value>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}
