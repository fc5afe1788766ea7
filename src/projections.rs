use crate::config::ProviderConfig;
use crate::constants::SUPPORTED_IMAGE_MIME_TYPES;
use crate::providers::ProviderKind;
use crate::specs::gemini::*;
use crate::specs::openai::*;
use crate::types::*;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

lazy_static! {
    static ref DATA_URL_RE: Regex =
        Regex::new(r"^data:([A-Za-z0-9.+-]+/[A-Za-z0-9.+-]+);base64,(.+)$")
            .expect("static regex must compile");
}

/// Pure projection from an abstract conversation to a provider wire body.
/// No I/O, no pool state; the same inputs always produce the same body.
pub struct RequestBuilder;

impl RequestBuilder {
    pub fn build(
        messages: &[ChatMessage],
        config: &ProviderConfig,
        overrides: &Map<String, Value>,
    ) -> Result<Value> {
        let mut messages = Self::cap_history(messages, config.max_history);
        Self::inject_system_prompt(&mut messages, config);

        let custom = Self::parse_custom_params(config);

        let body = match ProviderKind::from_base_url(&config.base_url) {
            ProviderKind::OpenAiCompat => {
                Self::project_openai(&messages, config, overrides, custom)?
            }
            ProviderKind::Gemini => Self::project_gemini(&messages, config, overrides, custom)?,
        };
        Ok(body)
    }

    /// Applies the config's message-count cap, keeping a leading system
    /// message so the cap never silently drops instructions.
    fn cap_history(messages: &[ChatMessage], max_history: Option<usize>) -> Vec<ChatMessage> {
        let Some(max) = max_history.filter(|m| *m > 0 && *m < messages.len()) else {
            return messages.to_vec();
        };

        match messages.first() {
            Some(system) if system.role == Role::System => {
                let tail_budget = max.saturating_sub(1);
                let tail_start = messages.len() - tail_budget;
                let mut capped = Vec::with_capacity(max);
                capped.push(system.clone());
                capped.extend_from_slice(&messages[tail_start..]);
                capped
            }
            _ => messages[messages.len() - max..].to_vec(),
        }
    }

    /// Prepends the config's custom system prompt to the first system
    /// message, or synthesizes one. Runs exactly once per request, before
    /// any provider branching.
    fn inject_system_prompt(messages: &mut Vec<ChatMessage>, config: &ProviderConfig) {
        let Some(prompt) = config
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        else {
            return;
        };

        match messages.iter_mut().find(|m| m.role == Role::System) {
            Some(system) => {
                let existing = system.content.to_text();
                let combined = if existing.is_empty() {
                    prompt.to_string()
                } else {
                    format!("{}\n\n{}", prompt, existing)
                };
                system.content = MessageContent::Text(combined);
            }
            None => {
                messages.insert(0, ChatMessage::text(Role::System, prompt));
            }
        }
    }

    /// Malformed custom params are logged and skipped; an optional-config
    /// formatting mistake never fails the whole request.
    fn parse_custom_params(config: &ProviderConfig) -> Map<String, Value> {
        let Some(raw) = config.custom_params.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Map::new();
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                tracing::warn!(
                    "[BUILD] custom_params is not a JSON object ({}), ignoring",
                    crate::str_utils::first_n_chars_lossy(&other.to_string(), 80)
                );
                Map::new()
            }
            Err(e) => {
                tracing::warn!("[BUILD] Malformed custom_params JSON, ignoring: {}", e);
                Map::new()
            }
        }
    }

    /// --- SCHEMA A ---

    fn project_openai(
        messages: &[ChatMessage],
        config: &ProviderConfig,
        overrides: &Map<String, Value>,
        custom: Map<String, Value>,
    ) -> Result<Value> {
        let mut extra = overrides.clone();
        extra.extend(custom);

        let request = OpenAiRequest {
            model: config.model_name.clone(),
            messages: messages.iter().map(Self::to_openai_message).collect(),
            stream: Some(config.use_streaming),
            temperature: config.temperature,
            top_p: config.top_p,
            extra,
        };
        Ok(serde_json::to_value(request).map_err(AqueductError::Serialization)?)
    }

    fn to_openai_message(message: &ChatMessage) -> OpenAiMessage {
        let content = match &message.content {
            MessageContent::Text(text) => OpenAiContent::String(text.clone()),
            MessageContent::Parts(parts) => OpenAiContent::Parts(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => OpenAiContentPart::Text { text: text.clone() },
                        ContentPart::Image { url } => OpenAiContentPart::ImageUrl {
                            image_url: OpenAiImageUrl { url: url.clone() },
                        },
                    })
                    .collect(),
            ),
        };
        match message.role {
            Role::System => OpenAiMessage::System {
                content: message.content.to_text(),
            },
            Role::User => OpenAiMessage::User { content },
            Role::Assistant => OpenAiMessage::Assistant { content },
        }
    }

    /// --- SCHEMA B ---

    fn project_gemini(
        messages: &[ChatMessage],
        config: &ProviderConfig,
        overrides: &Map<String, Value>,
        custom: Map<String, Value>,
    ) -> Result<Value> {
        let mut system_texts = Vec::new();
        let mut contents = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    let text = message.content.to_text();
                    if !text.is_empty() {
                        system_texts.push(text);
                    }
                }
                Role::User | Role::Assistant => {
                    let parts = Self::to_gemini_parts(&message.content);
                    if parts.is_empty() {
                        continue;
                    }
                    contents.push(GeminiContent {
                        role: Some(
                            match message.role {
                                Role::Assistant => "model",
                                _ => "user",
                            }
                            .to_string(),
                        ),
                        parts,
                    });
                }
            }
        }

        let system_instruction = if system_texts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text {
                    text: system_texts.join("\n\n"),
                    thought: false,
                }],
            })
        };

        let mut generation_config = Map::new();
        if let Some(t) = config.temperature {
            generation_config.insert("temperature".to_string(), serde_json::json!(t));
        }
        if let Some(p) = config.top_p {
            generation_config.insert("topP".to_string(), serde_json::json!(p));
        }

        // Overrides and custom params land in generationConfig, except
        // `tools`, which the wire schema wants at the request root.
        let mut tools = None;
        for (key, value) in overrides.iter().chain(custom.iter()) {
            if key == "tools" {
                tools = Some(value.clone());
            } else {
                generation_config.insert(key.clone(), value.clone());
            }
        }

        let request = GeminiRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
        };
        Ok(serde_json::to_value(request).map_err(AqueductError::Serialization)?)
    }

    fn to_gemini_parts(content: &MessageContent) -> Vec<GeminiPart> {
        match content {
            MessageContent::Text(text) => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![GeminiPart::Text {
                        text: text.clone(),
                        thought: false,
                    }]
                }
            }
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(GeminiPart::Text {
                        text: text.clone(),
                        thought: false,
                    }),
                    ContentPart::Image { url } => Self::data_url_to_inline(url),
                })
                .collect(),
        }
    }

    /// Extracts the base64 body from a data-URL. Unsupported or undecodable
    /// image parts are dropped with a diagnostic, never fatal.
    fn data_url_to_inline(url: &str) -> Option<GeminiPart> {
        let Some(caps) = DATA_URL_RE.captures(url) else {
            tracing::warn!(
                "[BUILD] Dropping image part that is not a base64 data-URL: {}",
                crate::str_utils::first_n_chars_lossy(url, 48)
            );
            return None;
        };
        let mime_type = caps[1].to_ascii_lowercase();
        if !SUPPORTED_IMAGE_MIME_TYPES.contains(&mime_type.as_str()) {
            tracing::warn!("[BUILD] Dropping image part with unsupported mime type: {}", mime_type);
            return None;
        }
        Some(GeminiPart::InlineData {
            inline_data: GeminiInlineData {
                mime_type,
                data: caps[2].to_string(),
            },
        })
    }
}
