use crate::config::ProviderConfig;
use crate::constants::{DONE_SENTINEL, GEMINI_URL_MARKERS};

/// Closed set of supported wire schemas. Detection happens once, here;
/// everything downstream branches on the enum, so adding a provider means
/// adding a variant plus its builder/reducer pair, not editing string
/// comparisons scattered through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Schema A: chat-completions body, `data:` SSE lines, `[DONE]` sentinel.
    OpenAiCompat,
    /// Schema B: contents/parts/generationConfig body, SSE candidates,
    /// stream end signalled by connection close.
    Gemini,
}

impl ProviderKind {
    pub fn from_base_url(base_url: &str) -> Self {
        let lowered = base_url.to_ascii_lowercase();
        if GEMINI_URL_MARKERS.iter().any(|m| lowered.contains(m)) {
            ProviderKind::Gemini
        } else {
            ProviderKind::OpenAiCompat
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompat => "openai-compat",
            ProviderKind::Gemini => "gemini",
        }
    }

    /// Full request URL for this config.
    pub fn endpoint(&self, config: &ProviderConfig, streaming: bool) -> String {
        let base = config.base_url.trim_end_matches('/');
        match self {
            ProviderKind::OpenAiCompat => format!("{}/chat/completions", base),
            ProviderKind::Gemini => {
                if streaming {
                    format!(
                        "{}/models/{}:streamGenerateContent?alt=sse",
                        base, config.model_name
                    )
                } else {
                    format!("{}/models/{}:generateContent", base, config.model_name)
                }
            }
        }
    }

    pub fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        key: &str,
    ) -> reqwest::RequestBuilder {
        match self {
            ProviderKind::OpenAiCompat => request.bearer_auth(key),
            ProviderKind::Gemini => request.header("x-goog-api-key", key),
        }
    }

    /// The sentinel payload that terminates the stream silently, if any.
    pub fn done_sentinel(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAiCompat => Some(DONE_SENTINEL),
            ProviderKind::Gemini => None,
        }
    }
}
