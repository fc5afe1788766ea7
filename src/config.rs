use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One credential/model profile. `api_keys` accepts either a single string or
/// an ordered list on the wire; an emptied list leaves the config unusable
/// until repopulated, which callers must treat as a hard failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub id: Uuid,
    pub base_url: String,
    pub model_name: String,
    #[serde(default)]
    pub api_keys: ApiKeys,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default = "default_streaming")]
    pub use_streaming: bool,
    /// Opaque JSON merged into the request body at build time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_params: Option<String>,
    /// Message-count cap applied before projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_history: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_streaming() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            base_url: base_url.into(),
            model_name: model_name.into(),
            api_keys: ApiKeys::default(),
            temperature: None,
            top_p: None,
            use_streaming: true,
            custom_params: None,
            max_history: None,
            system_prompt: None,
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_keys = ApiKeys::Pool(keys.into_iter().map(Into::into).collect());
        self
    }
}

/// Single key or ordered multi-key pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ApiKeys {
    Single(String),
    Pool(Vec<String>),
}

impl Default for ApiKeys {
    fn default() -> Self {
        ApiKeys::Single(String::new())
    }
}

impl ApiKeys {
    pub fn len(&self) -> usize {
        match self {
            ApiKeys::Single(_) => 1,
            ApiKeys::Pool(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        match self {
            ApiKeys::Single(key) if index == 0 => Some(key.as_str()),
            ApiKeys::Single(_) => None,
            ApiKeys::Pool(keys) => keys.get(index).map(String::as_str),
        }
    }

    /// True when no key in the pool is non-blank.
    pub fn is_exhausted(&self) -> bool {
        match self {
            ApiKeys::Single(key) => key.trim().is_empty(),
            ApiKeys::Pool(keys) => keys.iter().all(|k| k.trim().is_empty()),
        }
    }

    /// Permanently removes a key. A single-string config degrades to an empty
    /// string rather than silently becoming a pool.
    pub fn remove(&mut self, key: &str) {
        match self {
            ApiKeys::Single(current) => {
                if current == key {
                    current.clear();
                }
            }
            ApiKeys::Pool(keys) => keys.retain(|k| k != key),
        }
    }
}
