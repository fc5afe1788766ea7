use crate::config::ProviderConfig;
use crate::constants::BLACKLIST_TTL_HOURS;
use crate::store::PipelineStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Owns key selection state: per-config usage cursors and the shared key
/// blacklist. Constructed per application/session and passed by reference;
/// no hidden module-level state. Concurrent sends against the same config
/// must be serialized by the caller.
pub struct CredentialPool {
    usage_index: HashMap<Uuid, usize>,
    blacklist: HashMap<String, DateTime<Utc>>,
    store: Option<Arc<dyn PipelineStore>>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self {
            usage_index: HashMap::new(),
            blacklist: HashMap::new(),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn PipelineStore>) -> Self {
        Self {
            usage_index: HashMap::new(),
            blacklist: HashMap::new(),
            store: Some(store),
        }
    }

    /// Loads the persisted blacklist. Best effort: a failed load starts with
    /// an empty blacklist rather than failing the session.
    pub async fn hydrate(&mut self) {
        let Some(store) = &self.store else { return };
        match store.load_blacklist().await {
            Ok(map) => {
                tracing::debug!("Hydrated key blacklist: {} entries", map.len());
                self.blacklist = map;
            }
            Err(e) => {
                tracing::warn!("Failed to load key blacklist: {}", e);
            }
        }
    }

    pub fn usage_index(&self, config: &ProviderConfig) -> usize {
        let raw = self.usage_index.get(&config.id).copied().unwrap_or(0);
        let len = config.api_keys.len();
        if len == 0 {
            0
        } else {
            raw.min(len - 1)
        }
    }

    /// A key is usable iff absent from the blacklist or its entry has
    /// expired. Expired entries are evicted here, lazily.
    pub fn is_blacklisted(&mut self, key: &str) -> bool {
        match self.blacklist.get(key) {
            Some(expiry) if *expiry > Utc::now() => true,
            Some(_) => {
                self.blacklist.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn blacklist_expiry(&self, key: &str) -> Option<DateTime<Utc>> {
        self.blacklist.get(key).copied()
    }

    /// Starting at the config's usage index, scans circularly through the
    /// key list once, skipping blank, excluded and blacklisted keys.
    pub fn select_key(
        &mut self,
        config: &ProviderConfig,
        excluded: &HashSet<String>,
    ) -> Option<usize> {
        let len = config.api_keys.len();
        if len == 0 {
            return None;
        }
        let start = self.usage_index(config);
        for offset in 0..len {
            let index = (start + offset) % len;
            let Some(key) = config.api_keys.get(index) else {
                continue;
            };
            if key.trim().is_empty() {
                continue;
            }
            if excluded.contains(key) {
                continue;
            }
            if self.is_blacklisted(key) {
                continue;
            }
            return Some(index);
        }
        None
    }

    /// HTTP 429: quarantines `key` for the full TTL (a repeat 429 resets the
    /// window), excludes it for the rest of this request, and advances the
    /// usage index to the next eligible key so the next attempt in the same
    /// call cycle uses a different one.
    pub fn on_rate_limited(
        &mut self,
        config: &ProviderConfig,
        key: &str,
        excluded: &mut HashSet<String>,
    ) {
        let expiry = Utc::now() + Duration::hours(BLACKLIST_TTL_HOURS);
        self.blacklist.insert(key.to_string(), expiry);
        excluded.insert(key.to_string());
        tracing::warn!(
            "[POOL] Key rate-limited on config {}; quarantined until {}",
            config.id,
            expiry
        );
        self.persist_blacklist();

        if let Some(next) = self.select_key(config, excluded) {
            self.usage_index.insert(config.id, next);
        }
    }

    /// HTTP 400/403: permanently removes `key` from the config and clamps
    /// the usage index back into bounds. The index is never advanced beyond
    /// that correction.
    pub fn on_invalid_key(
        &mut self,
        config: &mut ProviderConfig,
        key: &str,
        excluded: &mut HashSet<String>,
    ) {
        config.api_keys.remove(key);
        excluded.insert(key.to_string());
        tracing::warn!(
            "[POOL] Invalid key removed from config {} ({} remaining)",
            config.id,
            config.api_keys.len()
        );

        let len = config.api_keys.len();
        let entry = self.usage_index.entry(config.id).or_insert(0);
        if len == 0 {
            *entry = 0;
        } else if *entry >= len {
            *entry = 0;
        }
    }

    /// 2xx: pins the usage index to the key that worked. Successful keys are
    /// never rotated away speculatively; provider-side per-key quotas reset
    /// independently, so sticking with a working key beats wear-levelling.
    pub fn on_success(&mut self, config: &ProviderConfig, key_index: usize) {
        self.usage_index.insert(config.id, key_index);
    }

    /// Fire-and-forget snapshot persistence. Never blocks the retry loop.
    fn persist_blacklist(&self) {
        let Some(store) = &self.store else { return };
        let store = store.clone();
        let snapshot = self.blacklist.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_blacklist(snapshot).await {
                tracing::warn!("Failed to persist key blacklist: {}", e);
            }
        });
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}
