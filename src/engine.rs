use crate::config::ProviderConfig;
use crate::constants::{INVALID_KEY_STATUSES, MAX_STREAM_EVENTS, RATE_LIMIT_STATUS};
use crate::credentials::CredentialPool;
use crate::logging::StreamMetric;
use crate::projections::RequestBuilder;
use crate::providers::ProviderKind;
use crate::reducer::{ReduceSignal, ResponseReducer};
use crate::sse::SseEventCodec;
use crate::store::PipelineStore;
use crate::throttle::AdaptiveThrottler;
use crate::tree::ConversationTree;
use crate::types::*;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Anything the rotation loop can branch on. Abstracting the status lets
/// the loop run against synthetic responses in tests.
pub trait UpstreamStatus {
    fn status_code(&self) -> u16;
}

impl UpstreamStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

/// Terminal state of one send cycle. Exhaustion hands back the last
/// upstream response instead of a synthesized error, so callers can
/// distinguish "pool is dry, here is what the provider said" from a
/// transport failure. Rejection is any non-rotating HTTP error.
#[derive(Debug)]
pub enum SendOutcome<R> {
    Success { response: R, key_index: usize },
    Exhausted { response: R },
    Rejected { response: R },
}

/// Drives one HTTP call cycle across the config's key pool. Branches per
/// response status: 429 quarantines and rotates, 400/403 removes the key,
/// other non-2xx returns immediately, 2xx pins. Terminates after at most
/// one attempt per key: every failed attempt excludes its key.
pub async fn dispatch_with_rotation<R, F, Fut>(
    pool: &mut CredentialPool,
    config: &mut ProviderConfig,
    mut attempt: F,
) -> Result<SendOutcome<R>>
where
    R: UpstreamStatus,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut excluded = HashSet::new();
    let mut last: Option<R> = None;

    loop {
        let Some(index) = pool.select_key(config, &excluded) else {
            return match last {
                Some(response) => Ok(SendOutcome::Exhausted { response }),
                None => Err(AqueductError::Config(
                    "no usable API key (pool empty or fully quarantined)".to_string(),
                )
                .into()),
            };
        };
        let Some(key) = config.api_keys.get(index).map(String::from) else {
            return Err(AqueductError::Config(format!(
                "selected key index {} out of bounds",
                index
            ))
            .into());
        };

        let response = attempt(key.clone()).await?;
        let status = response.status_code();

        if (200..300).contains(&status) {
            pool.on_success(config, index);
            return Ok(SendOutcome::Success {
                response,
                key_index: index,
            });
        }
        if status == RATE_LIMIT_STATUS {
            tracing::warn!("[SEND] 429 on key index {}, rotating", index);
            pool.on_rate_limited(config, &key, &mut excluded);
            last = Some(response);
            continue;
        }
        if INVALID_KEY_STATUSES.contains(&status) {
            tracing::warn!("[SEND] {} on key index {}, removing key", status, index);
            pool.on_invalid_key(config, &key, &mut excluded);
            last = Some(response);
            continue;
        }
        return Ok(SendOutcome::Rejected { response });
    }
}

/// Orchestrates one conversation turn end to end: linearize the tree, build
/// the wire body, send with key rotation, decode and reduce the stream, and
/// deliver throttled updates to the consumer. At most one active stream per
/// conversation; starting a new turn cancels the previous one.
pub struct CompletionEngine {
    client: reqwest::Client,
    pool: tokio::sync::Mutex<CredentialPool>,
    store: Option<Arc<dyn PipelineStore>>,
    active: std::sync::Mutex<HashMap<ConversationId, CancellationToken>>,
}

impl CompletionEngine {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            pool: tokio::sync::Mutex::new(CredentialPool::new()),
            store: None,
            active: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Builds an engine whose pool and configs persist through `store`. The
    /// blacklist is hydrated up front; everything later is fire-and-forget.
    pub async fn with_store(store: Arc<dyn PipelineStore>) -> Self {
        let mut pool = CredentialPool::with_store(Arc::clone(&store));
        pool.hydrate().await;
        Self {
            client: reqwest::Client::new(),
            pool: tokio::sync::Mutex::new(pool),
            store: Some(store),
            active: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Cancels the in-flight turn for `conversation`, if any. Aborts the
    /// HTTP read, stops reduction, and silences the throttler.
    pub fn cancel(&self, conversation: &ConversationId) {
        if let Ok(active) = self.active.lock() {
            if let Some(token) = active.get(conversation) {
                tracing::info!("[ENGINE] Cancelling turn for {}", conversation.short());
                token.cancel();
            }
        }
    }

    /// Registers a fresh token for the conversation, cancelling whatever
    /// was running there before.
    fn register_token(&self, conversation: &ConversationId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut active) = self.active.lock() {
            if let Some(previous) = active.insert(conversation.clone(), token.clone()) {
                previous.cancel();
            }
        }
        token
    }

    /// Runs one turn against the node `tree.current_node` points at. A
    /// placeholder assistant node is created immediately and mutated in
    /// place as the stream arrives; its id is stable for the whole turn.
    pub async fn run_turn(
        &self,
        conversation: &ConversationId,
        tree: &mut ConversationTree,
        config: &mut ProviderConfig,
        overrides: &Map<String, Value>,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Result<TurnOutcome> {
        let request_id = RequestId::new();

        if config.model_name.trim().is_empty() {
            let err: ObservedError =
                AqueductError::Config("model name is not configured".to_string()).into();
            consumer.on_error(&err);
            return Err(err);
        }
        if config.api_keys.is_exhausted() {
            let err: ObservedError =
                AqueductError::Config("config has no usable API key".to_string()).into();
            consumer.on_error(&err);
            return Err(err);
        }
        let Some(target) = tree.current_node else {
            let err: ObservedError =
                AqueductError::Config("conversation has no current node".to_string()).into();
            consumer.on_error(&err);
            return Err(err);
        };

        let token = self.register_token(conversation);
        let kind = ProviderKind::from_base_url(&config.base_url);
        let messages = tree.path_to(target);
        let body = match RequestBuilder::build(&messages, config, overrides) {
            Ok(body) => body,
            Err(err) => {
                consumer.on_error(&err);
                return Err(err);
            }
        };

        let node_id = tree.insert_after(Some(target), Role::Assistant, MessageContent::empty(), None)?;
        if let Some(node) = tree.node_mut(node_id) {
            node.api_uuid = Some(config.id);
            node.api_model_id = Some(config.model_name.clone());
        }
        tree.current_node = Some(node_id);

        tracing::info!(
            "[ENGINE] {} -> {} ({}, streaming={})",
            request_id.short(),
            kind.name(),
            config.model_name,
            config.use_streaming
        );

        let url = kind.endpoint(config, config.use_streaming);
        let outcome = {
            let mut pool = self.pool.lock().await;
            let client = &self.client;
            let send = dispatch_with_rotation(&mut pool, config, |key| {
                let request = kind.apply_auth(client.post(&url).json(&body), &key);
                async move {
                    request
                        .send()
                        .await
                        .map_err(|e| AqueductError::Network(e).into())
                }
            });
            tokio::select! {
                _ = token.cancelled() => {
                    return Ok(TurnOutcome::Cancelled { node_id });
                }
                outcome = send => outcome,
            }
        };
        self.persist_config(config);

        let response = match outcome {
            Ok(SendOutcome::Success { response, .. }) => response,
            Ok(SendOutcome::Exhausted { response }) | Ok(SendOutcome::Rejected { response }) => {
                let status = response.status();
                let detail = match response.text().await {
                    Ok(text) => text,
                    Err(e) => format!("(unreadable body: {})", e),
                };
                let err = AqueductError::Upstream(status, detail).into();
                return Err(Self::fail_turn(tree, node_id, &consumer, err));
            }
            Err(err) => {
                return Err(Self::fail_turn(tree, node_id, &consumer, err));
            }
        };

        if config.use_streaming {
            self.drive_stream(&request_id, tree, node_id, kind, response, &token, consumer)
                .await
        } else {
            Self::reduce_full_body(tree, node_id, kind, response, consumer).await
        }
    }

    /// Streaming path: SSE frames -> reducer -> throttled consumer updates.
    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        &self,
        request_id: &RequestId,
        tree: &mut ConversationTree,
        node_id: Uuid,
        kind: ProviderKind,
        response: reqwest::Response,
        token: &CancellationToken,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Result<TurnOutcome> {
        let repaint = Arc::clone(&consumer);
        let throttler = AdaptiveThrottler::new(move |update: StreamUpdate| {
            repaint.on_updated(
                update.node_id,
                &update.text,
                &update.thoughts,
                update.grounding.as_ref(),
            );
        });

        let bytes = response
            .bytes_stream()
            .map_err(std::io::Error::other);
        let mut frames = FramedRead::new(StreamReader::new(bytes), SseEventCodec::new());

        let mut reducer = ResponseReducer::new(kind);
        let mut metric = StreamMetric::default();

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => {
                    throttler.cancel();
                    Self::sync_node(tree, node_id, &reducer);
                    tracing::info!("[ENGINE] {} cancelled mid-stream", request_id.short());
                    return Ok(TurnOutcome::Cancelled { node_id });
                }
                frame = frames.next() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            let payload = match frame {
                Ok(payload) => payload,
                Err(e) => {
                    throttler.cancel();
                    Self::sync_node(tree, node_id, &reducer);
                    let err = AqueductError::Io(e).into();
                    return Err(Self::fail_turn(tree, node_id, &consumer, err));
                }
            };

            metric.record_event();
            if metric.events as usize > MAX_STREAM_EVENTS {
                throttler.cancel();
                Self::sync_node(tree, node_id, &reducer);
                let err = AqueductError::Parse("stream exceeded event limit".to_string()).into();
                return Err(Self::fail_turn(tree, node_id, &consumer, err));
            }
            if kind.done_sentinel() == Some(payload.trim()) {
                break;
            }

            match reducer.reduce(&payload) {
                Ok(ReduceSignal::Created) => {
                    Self::sync_node(tree, node_id, &reducer);
                    consumer.on_created(node_id, reducer.answer(), reducer.thoughts());
                }
                Ok(ReduceSignal::Updated) => {
                    Self::sync_node(tree, node_id, &reducer);
                    throttler.enqueue(
                        StreamUpdate {
                            node_id,
                            text: reducer.answer().to_string(),
                            thoughts: reducer.thoughts().to_string(),
                            grounding: reducer.grounding().cloned(),
                        },
                        false,
                    );
                }
                Ok(ReduceSignal::Ignored) => {}
                Err(err) => {
                    throttler.cancel();
                    Self::sync_node(tree, node_id, &reducer);
                    return Err(Self::fail_turn(tree, node_id, &consumer, err));
                }
            }
        }

        throttler.flush(true);
        Self::sync_node(tree, node_id, &reducer);

        metric.answer_chars = reducer.answer().chars().count() as u64;
        metric.thought_chars = reducer.thoughts().chars().count() as u64;
        metric.parse_failures = reducer.parse_failures();
        metric.log_summary(request_id);

        Ok(TurnOutcome::Completed { node_id })
    }

    /// Non-streaming path: one body, one reduction, one repaint.
    async fn reduce_full_body(
        tree: &mut ConversationTree,
        node_id: Uuid,
        kind: ProviderKind,
        response: reqwest::Response,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Result<TurnOutcome> {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let err = AqueductError::Network(e).into();
                return Err(Self::fail_turn(tree, node_id, &consumer, err));
            }
        };

        let mut reducer = ResponseReducer::new(kind);
        match reducer.reduce_full(&body) {
            Ok(ReduceSignal::Created) | Ok(ReduceSignal::Updated) => {
                Self::sync_node(tree, node_id, &reducer);
                consumer.on_created(node_id, reducer.answer(), reducer.thoughts());
                consumer.on_updated(
                    node_id,
                    reducer.answer(),
                    reducer.thoughts(),
                    reducer.grounding(),
                );
                Ok(TurnOutcome::Completed { node_id })
            }
            Ok(ReduceSignal::Ignored) => {
                let err = AqueductError::Parse("response body carried no content".to_string()).into();
                Err(Self::fail_turn(tree, node_id, &consumer, err))
            }
            Err(err) => Err(Self::fail_turn(tree, node_id, &consumer, err)),
        }
    }

    /// Mirrors the reducer's accumulated state into the target node.
    fn sync_node(tree: &mut ConversationTree, node_id: Uuid, reducer: &ResponseReducer) {
        if let Some(node) = tree.node_mut(node_id) {
            node.content = MessageContent::Text(reducer.answer().to_string());
            node.thoughts_raw = reducer.thoughts().to_string();
            node.grounding_metadata = reducer.grounding().cloned();
            if let Some(model) = reducer.model_id() {
                node.api_model_id = Some(model.to_string());
            }
        }
    }

    /// Writes the error into the node without discarding accumulated text,
    /// then notifies the consumer.
    fn fail_turn(
        tree: &mut ConversationTree,
        node_id: Uuid,
        consumer: &Arc<dyn StreamConsumer>,
        err: ObservedError,
    ) -> ObservedError {
        if let Some(node) = tree.node_mut(node_id) {
            let accumulated = node.content.to_text();
            let shown = if accumulated.is_empty() {
                format!("[error] {}", err)
            } else {
                format!("{}\n\n[error] {}", accumulated, err)
            };
            node.content = MessageContent::Text(shown);
        }
        consumer.on_error(&err);
        err
    }

    /// Key removals and rotation state changes outlive the process.
    fn persist_config(&self, config: &ProviderConfig) {
        let Some(store) = &self.store else { return };
        let store = Arc::clone(store);
        let snapshot = config.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_configs(vec![snapshot]).await {
                tracing::warn!("Failed to persist provider config: {}", e);
            }
        });
    }
}

impl Default for CompletionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullConsumer;

    impl StreamConsumer for NullConsumer {
        fn on_created(&self, _: Uuid, _: &str, _: &str) {}
        fn on_updated(&self, _: Uuid, _: &str, _: &str, _: Option<&Value>) {}
        fn on_error(&self, _: &ObservedError) {}
    }

    fn seeded_tree() -> ConversationTree {
        let mut tree = ConversationTree::new();
        let root = tree
            .insert_after(None, Role::User, MessageContent::Text("hi".into()), None)
            .unwrap();
        tree.current_node = Some(root);
        tree
    }

    #[tokio::test]
    async fn missing_model_is_a_config_error() {
        let engine = CompletionEngine::new();
        let mut tree = seeded_tree();
        let mut config =
            ProviderConfig::new("https://api.example.com/v1", "").with_keys(["k"]);
        let err = engine
            .run_turn(
                &ConversationId("c1".into()),
                &mut tree,
                &mut config,
                &Map::new(),
                Arc::new(NullConsumer),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.inner, AqueductError::Config(_)));
        // No placeholder node was created.
        assert_eq!(tree.len(), 1);
    }

    #[tokio::test]
    async fn empty_key_pool_is_a_config_error() {
        let engine = CompletionEngine::new();
        let mut tree = seeded_tree();
        let mut config = ProviderConfig::new("https://api.example.com/v1", "gpt-4o");
        let err = engine
            .run_turn(
                &ConversationId("c1".into()),
                &mut tree,
                &mut config,
                &Map::new(),
                Arc::new(NullConsumer),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.inner, AqueductError::Config(_)));
    }

    #[tokio::test]
    async fn new_turn_cancels_previous_token_for_conversation() {
        let engine = CompletionEngine::new();
        let conversation = ConversationId("c1".into());
        let first = engine.register_token(&conversation);
        assert!(!first.is_cancelled());
        let second = engine.register_token(&conversation);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // Explicit cancel hits the active token.
        engine.cancel(&conversation);
        assert!(second.is_cancelled());
    }
}
