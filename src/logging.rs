use crate::types::RequestId;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Safe to call more than once; later calls
/// are no-ops, which keeps test binaries from fighting over the registry.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aqueduct=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init()
        .ok();
}

/// Per-stream counters, logged once when the stream ends.
#[derive(Debug, Default, Clone)]
pub struct StreamMetric {
    pub events: u64,
    pub answer_chars: u64,
    pub thought_chars: u64,
    pub parse_failures: u64,
}

impl StreamMetric {
    pub fn record_event(&mut self) {
        self.events += 1;
    }

    pub fn log_summary(&self, request_id: &RequestId) {
        tracing::info!(
            "[STREAM] {} done: {} events, {} answer chars, {} thought chars, {} parse failures",
            request_id.short(),
            self.events,
            self.answer_chars,
            self.thought_chars,
            self.parse_failures,
        );
    }
}
