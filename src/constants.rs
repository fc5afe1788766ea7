/// Quarantine duration applied to a key after an HTTP 429.
pub const BLACKLIST_TTL_HOURS: i64 = 24;

/// Status that rotates the pool to the next key and quarantines the current one.
pub const RATE_LIMIT_STATUS: u16 = 429;

/// Statuses that permanently remove the current key from the config.
pub const INVALID_KEY_STATUSES: &[u16] = &[400, 403];

/// Schema-A stream terminator. Never parsed as an event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Image mime types accepted for Schema-B inline_data parts.
pub const SUPPORTED_IMAGE_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/heic",
    "image/heif",
];

/// Host fragments that identify a Gemini-compatible endpoint.
pub const GEMINI_URL_MARKERS: &[&str] = &[
    "generativelanguage.googleapis.com",
    "aiplatform.googleapis.com",
];

/// Hard ceiling on events per stream; a healthy completion never comes close.
pub const MAX_STREAM_EVENTS: usize = 100_000;

/// Maximum size of a single SSE event payload.
pub const MAX_EVENT_BYTES: usize = 10 * 1024 * 1024;

/// Delivery throttle bounds and smoothing.
pub const MIN_UPDATE_INTERVAL_MS: u64 = 50;
pub const MAX_UPDATE_INTERVAL_MS: u64 = 2_000;
/// Blend weight of the previous interval when recomputing (70/30 smoothing).
pub const INTERVAL_SMOOTHING: f64 = 0.7;
/// EMA weight of the newest sample for consumer execution cost.
pub const COST_EMA_ALPHA: f64 = 0.3;
/// EMA weight of the newest sample for timer firing lag.
pub const LAG_EMA_ALPHA: f64 = 0.3;
/// Number of recent flushes considered for the duty-cycle correction.
pub const DUTY_CYCLE_WINDOW: usize = 16;

/// Sqlite pragmas applied to the store pool.
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
