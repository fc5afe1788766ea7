//! Streaming chat-completion pipeline: multi-key credential rotation,
//! provider-specific request projection, incremental SSE decoding, and
//! rate-adaptive delivery into a branching conversation tree.

pub mod config;
pub mod constants;
pub mod credentials;
pub mod engine;
pub mod logging;
pub mod projections;
pub mod providers;
pub mod reducer;
pub mod specs;
pub mod sse;
pub mod store;
pub mod str_utils;
pub mod throttle;
pub mod tree;
pub mod types;

pub use types::*;
