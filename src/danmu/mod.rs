//! Danmaku enrichment: provider clients, matching, debounced dispatch and
//! guarded downloads.
//!
//! This module contains:
//!
//! - [`provider`] - The [`DanmakuProvider`](provider::DanmakuProvider) trait and shared result types.
//! - [`providers`] - Concrete provider clients (Dandanplay, Bilibili).
//! - [`registry`] - Ordered, enable-filtered provider list.
//! - [`rate_limit`] - Per-provider minimum-interval gate.
//! - [`matching`] - Title normalization, hit selection and episode reconciliation.
//! - [`comments`] - Comment stream XML codec.
//! - [`download`] - Recent-download guard and raw comment writer.
//! - [`queue`] - Debounced event queue.
//! - [`dispatcher`] - Batch classification and per-entity processing.
//! - [`scan`] - Whole-library scan task.
//! - [`host`] - Traits implemented by the host library.

pub mod comments;
pub mod context;
pub mod dispatcher;
pub mod download;
pub mod host;
pub mod matching;
pub mod provider;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod scan;

pub use context::DanmuContext;
pub use dispatcher::Dispatcher;
pub use provider::DanmakuProvider;
pub use queue::EventQueue;
pub use registry::ProviderRegistry;
