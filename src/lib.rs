//! danmu-sync - timed-comment (danmaku) enrichment for media libraries.
//!
//! The host library pushes change notifications into an
//! [`EventQueue`](danmu::queue::EventQueue); after a quiet period the batch is
//! handed to the [`Dispatcher`](danmu::dispatcher::Dispatcher), which matches
//! each entity against the configured providers and downloads the matching
//! comment streams next to the media files.

pub mod cache;
pub mod config;
pub mod danmu;
pub mod logging;
