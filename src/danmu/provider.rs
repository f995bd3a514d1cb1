//! Trait definition and types for danmaku providers.
//!
//! This module defines the [`DanmakuProvider`] trait that every comment
//! source (Dandanplay, Bilibili, ...) implements, along with the shared data
//! types returned by provider queries.

use async_trait::async_trait;
use danmu_core::{EntityRef, Result};
use serde::{Deserialize, Serialize};

use super::matching;

// ---------------------------------------------------------------------------
// Search results
// ---------------------------------------------------------------------------

/// Coarse content category reported by a provider for a search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Movie,
    Series,
}

/// A single candidate returned from a provider search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Provider-specific media identifier.
    pub external_id: String,
    pub title: String,
    pub category: MediaCategory,
    pub year: Option<u16>,
    /// Number of episodes the provider claims, if reported.
    pub episode_count: Option<u32>,
}

// ---------------------------------------------------------------------------
// Media and episodes
// ---------------------------------------------------------------------------

/// One playable unit on the provider side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEpisode {
    pub external_id: String,
    /// Opaque key accepted by [`DanmakuProvider::get_comment_stream`].
    pub comment_id: String,
    pub title: String,
}

/// Full episode listing for a resolved media id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMedia {
    pub external_id: String,
    /// Provider-id key the id is stored under on the entity.
    pub provider_key: String,
    /// Comment key of the main feature, for single-unit media such as movies.
    pub primary_comment_id: Option<String>,
    pub episodes: Vec<ProviderEpisode>,
}

impl ProviderMedia {
    /// Identifier to feed into [`DanmakuProvider::get_episode`] for a
    /// single-unit entity: the primary comment id, else the first episode.
    pub fn playable_id(&self) -> Option<&str> {
        self.primary_comment_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.episodes.first().map(|e| e.comment_id.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Comment streams
// ---------------------------------------------------------------------------

/// One timed comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentItem {
    pub id: u64,
    /// Offset into the video, in seconds.
    pub time: f64,
    /// Display mode: 1 scrolling, 4 bottom, 5 top.
    pub mode: u8,
    pub font_size: u32,
    /// 24-bit RGB colour.
    pub color: u32,
    /// Unix timestamp the comment was posted at.
    pub sent_at: i64,
    pub pool: u8,
    pub author_hash: String,
    pub text: String,
}

impl CommentItem {
    /// A scrolling white comment with default styling.
    pub fn scrolling(id: u64, time: f64, text: impl Into<String>) -> Self {
        Self {
            id,
            time,
            mode: 1,
            font_size: 25,
            color: 0xFF_FF_FF,
            sent_at: 0,
            pool: 0,
            author_hash: String::new(),
            text: text.into(),
        }
    }
}

/// A downloaded comment stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentStream {
    /// Provider-side key of the stream (usually the comment id).
    pub stream_key: String,
    pub items: Vec<CommentItem>,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A source of timed comments.
///
/// Implementations own their rate limiter and response caches; every
/// network call goes through both. Lookups that simply find nothing return
/// `Ok(None)` or an empty list. Remote rate limiting is reported as
/// [`Error::Throttled`](danmu_core::Error::Throttled).
#[async_trait]
pub trait DanmakuProvider: Send + Sync {
    /// Short, lowercase identifier (e.g. `"bilibili"`).
    fn name(&self) -> &'static str;

    /// Key under which this provider's ids are stored on entities
    /// (e.g. `"BilibiliID"`).
    fn provider_key(&self) -> &'static str;

    /// Returns `true` when the provider is configured and ready to serve
    /// requests.
    fn is_available(&self) -> bool {
        true
    }

    /// Whether the provider is used when the configuration does not mention
    /// it.
    fn default_enabled(&self) -> bool {
        true
    }

    /// Free-text title search. Hits are returned in provider relevance order.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;

    /// Search for `entity` and return the id of the best acceptable hit.
    async fn resolve_media_id(&self, entity: &EntityRef) -> Result<Option<String>> {
        matching::resolve_media_id(self, entity).await
    }

    /// Fetch the episode listing for a resolved media id.
    async fn get_media(&self, entity: &EntityRef, media_id: &str) -> Result<Option<ProviderMedia>>;

    /// Resolve an episode (or media) id to its final comment id.
    async fn get_episode(&self, entity: &EntityRef, id: &str) -> Result<Option<ProviderEpisode>>;

    /// Download the comments behind `comment_id`.
    async fn get_comment_stream(
        &self,
        entity: &EntityRef,
        comment_id: &str,
    ) -> Result<Option<CommentStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(n: u32) -> ProviderEpisode {
        ProviderEpisode {
            external_id: format!("ep{n}"),
            comment_id: format!("c{n}"),
            title: n.to_string(),
        }
    }

    #[test]
    fn playable_id_prefers_primary_comment() {
        let media = ProviderMedia {
            external_id: "m".into(),
            provider_key: "DandanID".into(),
            primary_comment_id: Some("main".into()),
            episodes: vec![episode(1)],
        };
        assert_eq!(media.playable_id(), Some("main"));
    }

    #[test]
    fn playable_id_falls_back_to_first_episode() {
        let media = ProviderMedia {
            external_id: "m".into(),
            provider_key: "DandanID".into(),
            primary_comment_id: Some(String::new()),
            episodes: vec![episode(1), episode(2)],
        };
        assert_eq!(media.playable_id(), Some("c1"));

        let empty = ProviderMedia {
            episodes: Vec::new(),
            primary_comment_id: None,
            ..media
        };
        assert_eq!(empty.playable_id(), None);
    }
}
