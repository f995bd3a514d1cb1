//! Dandanplay comment provider.
//!
//! Talks to the dandanplay v2 open API. Every request is signed with the
//! configured application id and secret; without both the provider reports
//! itself unavailable and is left out of the registry.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use danmu_core::config::DandanConfig;
use danmu_core::{EntityRef, Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Url;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::danmu::provider::{
    CommentItem, CommentStream, DanmakuProvider, MediaCategory, ProviderEpisode, ProviderMedia,
    SearchHit,
};

use super::http::ProviderHttp;

pub const NAME: &str = "dandan";
pub const PROVIDER_KEY: &str = "DandanID";
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

const SEARCH_TTL: Duration = Duration::from_secs(5 * 60);
const MEDIA_TTL: Duration = Duration::from_secs(30 * 60);

// ---------------------------------------------------------------------------
// API response types (private)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    animes: Vec<Anime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Anime {
    anime_id: i64,
    anime_title: String,
    #[serde(rename = "type", default)]
    kind: String,
    start_date: Option<String>,
    episode_count: Option<u32>,
    #[serde(default)]
    episodes: Vec<AnimeEpisode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnimeEpisode {
    episode_id: i64,
    #[serde(default)]
    episode_title: String,
    #[serde(default)]
    episode_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BangumiResponse {
    #[serde(default)]
    success: bool,
    bangumi: Option<Anime>,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    cid: u64,
    /// `"time,mode,color,user"`
    p: String,
    m: String,
}

impl Anime {
    fn category(&self) -> MediaCategory {
        if self.kind.eq_ignore_ascii_case("movie") {
            MediaCategory::Movie
        } else {
            MediaCategory::Series
        }
    }

    fn year(&self) -> Option<u16> {
        self.start_date
            .as_deref()
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok())
    }
}

impl RawComment {
    fn into_item(self) -> Option<CommentItem> {
        let mut fields = self.p.split(',');
        let time = fields.next()?.trim().parse::<f64>().ok()?;
        let mode = fields.next().and_then(|m| m.trim().parse().ok()).unwrap_or(1);
        let color = fields.next().and_then(|c| c.trim().parse().ok()).unwrap_or(0xFF_FF_FF);
        let author = fields.next().unwrap_or_default().trim().to_string();

        Some(CommentItem {
            mode,
            color,
            author_hash: author,
            ..CommentItem::scrolling(self.cid, time, self.m)
        })
    }
}

/// Sign a request path the way the open API expects:
/// `base64(sha256(app_id + timestamp + path + secret))`.
fn signature(app_id: &str, timestamp: i64, path: &str, secret: &str) -> String {
    let digest = Sha256::digest(format!("{app_id}{timestamp}{path}{secret}").as_bytes());
    BASE64.encode(digest)
}

// ---------------------------------------------------------------------------
// Provider implementation
// ---------------------------------------------------------------------------

pub struct DandanProvider {
    http: ProviderHttp,
    config: DandanConfig,
    searches: TtlCache<String, Vec<SearchHit>>,
    media: TtlCache<String, Option<ProviderMedia>>,
}

impl DandanProvider {
    pub fn new(config: DandanConfig, min_interval: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Ok(Self {
            http: ProviderHttp::new(NAME, min_interval, headers)?,
            config,
            searches: TtlCache::new(SEARCH_TTL),
            media: TtlCache::new(MEDIA_TTL),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.http.min_interval()
    }

    /// Build a signed GET request for an API path.
    fn request(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::RequestBuilder> {
        let (Some(app_id), Some(secret)) = (
            self.config.app_id.as_deref().filter(|s| !s.is_empty()),
            self.config.app_secret.as_deref().filter(|s| !s.is_empty()),
        ) else {
            return Err(Error::Config("dandanplay app id and secret are required".into()));
        };

        let url = Url::parse(&format!("{}{path}", self.config.base_url.trim_end_matches('/')))
            .map_err(|e| Error::Config(format!("invalid dandanplay base url: {e}")))?;
        let timestamp = chrono::Utc::now().timestamp();
        let signature = signature(app_id, timestamp, url.path(), secret);

        Ok(self
            .http
            .client()
            .get(url)
            .query(query)
            .header("X-AppId", app_id)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature))
    }

    async fn fetch_search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let request = self.request("/api/v2/search/anime", &[("keyword", query.to_string())])?;
        let response: SearchResponse = self.http.json(request).await?;
        if !response.success {
            warn!(provider = NAME, query, "Search reported failure");
            return Ok(Vec::new());
        }

        Ok(response
            .animes
            .into_iter()
            .map(|anime| SearchHit {
                external_id: anime.anime_id.to_string(),
                category: anime.category(),
                year: anime.year(),
                episode_count: anime.episode_count,
                title: anime.anime_title,
            })
            .collect())
    }

    async fn fetch_media(&self, anime_id: i64) -> Result<Option<ProviderMedia>> {
        let request = self.request(&format!("/api/v2/bangumi/{anime_id}"), &[])?;
        let response: BangumiResponse = self.http.json(request).await?;
        let Some(anime) = response.bangumi.filter(|_| response.success) else {
            return Ok(None);
        };

        // Specials are numbered "S1", "S2"... and are not part of the season.
        let episodes = anime
            .episodes
            .into_iter()
            .filter(|ep| ep.episode_number.trim().parse::<i64>().is_ok_and(|n| n > 0))
            .map(|ep| ProviderEpisode {
                external_id: ep.episode_id.to_string(),
                comment_id: ep.episode_id.to_string(),
                title: ep.episode_title,
            })
            .collect();

        Ok(Some(ProviderMedia {
            external_id: anime.anime_id.to_string(),
            provider_key: PROVIDER_KEY.to_string(),
            primary_comment_id: None,
            episodes,
        }))
    }
}

fn positive_id(id: &str) -> Option<i64> {
    id.trim().parse::<i64>().ok().filter(|n| *n > 0)
}

#[async_trait]
impl DanmakuProvider for DandanProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn provider_key(&self) -> &'static str {
        PROVIDER_KEY
    }

    fn is_available(&self) -> bool {
        self.config.has_credentials()
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.searches
            .get_or_try_insert_with(query.to_string(), || self.fetch_search(query))
            .await
    }

    async fn get_media(&self, _entity: &EntityRef, media_id: &str) -> Result<Option<ProviderMedia>> {
        let Some(anime_id) = positive_id(media_id) else {
            debug!(provider = NAME, media_id, "Ignoring non-numeric media id");
            return Ok(None);
        };
        self.media
            .get_or_try_insert_with(media_id.trim().to_string(), || self.fetch_media(anime_id))
            .await
    }

    async fn get_episode(&self, _entity: &EntityRef, id: &str) -> Result<Option<ProviderEpisode>> {
        // Episode ids double as comment ids.
        Ok(positive_id(id).map(|episode_id| ProviderEpisode {
            external_id: episode_id.to_string(),
            comment_id: episode_id.to_string(),
            title: String::new(),
        }))
    }

    async fn get_comment_stream(
        &self,
        _entity: &EntityRef,
        comment_id: &str,
    ) -> Result<Option<CommentStream>> {
        let Some(episode_id) = positive_id(comment_id) else {
            return Ok(None);
        };
        let request = self.request(
            &format!("/api/v2/comment/{episode_id}"),
            &[
                ("withRelated", self.config.with_related.to_string()),
                ("chConvert", self.config.ch_convert.to_string()),
            ],
        )?;
        let response: CommentResponse = self.http.json(request).await?;

        let items = response
            .comments
            .into_iter()
            .filter_map(RawComment::into_item)
            .collect();
        Ok(Some(CommentStream {
            stream_key: episode_id.to_string(),
            items,
        }))
    }
}
