//! Bilibili comment provider.
//!
//! Searches bangumi and film seasons through the web search API, lists
//! season episodes through the PGC endpoints and downloads the XML comment
//! pool of an episode's video part (`cid`).

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike};
use danmu_core::config::BilibiliConfig;
use danmu_core::{EntityRef, Error, Result};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, REFERER};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::danmu::comments;
use crate::danmu::provider::{
    CommentStream, DanmakuProvider, MediaCategory, ProviderEpisode, ProviderMedia, SearchHit,
};

use super::http::ProviderHttp;

pub const NAME: &str = "bilibili";
pub const PROVIDER_KEY: &str = "BilibiliID";
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

const SEARCH_TTL: Duration = Duration::from_secs(5 * 60);
const MEDIA_TTL: Duration = Duration::from_secs(30 * 60);

/// API code bilibili returns when it refuses a client for request volume.
const CODE_THROTTLED: i64 = -412;
/// Badge type of trailers in season listings.
const BADGE_TRAILER: i64 = 1;

static HIGHLIGHT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("highlight tag pattern"));

// ---------------------------------------------------------------------------
// API response types (private)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
    result: Option<T>,
}

impl<T> ApiResponse<T> {
    /// The payload, or `None` if the API reported an error.
    fn into_payload(self) -> Result<Option<T>> {
        match self.code {
            0 => Ok(self.data.or(self.result)),
            CODE_THROTTLED => Err(Error::throttled(NAME)),
            code => {
                warn!(provider = NAME, code, message = %self.message, "API returned an error");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(default)]
    result: Vec<SearchGroup>,
}

#[derive(Debug, Deserialize)]
struct SearchGroup {
    result_type: String,
    #[serde(default)]
    data: Vec<SearchMedia>,
}

#[derive(Debug, Deserialize)]
struct SearchMedia {
    #[serde(default)]
    season_id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    season_type_name: String,
    #[serde(default)]
    pubtime: i64,
    ep_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SeasonData {
    #[serde(default)]
    episodes: Vec<SeasonEpisode>,
}

#[derive(Debug, Clone, Deserialize)]
struct SeasonEpisode {
    id: i64,
    #[serde(default)]
    aid: i64,
    #[serde(default)]
    cid: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    long_title: String,
    #[serde(default)]
    badge_type: i64,
}

impl SearchMedia {
    fn into_hit(self) -> Option<SearchHit> {
        if self.season_id <= 0 {
            return None;
        }
        let category = if self.season_type_name == "电影" {
            MediaCategory::Movie
        } else {
            MediaCategory::Series
        };
        let year = DateTime::from_timestamp(self.pubtime, 0)
            .filter(|_| self.pubtime > 0)
            .and_then(|t| u16::try_from(t.year()).ok());

        Some(SearchHit {
            external_id: self.season_id.to_string(),
            title: strip_highlight(&self.title),
            category,
            year,
            episode_count: self.ep_size,
        })
    }
}

impl SeasonEpisode {
    /// Comment key: `"aid,cid"`.
    fn comment_id(&self) -> String {
        format!("{},{}", self.aid, self.cid)
    }

    fn into_provider_episode(self) -> ProviderEpisode {
        let title = match (self.title.trim(), self.long_title.trim()) {
            (t, "") => t.to_string(),
            (t, long) => format!("{t} {long}"),
        };
        ProviderEpisode {
            external_id: self.id.to_string(),
            comment_id: self.comment_id(),
            title,
        }
    }
}

/// Search titles wrap the matched keyword in `<em class="keyword">`.
fn strip_highlight(title: &str) -> String {
    HIGHLIGHT_TAG.replace_all(title, "").trim().to_string()
}

/// The video part id of a comment key (`"aid,cid"` or a bare `"cid"`).
fn cid_of(comment_id: &str) -> Option<i64> {
    comment_id
        .rsplit(',')
        .next()
        .and_then(|cid| cid.trim().parse::<i64>().ok())
        .filter(|cid| *cid > 0)
}

// ---------------------------------------------------------------------------
// Provider implementation
// ---------------------------------------------------------------------------

pub struct BilibiliProvider {
    http: ProviderHttp,
    config: BilibiliConfig,
    searches: TtlCache<String, Vec<SearchHit>>,
    seasons: TtlCache<String, Option<ProviderMedia>>,
    episodes: TtlCache<String, Option<ProviderEpisode>>,
}

impl BilibiliProvider {
    pub fn new(config: BilibiliConfig, min_interval: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
        headers.insert(REFERER, HeaderValue::from_static("https://www.bilibili.com/"));
        if let Some(cookie) = config.cookie.as_deref().filter(|c| !c.is_empty()) {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| Error::Config(format!("invalid bilibili cookie: {e}")))?;
            headers.insert(COOKIE, value);
        }

        Ok(Self {
            http: ProviderHttp::new(NAME, min_interval, headers)?,
            config,
            searches: TtlCache::new(SEARCH_TTL),
            seasons: TtlCache::new(MEDIA_TTL),
            episodes: TtlCache::new(MEDIA_TTL),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.http.min_interval()
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base.trim_end_matches('/'))
    }

    async fn fetch_search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let request = self
            .http
            .client()
            .get(self.api_url("/x/web-interface/search/all/v2"))
            .query(&[("keyword", query), ("platform", "pc"), ("order", "totalrank")]);
        let response: ApiResponse<SearchData> = self.http.json(request).await?;
        let Some(data) = response.into_payload()? else {
            return Ok(Vec::new());
        };

        let hits: Vec<SearchHit> = data
            .result
            .into_iter()
            .filter(|group| group.result_type == "media_bangumi" || group.result_type == "media_ft")
            .flat_map(|group| group.data)
            .filter_map(SearchMedia::into_hit)
            .collect();
        debug!(provider = NAME, query, hits = hits.len(), "Search finished");
        Ok(hits)
    }

    async fn fetch_episode_list(&self, param: &str, id: &str) -> Result<Option<Vec<SeasonEpisode>>> {
        let request = self
            .http
            .client()
            .get(self.api_url("/pgc/view/web/ep/list"))
            .query(&[(param, id)]);
        let response: ApiResponse<SeasonData> = self.http.json(request).await?;
        Ok(response.into_payload()?.map(|season| season.episodes))
    }

    async fn fetch_season(&self, season_id: &str) -> Result<Option<ProviderMedia>> {
        let Some(episodes) = self.fetch_episode_list("season_id", season_id).await? else {
            return Ok(None);
        };

        // Remember every episode so episode lookups can skip the network.
        for episode in &episodes {
            self.episodes.insert(
                episode.id.to_string(),
                Some(episode.clone().into_provider_episode()),
            );
        }

        let episodes = episodes
            .into_iter()
            .filter(|ep| ep.badge_type != BADGE_TRAILER)
            .map(SeasonEpisode::into_provider_episode)
            .collect();
        Ok(Some(ProviderMedia {
            external_id: season_id.to_string(),
            provider_key: PROVIDER_KEY.to_string(),
            primary_comment_id: None,
            episodes,
        }))
    }

    async fn fetch_episode(&self, episode_id: &str) -> Result<Option<ProviderEpisode>> {
        // The ep_id form returns the episode's whole season.
        let Some(episodes) = self.fetch_episode_list("ep_id", episode_id).await? else {
            return Ok(None);
        };
        Ok(episodes
            .into_iter()
            .find(|ep| ep.id.to_string() == episode_id)
            .map(SeasonEpisode::into_provider_episode))
    }
}

fn is_positive_id(id: &str) -> bool {
    id.trim().parse::<i64>().is_ok_and(|n| n > 0)
}

#[async_trait]
impl DanmakuProvider for BilibiliProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn provider_key(&self) -> &'static str {
        PROVIDER_KEY
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
        let media_id = media_id.trim();
        if !is_positive_id(media_id) {
            return Ok(None);
        }
        self.seasons
            .get_or_try_insert_with(media_id.to_string(), || self.fetch_season(media_id))
            .await
    }

    async fn get_episode(&self, _entity: &EntityRef, id: &str) -> Result<Option<ProviderEpisode>> {
        let id = id.trim();
        if id.contains(',') {
            // Already a resolved comment key.
            return Ok(cid_of(id).map(|_| ProviderEpisode {
                external_id: id.to_string(),
                comment_id: id.to_string(),
                title: String::new(),
            }));
        }
        if !is_positive_id(id) {
            return Ok(None);
        }
        self.episodes
            .get_or_try_insert_with(id.to_string(), || self.fetch_episode(id))
            .await
    }

    async fn get_comment_stream(
        &self,
        _entity: &EntityRef,
        comment_id: &str,
    ) -> Result<Option<CommentStream>> {
        let Some(cid) = cid_of(comment_id) else {
            debug!(provider = NAME, comment_id, "Comment id has no video part");
            return Ok(None);
        };
        let url = format!("{}/{cid}.xml", self.config.comment_base.trim_end_matches('/'));
        let xml = self.http.text(self.http.client().get(url)).await?;
        Ok(Some(comments::parse_xml(cid.to_string(), &xml)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_patterns_compile() {
        LazyLock::force(&HIGHLIGHT_TAG);
    }

    #[test]
    fn highlight_tags_are_stripped() {
        assert_eq!(
            strip_highlight(r#"<em class="keyword">三体</em> 第一季"#),
            "三体 第一季"
        );
    }

    #[test]
    fn search_media_category_and_year() {
        let film = SearchMedia {
            season_id: 12,
            title: "流浪<em class=\"keyword\">地球</em>".into(),
            season_type_name: "电影".into(),
            pubtime: 1_549_036_800, // 2019-02-01
            ep_size: Some(1),
        }
        .into_hit()
        .unwrap();
        assert_eq!(film.category, MediaCategory::Movie);
        assert_eq!(film.year, Some(2019));
        assert_eq!(film.title, "流浪地球");

        let show = SearchMedia {
            season_id: 13,
            title: "x".into(),
            season_type_name: "番剧".into(),
            pubtime: 0,
            ep_size: None,
        }
        .into_hit()
        .unwrap();
        assert_eq!(show.category, MediaCategory::Series);
        assert_eq!(show.year, None);
    }

    #[test]
    fn comment_keys() {
        assert_eq!(cid_of("170001,279786"), Some(279786));
        assert_eq!(cid_of("279786"), Some(279786));
        assert_eq!(cid_of("1,0"), None);
        assert_eq!(cid_of(""), None);
    }

    #[test]
    fn throttle_code_maps_to_throttled() {
        let resp: ApiResponse<SeasonData> =
            serde_json::from_str(r#"{"code":-412,"message":"请求被拦截"}"#).unwrap();
        assert!(matches!(resp.into_payload(), Err(Error::Throttled { .. })));

        let resp: ApiResponse<SeasonData> =
            serde_json::from_str(r#"{"code":-404,"message":"啥都木有"}"#).unwrap();
        assert!(resp.into_payload().unwrap().is_none());
    }
}
