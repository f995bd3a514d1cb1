//! Configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML by the
//! `danmu-sync` crate. Every section defaults sensibly so an empty file is a
//! valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub download: DownloadConfig,
    /// Provider order and enablement. Providers not listed keep their
    /// registration order and default enablement.
    pub providers: Vec<ProviderConfig>,
    pub dandan: DandanConfig,
    pub bilibili: BilibiliConfig,
    pub overlay: OverlayConfig,
}

impl Config {
    /// Look up the settings entry for a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Minimum request interval for a provider, falling back to `default`.
    pub fn provider_interval(&self, name: &str, default: Duration) -> Duration {
        self.provider(name)
            .and_then(|p| p.min_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for p in &self.providers {
            if p.enabled && p.name == "dandan" && !self.dandan.has_credentials() {
                warnings.push(
                    "provider 'dandan' is enabled but no app_id/app_secret is set".into(),
                );
            }
        }

        if self.overlay.enabled && self.overlay.line_count == 0 {
            warnings.push("overlay.line_count is 0; the overlay will show nothing".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Event debounce settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(default = "default_quiet_period")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_pending_add_ttl")]
    pub pending_add_ttl_secs: u64,
}

impl QueueConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn pending_add_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_add_ttl_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period(),
            pending_add_ttl_secs: default_pending_add_ttl(),
        }
    }
}

fn default_quiet_period() -> u64 {
    10_000
}

fn default_pending_add_ttl() -> u64 {
    30 * 60
}

/// Batch dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Keep trying providers after the first successful download.
    pub search_all_sources: bool,
    /// Upper bound on entities processed concurrently within one batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_entities: usize,
    /// Pair episodes even when the provider's episode count matches neither
    /// the filtered nor the unfiltered local count.
    pub allow_partial_seasons: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_all_sources: false,
            max_concurrent_entities: default_max_concurrent(),
            allow_partial_seasons: false,
        }
    }
}

fn default_max_concurrent() -> usize {
    1
}

/// Download guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Serialized streams smaller than this are treated as empty.
    #[serde(default = "default_min_stream_bytes")]
    pub min_stream_bytes: usize,
    #[serde(default = "default_recent_episode_ttl")]
    pub recent_episode_ttl_secs: u64,
    #[serde(default = "default_recent_movie_ttl")]
    pub recent_movie_ttl_secs: u64,
}

impl DownloadConfig {
    pub fn recent_episode_ttl(&self) -> Duration {
        Duration::from_secs(self.recent_episode_ttl_secs)
    }

    pub fn recent_movie_ttl(&self) -> Duration {
        Duration::from_secs(self.recent_movie_ttl_secs)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            min_stream_bytes: default_min_stream_bytes(),
            recent_episode_ttl_secs: default_recent_episode_ttl(),
            recent_movie_ttl_secs: default_recent_movie_ttl(),
        }
    }
}

fn default_min_stream_bytes() -> usize {
    1024
}

fn default_recent_episode_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_recent_movie_ttl() -> u64 {
    5 * 60
}

/// Order, enablement and pacing of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the provider's built-in minimum request interval.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Dandanplay open API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DandanConfig {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    #[serde(default = "default_dandan_base")]
    pub base_url: String,
    /// Include comments from related third-party sources.
    #[serde(default = "default_true")]
    pub with_related: bool,
    /// Chinese conversion mode: 0 none, 1 simplified, 2 traditional.
    pub ch_convert: u8,
}

impl DandanConfig {
    pub fn has_credentials(&self) -> bool {
        self.app_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.app_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl Default for DandanConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            base_url: default_dandan_base(),
            with_related: true,
            ch_convert: 0,
        }
    }
}

fn default_dandan_base() -> String {
    "https://api.dandanplay.net".into()
}

/// Bilibili web API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BilibiliConfig {
    #[serde(default = "default_bilibili_api")]
    pub api_base: String,
    #[serde(default = "default_bilibili_comment")]
    pub comment_base: String,
    /// Optional cookie sent with every request.
    pub cookie: Option<String>,
}

impl Default for BilibiliConfig {
    fn default() -> Self {
        Self {
            api_base: default_bilibili_api(),
            comment_base: default_bilibili_comment(),
            cookie: None,
        }
    }
}

fn default_bilibili_api() -> String {
    "https://api.bilibili.com".into()
}

fn default_bilibili_comment() -> String {
    "https://comment.bilibili.com".into()
}

/// Styling handed to the overlay encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    pub font: Option<String>,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_text_opacity")]
    pub text_opacity: f32,
    #[serde(default = "default_line_count")]
    pub line_count: u32,
    /// Scroll speed; the encoder receives `speed - 8` as its duration tune.
    #[serde(default = "default_speed")]
    pub speed: i32,
}

impl OverlayConfig {
    /// Duration tune passed to the encoder.
    pub fn tune_duration(&self) -> i32 {
        self.speed - 8
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            font: None,
            font_size: default_font_size(),
            text_opacity: default_text_opacity(),
            line_count: default_line_count(),
            speed: default_speed(),
        }
    }
}

fn default_font_size() -> u32 {
    25
}

fn default_text_opacity() -> f32 {
    1.0
}

fn default_line_count() -> u32 {
    10
}

fn default_speed() -> i32 {
    8
}
