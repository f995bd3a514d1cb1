//! Interfaces implemented by the host library.
//!
//! The enrichment core never touches the host's storage directly. It reads
//! entities, writes provider ids back, persists comment files and requests
//! overlay encoding through the traits in this module.

use std::path::PathBuf;

use async_trait::async_trait;
use danmu_core::config::OverlayConfig;
use danmu_core::{EntityId, EntityKind, EntityRef, ProviderIds, Result};

/// Read access to library entities plus provider-id write-back.
#[async_trait]
pub trait LibraryStore: Send + Sync {
    /// Current state of an entity, or `None` if it no longer exists.
    async fn get_entity(&self, id: EntityId) -> Result<Option<EntityRef>>;

    /// Seasons of a series.
    async fn seasons_of(&self, series: EntityId) -> Result<Vec<EntityRef>>;

    /// Episodes of a season, in index order.
    async fn episodes_of(&self, season: EntityId) -> Result<Vec<EntityRef>>;

    /// Every entity of `kind` in the library.
    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRef>>;

    /// Replace the entity's provider-id map and persist its metadata.
    async fn save_provider_ids(&self, id: EntityId, ids: &ProviderIds) -> Result<()>;
}

/// Per-library switches.
pub trait LibraryOptions: Send + Sync {
    /// `true` when danmaku fetching is turned off for the entity's library.
    fn is_danmaku_disabled(&self, entity: &EntityRef) -> bool;
}

/// [`LibraryOptions`] with fetching enabled everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLibrariesEnabled;

impl LibraryOptions for AllLibrariesEnabled {
    fn is_danmaku_disabled(&self, _entity: &EntityRef) -> bool {
        false
    }
}

/// Durable storage for raw comment files.
#[async_trait]
pub trait CommentStore: Send + Sync {
    /// Write the serialized stream for `entity` as fetched from the provider
    /// keyed `provider_key`, returning the file path. Writing the same
    /// entity/provider pair again overwrites the previous file.
    async fn write(&self, entity: &EntityRef, provider_key: &str, bytes: &[u8]) -> Result<PathBuf>;
}

/// Everything the overlay encoder needs to render a subtitle track.
#[derive(Debug, Clone)]
pub struct OverlayRequest {
    pub title: String,
    pub provider_key: String,
    /// Raw comment file that was just written.
    pub raw_path: PathBuf,
    /// Suggested output path for the rendered overlay.
    pub output_path: PathBuf,
    pub bytes: Vec<u8>,
    pub style: OverlayConfig,
}

/// Turns a raw comment stream into a styled overlay file.
#[async_trait]
pub trait OverlayEncoder: Send + Sync {
    async fn encode(&self, request: OverlayRequest) -> Result<()>;
}
