//! Download guard and raw comment writer.
//!
//! [`DownloadGuard::download`] allows at most one fetch per
//! (entity, comment id) within the recent-download window, writes the
//! serialized stream through a [`CommentStore`] and hands the file to the
//! overlay encoder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use danmu_core::config::{Config, DownloadConfig, OverlayConfig};
use danmu_core::{EntityId, EntityKind, EntityRef, Error, Result};
use tracing::{debug, info, warn};

use crate::cache::TtlCache;

use super::comments;
use super::host::{CommentStore, OverlayEncoder, OverlayRequest};
use super::provider::DanmakuProvider;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<dir>/<stem>.<provider_key>.xml` next to the media file.
pub fn raw_comment_path(media_path: &Path, provider_key: &str) -> Option<PathBuf> {
    let stem = media_path.file_stem()?.to_string_lossy();
    let dir = media_path.parent().unwrap_or_else(|| Path::new(""));
    Some(dir.join(format!("{stem}.{provider_key}.xml")))
}

/// `<dir>/<stem>.chs[<provider_key>_danmu].ass` next to the media file.
pub fn overlay_path(media_path: &Path, provider_key: &str) -> Option<PathBuf> {
    let stem = media_path.file_stem()?.to_string_lossy();
    let dir = media_path.parent().unwrap_or_else(|| Path::new(""));
    Some(dir.join(format!("{stem}.chs[{provider_key}_danmu].ass")))
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// [`CommentStore`] writing next to the media file.
///
/// Files are written to a temporary sibling and renamed into place.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCommentStore;

#[async_trait]
impl CommentStore for FsCommentStore {
    async fn write(&self, entity: &EntityRef, provider_key: &str, bytes: &[u8]) -> Result<PathBuf> {
        let media_path = entity
            .media_path()
            .ok_or_else(|| Error::missing_field(entity.id, "path"))?;
        let path = raw_comment_path(media_path, provider_key)
            .ok_or_else(|| Error::missing_field(entity.id, "path"))?;

        let tmp = path.with_extension("xml.part");
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), bytes = bytes.len(), "Wrote comment file");
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Result of a guarded download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Written { path: PathBuf, bytes: usize },
    /// The same comment id was fetched for the entity recently.
    Skipped,
}

/// Recent-download guard plus writer.
pub struct DownloadGuard {
    recent: TtlCache<(EntityId, String), ()>,
    config: DownloadConfig,
    overlay_style: OverlayConfig,
    store: Arc<dyn CommentStore>,
    overlay: Option<Arc<dyn OverlayEncoder>>,
}

impl DownloadGuard {
    pub fn new(
        config: &Config,
        store: Arc<dyn CommentStore>,
        overlay: Option<Arc<dyn OverlayEncoder>>,
    ) -> Self {
        Self {
            recent: TtlCache::new(config.download.recent_episode_ttl()),
            config: config.download.clone(),
            overlay_style: config.overlay.clone(),
            store,
            overlay,
        }
    }

    /// Marker lifetime: short for movies, long for seasons and episodes.
    fn marker_ttl(&self, entity: &EntityRef) -> Duration {
        match entity.kind {
            EntityKind::Movie => self.config.recent_movie_ttl(),
            _ => self.config.recent_episode_ttl(),
        }
    }

    /// Whether a recent-download marker exists for the pair.
    pub fn is_recent(&self, entity: EntityId, comment_id: &str) -> bool {
        self.recent.contains(&(entity, comment_id.to_string()))
    }

    /// Fetch and persist the comments behind `comment_id` for `entity`.
    ///
    /// The marker is set before the fetch and removed again on any error,
    /// so only successful downloads suppress later attempts. An empty or
    /// implausibly small stream is reported as [`Error::EmptyResult`].
    pub async fn download(
        &self,
        provider: &dyn DanmakuProvider,
        entity: &EntityRef,
        comment_id: &str,
        ignore_guard: bool,
    ) -> Result<DownloadOutcome> {
        let key = (entity.id, comment_id.to_string());
        let ttl = self.marker_ttl(entity);

        if ignore_guard {
            self.recent.insert_with_ttl(key.clone(), (), ttl);
        } else if !self.recent.insert_if_absent(key.clone(), (), ttl) {
            info!(
                provider = provider.name(),
                entity = %entity,
                comment_id,
                "Comments fetched recently; skipping"
            );
            return Ok(DownloadOutcome::Skipped);
        }

        match self.fetch_and_write(provider, entity, comment_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.recent.remove(&key);
                Err(e)
            }
        }
    }

    async fn fetch_and_write(
        &self,
        provider: &dyn DanmakuProvider,
        entity: &EntityRef,
        comment_id: &str,
    ) -> Result<DownloadOutcome> {
        let stream = provider
            .get_comment_stream(entity, comment_id)
            .await?
            .ok_or_else(|| Error::empty(provider.name(), "no comment stream returned"))?;

        let bytes = comments::to_xml(&stream);
        if bytes.len() < self.config.min_stream_bytes {
            info!(
                provider = provider.name(),
                entity = %entity,
                size = bytes.len(),
                "Comment stream too small; ignoring"
            );
            return Err(Error::empty(
                provider.name(),
                format!(
                    "stream is {} bytes, below the {} byte minimum",
                    bytes.len(),
                    self.config.min_stream_bytes
                ),
            ));
        }

        let path = self
            .store
            .write(entity, provider.provider_key(), &bytes)
            .await?;
        info!(
            provider = provider.name(),
            entity = %entity,
            comment_id,
            comments = stream.items.len(),
            path = %path.display(),
            "Comments downloaded"
        );

        let size = bytes.len();
        self.hand_off_overlay(entity, provider.provider_key(), &path, bytes)
            .await;

        Ok(DownloadOutcome::Written { path, bytes: size })
    }

    async fn hand_off_overlay(
        &self,
        entity: &EntityRef,
        provider_key: &str,
        raw_path: &Path,
        bytes: Vec<u8>,
    ) {
        if !self.overlay_style.enabled {
            return;
        }
        let Some(encoder) = &self.overlay else {
            return;
        };

        let output_path = entity
            .media_path()
            .and_then(|p| overlay_path(p, provider_key))
            .unwrap_or_else(|| raw_path.with_extension("ass"));

        let request = OverlayRequest {
            title: entity.name.clone(),
            provider_key: provider_key.to_string(),
            raw_path: raw_path.to_path_buf(),
            output_path,
            bytes,
            style: self.overlay_style.clone(),
        };

        if let Err(e) = encoder.encode(request).await {
            warn!(entity = %entity, error = %e, "Overlay encoding failed");
        }
    }
}
