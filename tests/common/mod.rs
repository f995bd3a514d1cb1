//! Shared test harness for integration tests.
//!
//! Provides an in-memory [`MemoryLibrary`], a scripted [`StubProvider`] and a
//! [`TestHarness`] that wires them into a [`Dispatcher`] writing comment
//! files into a temporary directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use danmu_core::config::Config;
use danmu_core::{EntityId, EntityKind, EntityRef, Error, ProviderIds, Result};
use danmu_sync::danmu::download::FsCommentStore;
use danmu_sync::danmu::host::{LibraryOptions, LibraryStore, OverlayEncoder, OverlayRequest};
use danmu_sync::danmu::provider::{
    CommentItem, CommentStream, DanmakuProvider, MediaCategory, ProviderEpisode, ProviderMedia,
    SearchHit,
};
use danmu_sync::danmu::{DanmuContext, Dispatcher, ProviderRegistry};

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

/// Host library kept in memory. Provider-id saves are applied and recorded.
#[derive(Default)]
pub struct MemoryLibrary {
    entities: Mutex<Vec<EntityRef>>,
    saves: Mutex<Vec<(EntityId, ProviderIds)>>,
}

impl MemoryLibrary {
    pub fn insert(&self, entity: EntityRef) -> EntityRef {
        let mut entities = self.entities.lock();
        entities.retain(|e| e.id != entity.id);
        entities.push(entity.clone());
        entity
    }

    pub fn remove(&self, id: EntityId) {
        self.entities.lock().retain(|e| e.id != id);
    }

    pub fn entity(&self, id: EntityId) -> EntityRef {
        self.entities
            .lock()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .expect("entity in library")
    }

    pub fn saves(&self) -> Vec<(EntityId, ProviderIds)> {
        self.saves.lock().clone()
    }

    pub fn saves_for(&self, id: EntityId) -> usize {
        self.saves.lock().iter().filter(|(e, _)| *e == id).count()
    }
}

#[async_trait]
impl LibraryStore for MemoryLibrary {
    async fn get_entity(&self, id: EntityId) -> Result<Option<EntityRef>> {
        Ok(self.entities.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn seasons_of(&self, series: EntityId) -> Result<Vec<EntityRef>> {
        Ok(self
            .entities
            .lock()
            .iter()
            .filter(|e| e.kind == EntityKind::Season && e.parent_id == Some(series))
            .cloned()
            .collect())
    }

    async fn episodes_of(&self, season: EntityId) -> Result<Vec<EntityRef>> {
        let mut episodes: Vec<EntityRef> = self
            .entities
            .lock()
            .iter()
            .filter(|e| e.kind == EntityKind::Episode && e.parent_id == Some(season))
            .cloned()
            .collect();
        episodes.sort_by_key(|e| e.index_number.unwrap_or(u32::MAX));
        Ok(episodes)
    }

    async fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRef>> {
        Ok(self
            .entities
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect())
    }

    async fn save_provider_ids(&self, id: EntityId, ids: &ProviderIds) -> Result<()> {
        let mut entities = self.entities.lock();
        let entity = entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::not_found("entity", id))?;
        entity.provider_ids = ids.clone();
        self.saves.lock().push((id, ids.clone()));
        Ok(())
    }
}

/// Options with a per-entity disable list.
#[derive(Default)]
pub struct DisabledEntities(pub Mutex<HashSet<EntityId>>);

impl LibraryOptions for DisabledEntities {
    fn is_danmaku_disabled(&self, entity: &EntityRef) -> bool {
        self.0.lock().contains(&entity.id)
    }
}

/// Overlay encoder that records its requests.
#[derive(Default)]
pub struct RecordingOverlay {
    pub requests: Mutex<Vec<OverlayRequest>>,
    pub fail: bool,
}

#[async_trait]
impl OverlayEncoder for RecordingOverlay {
    async fn encode(&self, request: OverlayRequest) -> Result<()> {
        self.requests.lock().push(request);
        if self.fail {
            return Err(Error::Internal("encoder exploded".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// A comment stream large enough to pass the default size threshold.
pub fn big_stream(key: &str) -> CommentStream {
    CommentStream {
        stream_key: key.to_string(),
        items: (0..60)
            .map(|i| CommentItem::scrolling(i, i as f64 * 1.5, format!("comment number {i}")))
            .collect(),
    }
}

/// Media with `count` episodes whose ids are `<prefix>-ep<n>`.
pub fn media(provider_key: &str, id: &str, count: usize) -> ProviderMedia {
    ProviderMedia {
        external_id: id.to_string(),
        provider_key: provider_key.to_string(),
        primary_comment_id: None,
        episodes: (1..=count)
            .map(|n| ProviderEpisode {
                external_id: format!("{id}-ep{n}"),
                comment_id: format!("{id}-c{n}"),
                title: format!("Episode {n}"),
            })
            .collect(),
    }
}

pub fn hit(id: &str, title: &str, category: MediaCategory, year: Option<u16>) -> SearchHit {
    SearchHit {
        external_id: id.to_string(),
        title: title.to_string(),
        category,
        year,
        episode_count: None,
    }
}

/// Scripted provider. Every comment id it knows yields [`big_stream`]
/// unless listed in `small_streams`.
pub struct StubProvider {
    name: &'static str,
    key: &'static str,
    pub hits: Mutex<Vec<SearchHit>>,
    pub media: Mutex<HashMap<String, ProviderMedia>>,
    pub small_streams: Mutex<HashSet<String>>,
    pub throttle_search: Mutex<bool>,
    pub throttle_streams: Mutex<bool>,
    pub stream_delay: Mutex<Option<Duration>>,
    pub search_calls: AtomicUsize,
    pub media_calls: AtomicUsize,
    pub fetched: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn new(name: &'static str, key: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            key,
            hits: Mutex::default(),
            media: Mutex::default(),
            small_streams: Mutex::default(),
            throttle_search: Mutex::new(false),
            throttle_streams: Mutex::new(false),
            stream_delay: Mutex::new(None),
            search_calls: AtomicUsize::new(0),
            media_calls: AtomicUsize::new(0),
            fetched: Mutex::default(),
        })
    }

    pub fn with_hit(self: Arc<Self>, hit: SearchHit) -> Arc<Self> {
        self.hits.lock().push(hit);
        self
    }

    pub fn with_media(self: Arc<Self>, media: ProviderMedia) -> Arc<Self> {
        self.media.lock().insert(media.external_id.clone(), media);
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn find_episode(&self, id: &str) -> Option<ProviderEpisode> {
        self.media
            .lock()
            .values()
            .flat_map(|m| m.episodes.iter())
            .find(|ep| ep.external_id == id || ep.comment_id == id)
            .cloned()
    }
}

#[async_trait]
impl DanmakuProvider for StubProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn provider_key(&self) -> &'static str {
        self.key
    }

    async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if *self.throttle_search.lock() {
            return Err(Error::throttled(self.name));
        }
        Ok(self.hits.lock().clone())
    }

    async fn get_media(&self, _entity: &EntityRef, media_id: &str) -> Result<Option<ProviderMedia>> {
        self.media_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.media.lock().get(media_id).cloned())
    }

    async fn get_episode(&self, _entity: &EntityRef, id: &str) -> Result<Option<ProviderEpisode>> {
        Ok(self.find_episode(id))
    }

    async fn get_comment_stream(
        &self,
        _entity: &EntityRef,
        comment_id: &str,
    ) -> Result<Option<CommentStream>> {
        let delay = *self.stream_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.throttle_streams.lock() {
            return Err(Error::throttled(self.name));
        }
        self.fetched.lock().push(comment_id.to_string());

        if self.small_streams.lock().contains(comment_id) {
            return Ok(Some(CommentStream {
                stream_key: comment_id.to_string(),
                items: vec![CommentItem::scrolling(1, 1.0, "hi")],
            }));
        }
        Ok(Some(big_stream(comment_id)))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A dispatcher over a [`MemoryLibrary`] that writes into a temp directory.
pub struct TestHarness {
    pub dispatcher: Arc<Dispatcher>,
    pub library: Arc<MemoryLibrary>,
    pub disabled: Arc<DisabledEntities>,
    pub overlay: Arc<RecordingOverlay>,
    pub dir: TempDir,
}

impl TestHarness {
    pub fn new(providers: Vec<Arc<StubProvider>>) -> Self {
        Self::with_config(providers, Config::default())
    }

    pub fn with_config(providers: Vec<Arc<StubProvider>>, config: Config) -> Self {
        Self::build(providers, config, RecordingOverlay::default())
    }

    pub fn build(
        providers: Vec<Arc<StubProvider>>,
        config: Config,
        overlay: RecordingOverlay,
    ) -> Self {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider);
        }

        let library = Arc::new(MemoryLibrary::default());
        let disabled = Arc::new(DisabledEntities::default());
        let overlay = Arc::new(overlay);
        let ctx = DanmuContext::new(
            config,
            registry,
            library.clone(),
            disabled.clone(),
            Arc::new(FsCommentStore),
            Some(overlay.clone() as Arc<dyn OverlayEncoder>),
        );

        Self {
            dispatcher: Arc::new(Dispatcher::new(ctx)),
            library,
            disabled,
            overlay,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Path of a (nonexistent) media file inside the temp directory.
    pub fn media_path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }

    pub fn add_movie(&self, name: &str, year: u16) -> EntityRef {
        let movie = EntityRef::movie(name)
            .with_year(year)
            .with_path(self.media_path(&format!("{name} ({year}).mkv")));
        self.library.insert(movie)
    }

    /// A series with one season and `count` episodes numbered from 1.
    pub fn add_show(&self, name: &str, year: u16, season: u32, count: u32) -> (EntityRef, EntityRef, Vec<EntityRef>) {
        let series = self.library.insert(EntityRef::series(name).with_year(year));
        let season_ref = self.library.insert(EntityRef::season(&series, season));
        let episodes = (1..=count)
            .map(|n| {
                let episode = EntityRef::episode(&season_ref, n)
                    .with_path(self.media_path(&format!("{name} S{season:02}E{n:02}.mkv")));
                self.library.insert(episode)
            })
            .collect();
        (series, season_ref, episodes)
    }

    pub fn comment_file(&self, media_file: &str, provider_key: &str) -> PathBuf {
        let stem = media_file.rsplit_once('.').map(|(s, _)| s).unwrap_or(media_file);
        self.dir.path().join(format!("{stem}.{provider_key}.xml"))
    }
}
