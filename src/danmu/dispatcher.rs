//! Batch classification and per-entity processing.
//!
//! The [`Dispatcher`] receives debounced batches from the
//! [`EventQueue`](super::EventQueue), classifies every event by entity kind
//! and intent, and processes the groups in a fixed order:
//!
//! 1. movie adds, movie updates
//! 2. season adds, episode adds
//! 3. series updates (fanned out to their seasons as follow-up events)
//! 4. season updates, episode updates
//! 5. movie forces, season forces, episode forces
//!
//! Adds are deferred: an Add only leaves a pending marker, and the Update
//! that the host sends right after it is processed as the effective Add.
//!
//! Per entity, providers are tried in registry order. Recoverable failures
//! fall through to the next provider; a throttled provider aborts the loop
//! for that entity; nothing aborts the batch.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use danmu_core::{
    BatchId, EntityId, EntityKind, EntityRef, Error, EventType, LibraryEvent, Result,
};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::TtlCache;

use super::context::DanmuContext;
use super::download::DownloadOutcome;
use super::matching::{reconcile_episodes, MatchPass, MatchState, ReconcileOutcome, SkipReason};
use super::provider::{DanmakuProvider, ProviderMedia};
use super::queue::BatchHandler;

type Provider = Arc<dyn DanmakuProvider>;

/// What to do after one provider attempt.
enum Next {
    TryNext,
    Stop,
}

/// Events of one batch grouped by entity kind and effective intent.
#[derive(Default)]
struct Classified {
    movie_adds: Vec<EntityRef>,
    movie_updates: Vec<EntityRef>,
    movie_forces: Vec<EntityRef>,
    series_updates: Vec<EntityRef>,
    season_adds: Vec<EntityRef>,
    season_updates: Vec<EntityRef>,
    season_forces: Vec<EntityRef>,
    episode_adds: Vec<EntityRef>,
    episode_updates: Vec<EntityRef>,
    episode_forces: Vec<EntityRef>,
}

fn push_unique(group: &mut Vec<EntityRef>, entity: EntityRef) {
    if !group.iter().any(|e| e.id == entity.id) {
        group.push(entity);
    }
}

/// Drop updates for entities that are already processed as adds.
fn drop_handled(updates: &mut Vec<EntityRef>, adds: &[EntityRef]) {
    let handled: HashSet<EntityId> = adds.iter().map(|e| e.id).collect();
    updates.retain(|e| !handled.contains(&e.id));
}

/// Classifies batches and drives matching and downloads per entity.
pub struct Dispatcher {
    ctx: DanmuContext,
    pending_adds: TtlCache<EntityId, LibraryEvent>,
    season_media: TtlCache<(EntityId, &'static str), ProviderMedia>,
}

impl Dispatcher {
    pub fn new(ctx: DanmuContext) -> Self {
        let pending_ttl = ctx.config.queue.pending_add_ttl();
        Self {
            ctx,
            pending_adds: TtlCache::new(pending_ttl),
            season_media: TtlCache::new(std::time::Duration::from_secs(30 * 60)),
        }
    }

    pub fn context(&self) -> &DanmuContext {
        &self.ctx
    }

    /// Whether an Add for `id` is waiting for its Update.
    pub fn has_pending_add(&self, id: EntityId) -> bool {
        self.pending_adds.contains(&id)
    }

    // -----------------------------------------------------------------------
    // Batch entry point
    // -----------------------------------------------------------------------

    /// Process one batch and return follow-up events for the queue.
    pub async fn dispatch(&self, batch: Vec<LibraryEvent>) -> Vec<LibraryEvent> {
        let batch_id = BatchId::new();
        let span = info_span!("batch", id = %batch_id, events = batch.len());

        async move {
            self.pending_adds.cleanup_expired();
            self.season_media.cleanup_expired();

            let mut groups = self.classify(batch);
            drop_handled(&mut groups.movie_updates, &groups.movie_adds);
            drop_handled(&mut groups.season_updates, &groups.season_adds);
            drop_handled(&mut groups.episode_updates, &groups.episode_adds);

            self.for_each_entity("movie add", groups.movie_adds, |e| self.add_movie(e))
                .await;
            self.for_each_entity("movie update", groups.movie_updates, |e| {
                self.update_movie(e)
            })
            .await;
            self.for_each_entity("season add", groups.season_adds, |e| self.add_season(e))
                .await;
            self.for_each_entity("episode add", groups.episode_adds, |e| {
                self.update_episode(e)
            })
            .await;

            let follow_ups = self.fan_out_series(groups.series_updates).await;

            self.for_each_entity("season update", groups.season_updates, |e| {
                self.update_season(e)
            })
            .await;
            self.for_each_entity("episode update", groups.episode_updates, |e| {
                self.update_episode(e)
            })
            .await;
            self.for_each_entity("movie force", groups.movie_forces, |e| self.force_movie(e))
                .await;
            self.for_each_entity("season force", groups.season_forces, |e| {
                self.force_season(e)
            })
            .await;
            self.for_each_entity("episode force", groups.episode_forces, |e| {
                self.force_episode(e)
            })
            .await;

            follow_ups
        }
        .instrument(span)
        .await
    }

    fn classify(&self, batch: Vec<LibraryEvent>) -> Classified {
        let mut groups = Classified::default();

        for event in batch {
            let entity = &event.entity;
            if self.ctx.options.is_danmaku_disabled(entity) {
                debug!(entity = %entity.id, "Danmaku disabled for library; ignoring event");
                continue;
            }

            match (entity.kind, event.event_type) {
                (EntityKind::Series, EventType::Update) => {
                    push_unique(&mut groups.series_updates, event.entity)
                }
                (EntityKind::Series, _) => {
                    debug!(entity = %entity.id, event = %event.event_type, "Ignoring series event")
                }
                (_, EventType::Add) => {
                    debug!(entity = %entity.id, kind = %entity.kind, "Deferring add until its update");
                    self.pending_adds.insert(entity.id, event);
                }
                (kind, EventType::Update) => {
                    let effective_add = self.pending_adds.remove(&entity.id).is_some();
                    let group = match (kind, effective_add) {
                        (EntityKind::Movie, true) => &mut groups.movie_adds,
                        (EntityKind::Movie, false) => &mut groups.movie_updates,
                        (EntityKind::Season, true) => &mut groups.season_adds,
                        (EntityKind::Season, false) => &mut groups.season_updates,
                        (_, true) => &mut groups.episode_adds,
                        (_, false) => &mut groups.episode_updates,
                    };
                    push_unique(group, event.entity);
                }
                (EntityKind::Movie, EventType::Force) => {
                    push_unique(&mut groups.movie_forces, event.entity)
                }
                (EntityKind::Season, EventType::Force) => {
                    push_unique(&mut groups.season_forces, event.entity)
                }
                (_, EventType::Force) => push_unique(&mut groups.episode_forces, event.entity),
            }
        }

        groups
    }

    /// Run `process` for every entity of a group, bounded by
    /// `dispatch.max_concurrent_entities`. Errors stop at the entity.
    async fn for_each_entity<'a, F, Fut>(
        &'a self,
        group: &'static str,
        entities: Vec<EntityRef>,
        process: F,
    ) where
        F: Fn(EntityRef) -> Fut,
        Fut: Future<Output = Result<()>> + 'a,
    {
        if entities.is_empty() {
            return;
        }
        info!(group, count = entities.len(), "Processing entities");

        let limit = self.ctx.config.dispatch.max_concurrent_entities.max(1);
        stream::iter(entities)
            .for_each_concurrent(limit, |entity| {
                let id = entity.id;
                let label = entity.to_string();
                let work = process(entity);
                async move {
                    if self.ctx.cancel.is_cancelled() {
                        return;
                    }
                    if let Err(e) = work.await {
                        log_entity_error(group, id, &label, &e);
                    }
                }
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Await a provider call unless shutdown is requested first.
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    async fn download(
        &self,
        provider: &Provider,
        entity: &EntityRef,
        comment_id: &str,
        ignore_guard: bool,
    ) -> Result<DownloadOutcome> {
        self.call(
            self.ctx
                .downloads
                .download(provider.as_ref(), entity, comment_id, ignore_guard),
        )
        .await
    }

    /// Current state of `entity` in the host library.
    async fn refresh(&self, entity: &EntityRef) -> Result<Option<EntityRef>> {
        let fresh = self.ctx.library.get_entity(entity.id).await?;
        if fresh.is_none() {
            debug!(entity = %entity.id, "Entity no longer in library; skipping");
        }
        Ok(fresh)
    }

    async fn save_provider_ids(&self, entity: &EntityRef) -> Result<()> {
        self.ctx
            .library
            .save_provider_ids(entity.id, &entity.provider_ids)
            .await
    }

    /// Make `provider` the only provider recorded on `entity` and persist.
    async fn force_save_provider_id(
        &self,
        entity: &mut EntityRef,
        provider: &Provider,
        value: &str,
    ) -> Result<()> {
        info!(entity = %entity.id, provider = provider.name(), value, "Saving provider id");
        entity.provider_ids.replace_exclusive(
            self.ctx.registry.provider_keys(),
            provider.provider_key(),
            value,
        );
        self.save_provider_ids(entity).await
    }

    /// Decide how the provider loop continues after one attempt.
    fn after_attempt(
        &self,
        provider: &Provider,
        entity: &EntityRef,
        attempt: Result<MatchState>,
    ) -> Result<Next> {
        match attempt {
            Ok(state) if state.is_fetched() => {
                if self.ctx.config.dispatch.search_all_sources {
                    Ok(Next::TryNext)
                } else {
                    Ok(Next::Stop)
                }
            }
            Ok(_) => Ok(Next::TryNext),
            Err(e) if e.stops_provider_loop() || e.is_fatal_to_entity() => Err(e),
            Err(e) => {
                warn!(
                    provider = provider.name(),
                    entity = %entity,
                    error = %e,
                    "Provider attempt failed; trying next provider"
                );
                Ok(Next::TryNext)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Movies
    // -----------------------------------------------------------------------

    /// Effective Add: match the movie against every provider.
    pub async fn add_movie(&self, movie: EntityRef) -> Result<()> {
        let Some(mut movie) = self.refresh(&movie).await? else {
            return Ok(());
        };
        self.match_movie(&mut movie).await
    }

    async fn match_movie(&self, movie: &mut EntityRef) -> Result<()> {
        for provider in self.ctx.registry.providers() {
            let attempt = self.match_movie_with(provider, movie).await;
            match self.after_attempt(provider, movie, attempt)? {
                Next::Stop => break,
                Next::TryNext => continue,
            }
        }
        Ok(())
    }

    async fn match_movie_with(&self, provider: &Provider, movie: &mut EntityRef) -> Result<MatchState> {
        let mut pass = MatchPass::new(provider.name(), movie.id);
        pass.advance(MatchState::Searching);

        let Some(media_id) = self.call(provider.resolve_media_id(movie)).await? else {
            return Ok(pass.fail("no search hit passed the filters"));
        };
        pass.advance(MatchState::Resolved(media_id.clone()));

        let Some(media) = self.call(provider.get_media(movie, &media_id)).await? else {
            return Ok(pass.fail("media lookup returned nothing"));
        };
        if movie
            .provider_ids
            .set(provider.provider_key(), media.external_id.as_str())
        {
            self.save_provider_ids(movie).await?;
        }

        self.fetch_single(provider, movie, &media, false, pass).await
    }

    /// Resolve the playable unit of single-unit media and download it.
    async fn fetch_single(
        &self,
        provider: &Provider,
        entity: &EntityRef,
        media: &ProviderMedia,
        ignore_guard: bool,
        mut pass: MatchPass,
    ) -> Result<MatchState> {
        let Some(playable) = media.playable_id() else {
            return Ok(pass.fail("media has no playable unit"));
        };
        let Some(episode) = self.call(provider.get_episode(entity, playable)).await? else {
            return Ok(pass.fail("episode lookup returned nothing"));
        };
        pass.advance(MatchState::EpisodesPaired(1));

        self.download(provider, entity, &episode.comment_id, ignore_guard)
            .await?;
        Ok(pass.fetched(1))
    }

    /// Plain Update: refresh from the providers that already matched, or run
    /// full matching when none has.
    pub async fn update_movie(&self, movie: EntityRef) -> Result<()> {
        let Some(mut movie) = self.refresh(&movie).await? else {
            return Ok(());
        };

        let matched: Vec<&Provider> = self
            .ctx
            .registry
            .providers()
            .iter()
            .filter(|p| movie.provider_ids.contains(p.provider_key()))
            .collect();
        if matched.is_empty() {
            debug!(entity = %movie, "No stored provider id; running full match");
            return self.match_movie(&mut movie).await;
        }

        for provider in matched {
            let attempt = self.refresh_movie_with(provider, &movie).await;
            match self.after_attempt(provider, &movie, attempt)? {
                Next::Stop => break,
                Next::TryNext => continue,
            }
        }
        Ok(())
    }

    async fn refresh_movie_with(&self, provider: &Provider, movie: &EntityRef) -> Result<MatchState> {
        let mut pass = MatchPass::new(provider.name(), movie.id);
        let media_id = movie
            .provider_ids
            .get(provider.provider_key())
            .unwrap_or_default()
            .to_string();
        pass.advance(MatchState::Resolved(media_id.clone()));

        let Some(media) = self.call(provider.get_media(movie, &media_id)).await? else {
            return Ok(pass.fail("media lookup returned nothing"));
        };
        self.fetch_single(provider, movie, &media, false, pass).await
    }

    /// Force: re-fetch from the provider recorded on the event's entity,
    /// ignoring the recent-download marker.
    pub async fn force_movie(&self, requested: EntityRef) -> Result<()> {
        let Some(provider) = self.ctx.registry.selected_for(&requested).cloned() else {
            info!(entity = %requested, "Forced refresh without a provider id; nothing to do");
            return Ok(());
        };
        let media_id = requested
            .provider_ids
            .get(provider.provider_key())
            .unwrap_or_default()
            .to_string();
        let mut movie = self.refresh(&requested).await?.unwrap_or(requested);

        let mut pass = MatchPass::new(provider.name(), movie.id);
        pass.advance(MatchState::Resolved(media_id.clone()));
        let Some(media) = self.call(provider.get_media(&movie, &media_id)).await? else {
            pass.fail("media lookup returned nothing");
            return Ok(());
        };
        self.force_save_provider_id(&mut movie, &provider, &media.external_id)
            .await?;
        self.fetch_single(&provider, &movie, &media, true, pass)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Series
    // -----------------------------------------------------------------------

    /// Series are never matched themselves; their seasons are re-queued.
    async fn fan_out_series(&self, series: Vec<EntityRef>) -> Vec<LibraryEvent> {
        let mut follow_ups = Vec::new();
        for show in series {
            match self.ctx.library.seasons_of(show.id).await {
                Ok(seasons) => {
                    info!(entity = %show, seasons = seasons.len(), "Fanning out series update");
                    follow_ups.extend(seasons.into_iter().map(LibraryEvent::update));
                }
                Err(e) => log_entity_error("series update", show.id, &show.name, &e),
            }
        }
        follow_ups
    }

    // -----------------------------------------------------------------------
    // Seasons
    // -----------------------------------------------------------------------

    /// Effective Add: match the season, then download its episodes.
    pub async fn add_season(&self, season: EntityRef) -> Result<()> {
        self.refresh_season(season, false).await
    }

    /// Match a season (again, when `force`) and run the episode pass.
    ///
    /// Without `force`, providers that already have an id on the season are
    /// kept. The specials folder (season 0) is never matched.
    pub async fn refresh_season(&self, season: EntityRef, force: bool) -> Result<()> {
        let Some(mut season) = self.refresh(&season).await? else {
            return Ok(());
        };
        if season.index_number == Some(0) {
            info!(entity = %season.id, "Skipping specials season");
            return Ok(());
        }

        if force || !self.ctx.registry.has_any_provider_id(&season) {
            self.match_season(&mut season).await?;
        }
        self.season_episode_pass(season).await
    }

    /// Plain Update: download episodes from the providers matched to the
    /// season, matching it first if no provider has an id yet.
    pub async fn update_season(&self, season: EntityRef) -> Result<()> {
        let Some(mut season) = self.refresh(&season).await? else {
            return Ok(());
        };
        if !self.ctx.registry.has_any_provider_id(&season) {
            if season.index_number == Some(0) {
                debug!(entity = %season.id, "Specials season without provider id; skipping");
                return Ok(());
            }
            self.match_season(&mut season).await?;
        }
        self.season_episode_pass(season).await
    }

    /// Force: re-fetch every episode of a season from the provider recorded
    /// on the event.
    ///
    /// Episodes are paired by index alone, without count reconciliation, and
    /// downloaded past the recent-download marker. A failing episode does
    /// not stop the others.
    pub async fn force_season(&self, requested: EntityRef) -> Result<()> {
        let Some(provider) = self.ctx.registry.selected_for(&requested).cloned() else {
            info!(entity = %requested, "Forced refresh without a provider id; nothing to do");
            return Ok(());
        };
        let media_id = requested
            .provider_ids
            .get(provider.provider_key())
            .unwrap_or_default()
            .to_string();
        let mut season = self.refresh(&requested).await?.unwrap_or(requested);

        let mut pass = MatchPass::new(provider.name(), season.id);
        pass.advance(MatchState::Resolved(media_id.clone()));
        let Some(media) = self.call(provider.get_media(&season, &media_id)).await? else {
            pass.fail("media lookup returned nothing");
            return Ok(());
        };
        self.force_save_provider_id(&mut season, &provider, &media.external_id)
            .await?;

        let episodes = self.ctx.library.episodes_of(season.id).await?;
        let mut pairs = Vec::with_capacity(episodes.len());
        for episode in episodes {
            let index = match episode.index_number {
                Some(i) if i > 0 && !episode.is_special() => i,
                _ => {
                    debug!(entity = %episode.id, "Episode has no usable index; not paired");
                    continue;
                }
            };
            match media.episodes.get(index as usize - 1) {
                Some(remote) => pairs.push((episode, remote)),
                None => info!(
                    provider = provider.name(),
                    entity = %episode.id,
                    index,
                    provider_count = media.episodes.len(),
                    "Episode index beyond provider episode count; not paired"
                ),
            }
        }
        pass.advance(MatchState::EpisodesPaired(pairs.len()));

        let mut fetched = 0;
        for (mut episode, remote) in pairs {
            match self.download(&provider, &episode, &remote.comment_id, true).await {
                Ok(_) => fetched += 1,
                Err(e) if e.stops_provider_loop() => {
                    pass.fail(e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    info!(
                        provider = provider.name(),
                        entity = %episode,
                        error = %e,
                        "Episode download failed; continuing with the next episode"
                    );
                    continue;
                }
            }
            self.force_save_provider_id(&mut episode, &provider, &remote.external_id)
                .await?;
        }
        pass.fetched(fetched);
        Ok(())
    }

    /// Fill in the series title and year used to search for a season.
    async fn season_search_view(&self, season: &mut EntityRef) -> Result<()> {
        let Some(series_id) = season.parent_id else {
            return Ok(());
        };
        if let Some(series) = self.ctx.library.get_entity(series_id).await? {
            season.series_name = Some(series.name);
            if season.production_year.is_none() {
                season.production_year = series.production_year;
            }
        }
        Ok(())
    }

    /// Search every provider for the season and record the ids found.
    async fn match_season(&self, season: &mut EntityRef) -> Result<()> {
        self.season_search_view(season).await?;

        let mut changed = false;
        let mut outcome = Ok(());
        for provider in self.ctx.registry.providers() {
            match self.resolve_season_media(provider, season).await {
                Ok(Some(media)) => {
                    changed |= season
                        .provider_ids
                        .set(provider.provider_key(), media.external_id.as_str());
                    if !self.ctx.config.dispatch.search_all_sources {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if e.stops_provider_loop() => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => warn!(
                    provider = provider.name(),
                    entity = %season.id,
                    error = %e,
                    "Season match failed; trying next provider"
                ),
            }
        }

        if changed {
            self.save_provider_ids(season).await?;
        }
        outcome
    }

    async fn resolve_season_media(
        &self,
        provider: &Provider,
        season: &EntityRef,
    ) -> Result<Option<ProviderMedia>> {
        let mut pass = MatchPass::new(provider.name(), season.id);
        pass.advance(MatchState::Searching);
        let Some(media_id) = self.call(provider.resolve_media_id(season)).await? else {
            pass.fail("no search hit passed the filters");
            return Ok(None);
        };
        pass.advance(MatchState::Resolved(media_id.clone()));

        let media = self.call(provider.get_media(season, &media_id)).await?;
        if media.is_none() {
            pass.fail("media lookup returned nothing");
        }
        Ok(media)
    }

    /// Pair local episodes with each matched provider and download them.
    async fn season_episode_pass(&self, season: EntityRef) -> Result<()> {
        let episodes = self.ctx.library.episodes_of(season.id).await?;
        if episodes.is_empty() {
            info!(entity = %season.id, "Season has no episodes");
            return Ok(());
        }

        let mut updated: HashMap<EntityId, EntityRef> = HashMap::new();
        let outcome = self
            .season_provider_loop(&season, &episodes, &mut updated)
            .await;

        // Episode ids are persisted once, whatever happened above.
        for episode in updated.values() {
            if let Err(e) = self.save_provider_ids(episode).await {
                warn!(entity = %episode.id, error = %e, "Failed to save episode provider id");
            }
        }
        if !updated.is_empty() {
            info!(entity = %season.id, episodes = updated.len(), "Saved episode provider ids");
        }

        outcome
    }

    async fn season_provider_loop(
        &self,
        season: &EntityRef,
        episodes: &[EntityRef],
        updated: &mut HashMap<EntityId, EntityRef>,
    ) -> Result<()> {
        let search_all = self.ctx.config.dispatch.search_all_sources;
        let mut completed: HashSet<EntityId> = HashSet::new();

        for provider in self.ctx.registry.providers() {
            let Some(media_id) = season.provider_ids.get(provider.provider_key()) else {
                continue;
            };
            let mut pass = MatchPass::new(provider.name(), season.id);
            pass.advance(MatchState::Resolved(media_id.to_string()));

            let media = match self.call(provider.get_media(season, media_id)).await {
                Ok(Some(media)) => media,
                Ok(None) => {
                    pass.fail("media lookup returned nothing");
                    continue;
                }
                Err(e) if e.stops_provider_loop() => return Err(e),
                Err(e) => {
                    warn!(provider = provider.name(), entity = %season.id, error = %e, "Season media lookup failed");
                    pass.fail(e.to_string());
                    continue;
                }
            };

            let reconciliation = match reconcile_episodes(
                episodes,
                media.episodes.len(),
                self.ctx.config.dispatch.allow_partial_seasons,
            ) {
                ReconcileOutcome::Paired(r) => r,
                ReconcileOutcome::CountMismatch {
                    filtered,
                    unfiltered,
                    provider: remote,
                } => {
                    pass.fail(format!(
                        "episode count mismatch: local {filtered} ({unfiltered} with specials), provider {remote}"
                    ));
                    continue;
                }
            };
            if reconciliation.used_unfiltered {
                info!(provider = provider.name(), entity = %season.id, "Counting specials to match the provider's episode list");
            }
            for (idx, reason) in &reconciliation.skipped {
                let episode = &episodes[*idx];
                match reason {
                    SkipReason::MissingIndex => {
                        info!(provider = provider.name(), entity = %episode.id, "Episode has no index; not paired")
                    }
                    SkipReason::IndexBeyondProvider { index, provider_count } => info!(
                        provider = provider.name(),
                        entity = %episode.id,
                        index,
                        provider_count,
                        "Episode index beyond provider episode count; not paired"
                    ),
                }
            }
            pass.advance(MatchState::EpisodesPaired(reconciliation.pairs.len()));

            let mut fetched = 0;
            for pair in &reconciliation.pairs {
                let local = &episodes[pair.local];
                if !search_all && completed.contains(&local.id) {
                    continue;
                }
                let remote = &media.episodes[pair.remote];

                let mut episode = updated.get(&local.id).cloned().unwrap_or_else(|| local.clone());
                if episode
                    .provider_ids
                    .set(provider.provider_key(), remote.external_id.as_str())
                {
                    updated.insert(local.id, episode.clone());
                }

                match self.download(provider, &episode, &remote.comment_id, false).await {
                    Ok(_) => {
                        completed.insert(local.id);
                        fetched += 1;
                    }
                    Err(e) if e.stops_provider_loop() => return Err(e),
                    Err(e) => info!(
                        provider = provider.name(),
                        entity = %episode,
                        error = %e,
                        "Episode download failed; continuing with the next episode"
                    ),
                }
            }
            pass.fetched(fetched);

            if reconciliation.provider_short {
                info!(
                    provider = provider.name(),
                    entity = %season.id,
                    local = episodes.len(),
                    remote = media.episodes.len(),
                    "Provider has fewer episodes than the library; trying next provider"
                );
                continue;
            }
            if !search_all {
                break;
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Episodes
    // -----------------------------------------------------------------------

    /// Update (or effective Add) of a single episode.
    pub async fn update_episode(&self, episode: EntityRef) -> Result<()> {
        let Some(mut episode) = self.refresh(&episode).await? else {
            return Ok(());
        };

        for provider in self.ctx.registry.providers() {
            let attempt = self.update_episode_with(provider, &mut episode).await;
            match self.after_attempt(provider, &episode, attempt)? {
                Next::Stop => break,
                Next::TryNext => continue,
            }
        }
        Ok(())
    }

    async fn update_episode_with(
        &self,
        provider: &Provider,
        episode: &mut EntityRef,
    ) -> Result<MatchState> {
        let mut pass = MatchPass::new(provider.name(), episode.id);

        let episode_id = match episode.provider_ids.get(provider.provider_key()) {
            Some(id) => id.to_string(),
            None => match self.derive_episode_id(provider, episode).await? {
                Some(id) => id,
                None => return Ok(pass.fail("no episode id available")),
            },
        };
        pass.advance(MatchState::Resolved(episode_id.clone()));

        let Some(remote) = self.call(provider.get_episode(episode, &episode_id)).await? else {
            return Ok(pass.fail("episode lookup returned nothing"));
        };
        pass.advance(MatchState::EpisodesPaired(1));

        self.download(provider, episode, &remote.comment_id, false)
            .await?;
        Ok(pass.fetched(1))
    }

    /// Derive an episode's provider id from its season's media listing and
    /// record it on the episode.
    async fn derive_episode_id(
        &self,
        provider: &Provider,
        episode: &mut EntityRef,
    ) -> Result<Option<String>> {
        let season_id = episode
            .parent_id
            .ok_or_else(|| Error::missing_field(episode.id, "parent_id"))?;
        if episode.is_special() {
            return Err(Error::missing_field(episode.id, "parent_index_number"));
        }
        let index = episode
            .index_number
            .filter(|i| *i > 0)
            .ok_or_else(|| Error::missing_field(episode.id, "index_number"))?;

        let Some(mut season) = self.ctx.library.get_entity(season_id).await? else {
            debug!(entity = %episode.id, "Season not found in library");
            return Ok(None);
        };

        let media_id = match season.provider_ids.get(provider.provider_key()) {
            Some(id) => id.to_string(),
            None => {
                self.season_search_view(&mut season).await?;
                let Some(media) = self.resolve_season_media(provider, &season).await? else {
                    return Ok(None);
                };
                season
                    .provider_ids
                    .set(provider.provider_key(), media.external_id.as_str());
                self.save_provider_ids(&season).await?;
                media.external_id
            }
        };

        let media = match self.season_media.get(&(season.id, provider.name())) {
            Some(media) if media.external_id == media_id => media,
            _ => {
                let Some(media) = self.call(provider.get_media(&season, &media_id)).await? else {
                    return Ok(None);
                };
                self.season_media
                    .insert((season.id, provider.name()), media.clone());
                media
            }
        };

        let count = media.episodes.len();
        if index as usize > count {
            info!(
                provider = provider.name(),
                entity = %episode,
                index,
                count,
                "Episode index beyond provider episode count"
            );
            return Ok(None);
        }

        let episode_id = media.episodes[index as usize - 1].external_id.clone();
        self.force_save_provider_id(episode, provider, &episode_id)
            .await?;
        Ok(Some(episode_id))
    }

    /// Force: re-fetch one episode from the provider recorded on the event.
    ///
    /// The recorded id refers to the season's media on that provider.
    pub async fn force_episode(&self, requested: EntityRef) -> Result<()> {
        let Some(provider) = self.ctx.registry.selected_for(&requested).cloned() else {
            info!(entity = %requested, "Forced refresh without a provider id; nothing to do");
            return Ok(());
        };
        let media_id = requested
            .provider_ids
            .get(provider.provider_key())
            .unwrap_or_default()
            .to_string();
        let mut episode = self.refresh(&requested).await?.unwrap_or(requested);

        let season_id = episode
            .parent_id
            .ok_or_else(|| Error::missing_field(episode.id, "parent_id"))?;
        let mut season = self
            .ctx
            .library
            .get_entity(season_id)
            .await?
            .ok_or_else(|| Error::not_found("season", season_id))?;

        let mut pass = MatchPass::new(provider.name(), episode.id);
        pass.advance(MatchState::Resolved(media_id.clone()));
        let Some(media) = self.call(provider.get_media(&season, &media_id)).await? else {
            pass.fail("media lookup returned nothing");
            return Ok(());
        };
        self.force_save_provider_id(&mut season, &provider, &media.external_id)
            .await?;

        if episode.is_special() {
            return Err(Error::missing_field(episode.id, "parent_index_number"));
        }
        let index = episode
            .index_number
            .filter(|i| *i > 0)
            .ok_or_else(|| Error::missing_field(episode.id, "index_number"))?;
        let Some(remote) = media.episodes.get(index as usize - 1) else {
            pass.fail(format!(
                "episode {index} beyond provider episode count {}",
                media.episodes.len()
            ));
            return Ok(());
        };
        pass.advance(MatchState::EpisodesPaired(1));

        self.download(&provider, &episode, &remote.comment_id, true)
            .await?;
        pass.fetched(1);
        self.force_save_provider_id(&mut episode, &provider, &remote.external_id)
            .await
    }
}

#[async_trait]
impl BatchHandler for Dispatcher {
    async fn handle_batch(&self, batch: Vec<LibraryEvent>) -> Vec<LibraryEvent> {
        self.dispatch(batch).await
    }
}

fn log_entity_error(group: &str, id: EntityId, label: &str, err: &Error) {
    match err {
        Error::Throttled { provider } => error!(
            group,
            entity = %id,
            name = label,
            provider = %provider,
            "Provider signalled rate limiting; stopped trying providers for this entity"
        ),
        Error::Cancelled => debug!(group, entity = %id, "Processing cancelled"),
        e if e.is_fatal_to_entity() => {
            warn!(group, entity = %id, name = label, error = %e, "Skipping entity")
        }
        e => error!(group, entity = %id, name = label, error = %e, "Failed to process entity"),
    }
}
