//! Whole-library scan for items that have no comments yet.
//!
//! Walks every movie, season and episode in the host library that no
//! provider has matched, and runs them through the same flows as change
//! events: movies are matched directly, episodes are handled through their
//! season, and each season is processed at most once.

use std::collections::HashSet;
use std::sync::Arc;

use danmu_core::{EntityId, EntityKind, EntityRef, Error, Result};
use tracing::{debug, error, info};

use super::dispatcher::Dispatcher;

/// Progress callback for scan operations.
pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send + Sync>;

/// Scan progress information.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanProgress {
    pub items_found: usize,
    pub items_processed: usize,
    /// Completion in percent, `0.0..=100.0`.
    pub percent: f64,
}

/// Totals of a finished scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items in libraries with comments disabled.
    pub skipped: usize,
}

/// Runs a full library scan through a [`Dispatcher`].
pub struct LibraryScanner {
    dispatcher: Arc<Dispatcher>,
    progress: Option<ProgressCallback>,
}

impl LibraryScanner {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    fn report(&self, found: usize, processed: usize) {
        if let Some(callback) = &self.progress {
            let percent = if found == 0 {
                100.0
            } else {
                processed as f64 / found as f64 * 100.0
            };
            callback(ScanProgress {
                items_found: found,
                items_processed: processed,
                percent,
            });
        }
    }

    /// Scan the library. Returns [`Error::Cancelled`] if shutdown is
    /// requested before the scan finishes.
    pub async fn run(&self) -> Result<ScanReport> {
        let ctx = self.dispatcher.context();

        let mut items = ctx.library.list_entities(EntityKind::Movie).await?;
        items.extend(ctx.library.list_entities(EntityKind::Season).await?);
        items.extend(ctx.library.list_entities(EntityKind::Episode).await?);
        items.retain(|item| !ctx.registry.has_any_provider_id(item));

        info!(
            providers = ctx.registry.len(),
            items = items.len(),
            "Scanning library for items without comments"
        );

        let total = items.len();
        let mut report = ScanReport {
            total,
            ..Default::default()
        };
        let mut seen_seasons: HashSet<EntityId> = HashSet::new();

        for (idx, item) in items.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(processed = idx, total, "Library scan cancelled");
                return Err(Error::Cancelled);
            }
            self.report(total, idx);

            if ctx.options.is_danmaku_disabled(&item) {
                report.skipped += 1;
                continue;
            }

            let label = item.to_string();
            match self.scan_item(item, &mut seen_seasons).await {
                Ok(()) => report.succeeded += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!(item = %label, error = %e, "Scan failed for item");
                    report.failed += 1;
                }
            }
        }

        self.report(total, total);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Library scan completed"
        );
        Ok(report)
    }

    async fn scan_item(&self, item: EntityRef, seen_seasons: &mut HashSet<EntityId>) -> Result<()> {
        match item.kind {
            EntityKind::Movie => self.dispatcher.add_movie(item).await,
            EntityKind::Season => {
                if !seen_seasons.insert(item.id) {
                    debug!(item = %item, "Season already scanned");
                    return Ok(());
                }
                self.dispatcher.refresh_season(item, false).await
            }
            EntityKind::Episode => {
                let season_id = item
                    .parent_id
                    .ok_or_else(|| Error::missing_field(item.id, "parent_id"))?;
                if !seen_seasons.insert(season_id) {
                    debug!(item = %item, "Season already scanned");
                    return Ok(());
                }
                let season = self
                    .dispatcher
                    .context()
                    .library
                    .get_entity(season_id)
                    .await?
                    .ok_or_else(|| Error::not_found("season", season_id))?;
                self.dispatcher.refresh_season(season, false).await
            }
            kind => {
                debug!(item = %item, %kind, "Ignoring item kind during scan");
                Ok(())
            }
        }
    }
}
