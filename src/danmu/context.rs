//! Shared enrichment context.
//!
//! [`DanmuContext`] is constructed once by the host and handed to the
//! [`Dispatcher`](super::Dispatcher) and [`LibraryScanner`](super::scan::LibraryScanner).
//! Everything in it is behind an `Arc`, so clones are cheap.

use std::sync::Arc;

use danmu_core::config::Config;
use tokio_util::sync::CancellationToken;

use super::download::DownloadGuard;
use super::host::{CommentStore, LibraryOptions, LibraryStore, OverlayEncoder};
use super::registry::ProviderRegistry;

/// Collaborators and settings shared by all enrichment components.
#[derive(Clone)]
pub struct DanmuContext {
    pub config: Arc<Config>,
    pub registry: Arc<ProviderRegistry>,
    pub library: Arc<dyn LibraryStore>,
    pub options: Arc<dyn LibraryOptions>,
    pub downloads: Arc<DownloadGuard>,
    /// Cancelled on shutdown; in-flight provider calls are abandoned.
    pub cancel: CancellationToken,
}

impl DanmuContext {
    pub fn new(
        config: Config,
        registry: ProviderRegistry,
        library: Arc<dyn LibraryStore>,
        options: Arc<dyn LibraryOptions>,
        comments: Arc<dyn CommentStore>,
        overlay: Option<Arc<dyn OverlayEncoder>>,
    ) -> Self {
        let downloads = Arc::new(DownloadGuard::new(&config, comments, overlay));
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            library,
            options,
            downloads,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token, e.g. with a child of the host's
    /// shutdown token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
