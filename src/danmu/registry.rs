//! Provider registry.
//!
//! The [`ProviderRegistry`] holds the ordered list of [`DanmakuProvider`]s the
//! dispatcher iterates for every entity. Order and enablement come from the
//! `providers` section of the configuration.

use std::sync::Arc;

use danmu_core::config::ProviderConfig;
use danmu_core::EntityRef;
use tracing::{debug, warn};

use super::provider::DanmakuProvider;

/// Ordered collection of provider clients.
///
/// # Examples
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use danmu_sync::danmu::registry::ProviderRegistry;
///
/// let registry = ProviderRegistry::from_config(
///     vec![Arc::new(bilibili), Arc::new(dandan)],
///     &config.providers,
/// );
/// for provider in registry.providers() {
///     // ...
/// }
/// ```
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn DanmakuProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry with no providers.
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Append a provider to the end of the iteration order.
    pub fn register(&mut self, provider: Arc<dyn DanmakuProvider>) {
        self.providers.push(provider);
    }

    /// Build a registry from every known provider and the configured order.
    ///
    /// Configured providers come first, in configuration order, skipping the
    /// disabled ones. Providers the configuration does not mention follow in
    /// the order given, if they are enabled by default. Providers that report
    /// themselves unavailable are left out.
    pub fn from_config(
        known: Vec<Arc<dyn DanmakuProvider>>,
        settings: &[ProviderConfig],
    ) -> Self {
        let mut registry = Self::new();

        for setting in settings {
            match known.iter().find(|p| p.name() == setting.name) {
                Some(provider) if setting.enabled => registry.register_available(provider),
                Some(_) => debug!(provider = %setting.name, "Provider disabled by configuration"),
                None => warn!(provider = %setting.name, "Configured provider is not known"),
            }
        }

        for provider in &known {
            let configured = settings.iter().any(|s| s.name == provider.name());
            if !configured && provider.default_enabled() {
                registry.register_available(provider);
            }
        }

        registry
    }

    fn register_available(&mut self, provider: &Arc<dyn DanmakuProvider>) {
        if self.get(provider.name()).is_some() {
            return;
        }
        if provider.is_available() {
            self.register(Arc::clone(provider));
        } else {
            warn!(provider = provider.name(), "Provider is not available; skipping");
        }
    }

    /// Providers in iteration order.
    pub fn providers(&self) -> &[Arc<dyn DanmakuProvider>] {
        &self.providers
    }

    /// Look up a provider by its [`DanmakuProvider::name`].
    pub fn get(&self, name: &str) -> Option<&Arc<dyn DanmakuProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Provider-id keys of every registered provider.
    pub fn provider_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.iter().map(|p| p.provider_key())
    }

    /// The first provider whose id is stored on `entity`.
    ///
    /// This is the provider an explicit (forced) request refers to.
    pub fn selected_for(&self, entity: &EntityRef) -> Option<&Arc<dyn DanmakuProvider>> {
        self.providers
            .iter()
            .find(|p| entity.provider_ids.contains(p.provider_key()))
    }

    /// Whether any registered provider already has an id on `entity`.
    pub fn has_any_provider_id(&self, entity: &EntityRef) -> bool {
        self.selected_for(entity).is_some()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danmu::provider::{CommentStream, ProviderEpisode, ProviderMedia, SearchHit};
    use async_trait::async_trait;
    use danmu_core::Result;

    /// A minimal stub provider used for testing.
    struct StubProvider {
        provider_name: &'static str,
        key: &'static str,
        available: bool,
        default_enabled: bool,
    }

    #[async_trait]
    impl DanmakuProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.provider_name
        }

        fn provider_key(&self) -> &'static str {
            self.key
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn default_enabled(&self) -> bool {
            self.default_enabled
        }

        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }

        async fn get_media(&self, _e: &EntityRef, _id: &str) -> Result<Option<ProviderMedia>> {
            Ok(None)
        }

        async fn get_episode(&self, _e: &EntityRef, _id: &str) -> Result<Option<ProviderEpisode>> {
            Ok(None)
        }

        async fn get_comment_stream(
            &self,
            _e: &EntityRef,
            _id: &str,
        ) -> Result<Option<CommentStream>> {
            Ok(None)
        }
    }

    fn stub(name: &'static str, key: &'static str) -> Arc<dyn DanmakuProvider> {
        Arc::new(StubProvider {
            provider_name: name,
            key,
            available: true,
            default_enabled: true,
        })
    }

    fn setting(name: &str, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            enabled,
            min_interval_ms: None,
        }
    }

    fn names(registry: &ProviderRegistry) -> Vec<&'static str> {
        registry.providers().iter().map(|p| p.name()).collect()
    }

    #[test]
    fn empty_registry() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("bilibili").is_none());
        assert!(!registry.has_any_provider_id(&EntityRef::movie("x")));
    }

    #[test]
    fn configured_order_wins() {
        let known = vec![stub("bilibili", "BilibiliID"), stub("dandan", "DandanID")];
        let registry =
            ProviderRegistry::from_config(known, &[setting("dandan", true), setting("bilibili", true)]);
        assert_eq!(names(&registry), vec!["dandan", "bilibili"]);
    }

    #[test]
    fn disabled_providers_are_skipped() {
        let known = vec![stub("bilibili", "BilibiliID"), stub("dandan", "DandanID")];
        let registry = ProviderRegistry::from_config(known, &[setting("bilibili", false)]);
        assert_eq!(names(&registry), vec!["dandan"]);
    }

    #[test]
    fn unknown_configured_providers_are_ignored() {
        let known = vec![stub("bilibili", "BilibiliID"), stub("dandan", "DandanID")];
        let registry = ProviderRegistry::from_config(
            known,
            &[setting("youku", true), setting("dandan", true), setting("iqiyi", true)],
        );
        assert_eq!(names(&registry), vec!["dandan", "bilibili"]);
        assert!(registry.get("youku").is_none());
    }

    #[test]
    fn unconfigured_providers_follow_by_default_enablement() {
        let known: Vec<Arc<dyn DanmakuProvider>> = vec![
            stub("bilibili", "BilibiliID"),
            Arc::new(StubProvider {
                provider_name: "mgtv",
                key: "MgtvID",
                available: true,
                default_enabled: false,
            }),
            stub("dandan", "DandanID"),
        ];
        let registry = ProviderRegistry::from_config(known, &[setting("dandan", true)]);
        assert_eq!(names(&registry), vec!["dandan", "bilibili"]);
    }

    #[test]
    fn unavailable_providers_are_left_out() {
        let known: Vec<Arc<dyn DanmakuProvider>> = vec![
            Arc::new(StubProvider {
                provider_name: "dandan",
                key: "DandanID",
                available: false,
                default_enabled: true,
            }),
            stub("bilibili", "BilibiliID"),
        ];
        let registry = ProviderRegistry::from_config(known, &[]);
        assert_eq!(names(&registry), vec!["bilibili"]);
    }

    #[test]
    fn selected_for_uses_registry_order() {
        let mut registry = ProviderRegistry::new();
        registry.register(stub("bilibili", "BilibiliID"));
        registry.register(stub("dandan", "DandanID"));

        let entity = EntityRef::movie("x")
            .with_provider_id("DandanID", "1")
            .with_provider_id("BilibiliID", "2");
        assert_eq!(registry.selected_for(&entity).unwrap().name(), "bilibili");

        let only_dandan = EntityRef::movie("y").with_provider_id("DandanID", "1");
        assert_eq!(registry.selected_for(&only_dandan).unwrap().name(), "dandan");
        assert_eq!(
            registry.provider_keys().collect::<Vec<_>>(),
            vec!["BilibiliID", "DandanID"]
        );
    }
}
