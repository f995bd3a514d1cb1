//! Concrete comment providers.
//!
//! - [`dandan`] - Dandanplay open API (signed requests, needs credentials).
//! - [`bilibili`] - Bilibili web and PGC APIs.

pub mod bilibili;
pub mod dandan;
mod http;

use std::sync::Arc;

use danmu_core::config::Config;
use danmu_core::Result;

use super::provider::DanmakuProvider;

pub use bilibili::BilibiliProvider;
pub use dandan::DandanProvider;

/// Construct every provider this crate ships, in default priority order.
///
/// Intervals come from the `[[providers]]` table when set. Availability and
/// enable flags are applied later by
/// [`ProviderRegistry::from_config`](crate::danmu::ProviderRegistry::from_config).
pub fn build_known_providers(config: &Config) -> Result<Vec<Arc<dyn DanmakuProvider>>> {
    let dandan = DandanProvider::new(
        config.dandan.clone(),
        config.provider_interval(dandan::NAME, dandan::DEFAULT_INTERVAL),
    )?;
    let bilibili = BilibiliProvider::new(
        config.bilibili.clone(),
        config.provider_interval(bilibili::NAME, bilibili::DEFAULT_INTERVAL),
    )?;

    Ok(vec![Arc::new(bilibili), Arc::new(dandan)])
}
