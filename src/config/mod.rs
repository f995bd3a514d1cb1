pub use danmu_core::config::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// Accepted range for per-provider request intervals, in milliseconds.
const INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 300..=5000;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    apply_env_overrides(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Parse configuration from TOML text without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./danmu.toml",
        "~/.config/danmu-sync/config.toml",
        "/etc/danmu-sync/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    let mut config = Config::default();
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Fill missing dandanplay credentials from `DANDAN_APP_ID` and
/// `DANDAN_APP_SECRET`.
fn apply_env_overrides(config: &mut Config) {
    fill_from_env(&mut config.dandan.app_id, "DANDAN_APP_ID");
    fill_from_env(&mut config.dandan.app_secret, "DANDAN_APP_SECRET");
}

fn fill_from_env(slot: &mut Option<String>, var: &str) {
    if slot.as_deref().is_some_and(|s| !s.is_empty()) {
        return;
    }
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *slot = Some(value);
        }
    }
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.queue.quiet_period_ms == 0 {
        anyhow::bail!("queue.quiet_period_ms cannot be 0");
    }

    let mut names = HashSet::new();
    for provider in &config.providers {
        if !names.insert(provider.name.as_str()) {
            anyhow::bail!("Provider '{}' is configured more than once", provider.name);
        }
        if let Some(ms) = provider.min_interval_ms {
            if !INTERVAL_RANGE_MS.contains(&ms) {
                anyhow::bail!(
                    "Provider '{}' min_interval_ms {} is outside {}..={}",
                    provider.name,
                    ms,
                    INTERVAL_RANGE_MS.start(),
                    INTERVAL_RANGE_MS.end()
                );
            }
        }
    }

    if !(0.0..=1.0).contains(&config.overlay.text_opacity) {
        anyhow::bail!(
            "overlay.text_opacity must be between 0.0 and 1.0, got {}",
            config.overlay.text_opacity
        );
    }

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    Ok(())
}
