//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

const VERBOSE_FILTER: &str = "danmu_sync=trace,danmu_core=debug,reqwest=debug";
const DEFAULT_FILTER: &str = "danmu_sync=info,danmu_core=info,reqwest=warn";

/// The filter directives in effect: `RUST_LOG` if set, otherwise the
/// verbose or normal default.
pub fn filter_directives(verbose: bool) -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| default_directives(verbose).to_string())
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    }
}

/// Install the global fmt subscriber.
///
/// Calling this again after a subscriber is installed does nothing.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_new(filter_directives(verbose))
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
