//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,chat_runtime=debug,chat_smoke=debug";
const FILTER_VARS: [&str; 2] = ["RUST_LOG", "VENTURECHAT_LOG"];

/// Install the global subscriber.
///
/// The first of `RUST_LOG`, `VENTURECHAT_LOG` holding a valid directive
/// wins; otherwise the built-in default applies.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter_directive(|key| env::var(key).ok()))
        .try_init();
}

fn filter_directive<F>(mut lookup: F) -> EnvFilter
where
    F: FnMut(&str) -> Option<String>,
{
    FILTER_VARS
        .into_iter()
        .filter_map(|key| lookup(key))
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
