//! Process bootstrap shared by the `quiver` binary and the benches.

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{QuiverError, Result};

/// Config file lookup: `QUIVER_CONFIG` env var, then `./quiver.toml`.
pub fn resolve_config_path() -> Option<String> {
    std::env::var("QUIVER_CONFIG").ok().or_else(|| {
        let default = "quiver.toml";
        std::path::Path::new(default)
            .exists()
            .then(|| default.to_string())
    })
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Size the global rayon pool from `indexing.worker_threads`.
///
/// Only the first call in a process takes effect; later calls are logged
/// and ignored.
pub fn init_worker_pool(config: &Config) -> Result<()> {
    if matches!(config.indexing.worker_threads, Some(0)) {
        return Err(QuiverError::Config(
            "indexing.worker_threads must be > 0 when set".into(),
        ));
    }
    let Some(threads) = config.indexing.worker_threads else {
        return Ok(());
    };
    match rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("quiver-worker-{i}"))
        .build_global()
    {
        Ok(()) => {
            tracing::info!(threads, "worker pool initialized");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(error = %e, "worker pool already initialized");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_config_path_from_env() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(&path, "").unwrap();

        std::env::set_var("QUIVER_CONFIG", path.to_str().unwrap());
        let resolved = resolve_config_path();
        std::env::remove_var("QUIVER_CONFIG");

        assert_eq!(resolved.as_deref(), path.to_str());
    }

    #[test]
    fn test_worker_pool_noop_without_threads() {
        let config = Config::default();
        assert!(init_worker_pool(&config).is_ok());
    }

    #[test]
    fn test_worker_pool_rejects_zero_threads() {
        let mut config = Config::default();
        config.indexing.worker_threads = Some(0);
        assert!(init_worker_pool(&config).is_err());
    }
}
