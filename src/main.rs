use quiver::config::Config;
use quiver::harness::run_scenario;
use quiver::startup::{init_logging, init_worker_pool, resolve_config_path};
use quiver::storage::QuiverStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    // priority: QUIVER_CONFIG env var > ./quiver.toml > defaults
    let config = Config::load(resolve_config_path().as_deref())?;

    init_logging(&config);
    quiver::metrics::init();
    init_worker_pool(&config)?;

    let store = QuiverStore::from_config(&config.storage)?;
    tracing::info!(
        uri = %config.harness.dataset_uri,
        rows = config.harness.num_rows,
        dim = config.harness.dim,
        "starting index scenario"
    );

    let timings = run_scenario(&config, &store).await?;
    tracing::info!(
        write_ms = timings.write.as_millis(),
        create_index_ms = timings.create_index.as_millis(),
        append_ms = timings.append.as_millis(),
        optimize_ms = timings.optimize.as_millis(),
        train_ivf_ms = timings.train_ivf.as_millis(),
        assign = ?timings.assign_partitions,
        "scenario complete"
    );
    println!("{}", serde_json::to_string_pretty(&timings)?);
    tracing::debug!(metrics = %quiver::metrics::gather_text(), "final metrics");

    Ok(())
}
