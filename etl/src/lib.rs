pub mod processor;
pub mod schema;
pub mod storage;
pub mod utils;

pub use processor::{EtlProcessor, RunSummary};

use common::config::{LogFormat, LoggingConfig, Settings};
use common::{Error, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

/// Loads the configuration at `config_path` and runs the pipeline once.
pub async fn run_etl_pipeline(config_path: &str) -> Result<RunSummary> {
    let settings = Settings::new(config_path)?;
    run_with_settings(&settings).await
}

pub async fn run_with_settings(settings: &Settings) -> Result<RunSummary> {
    let processor = EtlProcessor::new(settings).await?;
    let summary = processor.run().await?;

    info!(
        run_id = %summary.run_id,
        plays = summary.songplays.plays,
        matched = summary.songplays.matched,
        "Star schema published"
    );
    Ok(summary)
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level).map_err(|e| {
            Error::InvalidInput(format!("Invalid log level '{}': {}", logging.level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339());

    let installed = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| Error::Other(format!("Cannot install log subscriber: {}", e)))
}
