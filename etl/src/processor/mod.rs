pub mod events;
pub mod loader;
pub mod songplays;
pub mod songs;
pub mod views;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use loader::{LoadReport, RecordLoader, StagingData};
pub use songplays::{JoinOptions, SongplayStats};
pub use writer::{ParquetTableWriter, TableMarker, TableSink, WriteSummary};

use crate::schema::StarTable;
use crate::storage::{OutputLocation, S3Config, S3Manager, StorageUrl};
use chrono::Utc;
use common::Result;
use common::config::Settings;
use datafusion::execution::context::SessionContext;
use events::{extract_time, extract_users};
use serde::Serialize;
use songplays::build_songplays;
use songs::extract_song_artist;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one complete run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub load: LoadReport,
    pub songplays: SongplayStats,
    pub tables: Vec<WriteSummary>,
}

/// Drives one run: load, extract dimensions, build facts, publish tables.
pub struct EtlProcessor {
    ctx: SessionContext,
    s3_manager: Option<Arc<S3Manager>>,
    song_sources: Vec<String>,
    log_sources: Vec<String>,
    options: JoinOptions,
    sink: Arc<dyn TableSink>,
    run_id: String,
}

impl EtlProcessor {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let song_data = StorageUrl::parse(&settings.paths.song_data)?;
        let log_data = StorageUrl::parse(&settings.paths.log_data)?;
        let output_root = StorageUrl::parse(&settings.paths.output_root)?;

        let ctx = SessionContext::new();
        let buckets: BTreeSet<&str> = [&song_data, &log_data, &output_root]
            .into_iter()
            .filter_map(|url| url.bucket())
            .collect();

        let s3_manager = if buckets.is_empty() {
            None
        } else {
            let manager = Arc::new(S3Manager::new(S3Config::from(&settings.aws)));
            for bucket in &buckets {
                manager.register_object_store(&ctx, bucket).await?;
                manager.verify_bucket_exists(bucket).await?;
            }
            Some(manager)
        };

        let song_sources = expand_sources(s3_manager.as_deref(), &song_data).await?;
        let log_sources = expand_sources(s3_manager.as_deref(), &log_data).await?;

        let output = OutputLocation::from_url(&output_root, s3_manager.as_deref(), &ctx).await?;
        let run_id = new_run_id();
        info!(run_id = %run_id, output = %output.base_url(), "Initialised ETL run");

        Ok(Self {
            sink: Arc::new(ParquetTableWriter::new(output, run_id.clone())),
            ctx,
            s3_manager,
            song_sources,
            log_sources,
            options: JoinOptions {
                duration_tolerance: settings.join.duration_tolerance,
            },
            run_id,
        })
    }

    /// Replaces the Parquet writer, e.g. with a sink that keeps tables in memory.
    pub fn with_sink(mut self, sink: Arc<dyn TableSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn ctx(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn s3_manager(&self) -> Option<&Arc<S3Manager>> {
        self.s3_manager.as_ref()
    }

    pub async fn run(&self) -> Result<RunSummary> {
        info!(run_id = %self.run_id, "Starting ETL run");

        let staging = RecordLoader::new(self.ctx.clone())
            .load(&self.song_sources, &self.log_sources)
            .await?;

        let ((songs, artists), users, time) = tokio::try_join!(
            extract_song_artist(&self.ctx, staging.songs.clone()),
            extract_users(&self.ctx, staging.events.clone()),
            extract_time(&self.ctx, staging.events.clone()),
        )?;

        let (songplays, stats) = build_songplays(
            &self.ctx,
            staging.events,
            songs.clone(),
            artists.clone(),
            time.clone(),
            &self.options,
        )
        .await?;

        let written = self
            .write_all([
                (StarTable::Songs, songs),
                (StarTable::Artists, artists),
                (StarTable::Users, users),
                (StarTable::Time, time),
                (StarTable::Songplays, songplays),
            ])
            .await;

        if let Err(e) = self.sink.finish().await {
            warn!(run_id = %self.run_id, error = %e, "Failed to remove run staging area");
        }
        let tables = written?;

        info!(run_id = %self.run_id, tables = tables.len(), "ETL run complete");
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            load: staging.report,
            songplays: stats,
            tables,
        })
    }

    async fn write_all(
        &self,
        tables: [(StarTable, datafusion::prelude::DataFrame); 5],
    ) -> Result<Vec<WriteSummary>> {
        let mut summaries = Vec::with_capacity(tables.len());
        for (table, df) in tables {
            summaries.push(self.sink.write_table(table, df).await?);
        }
        Ok(summaries)
    }
}

async fn expand_sources(manager: Option<&S3Manager>, url: &StorageUrl) -> Result<Vec<String>> {
    match (url, manager) {
        (StorageUrl::S3 { bucket, key }, Some(manager)) => manager.expand_glob(bucket, key).await,
        (StorageUrl::S3 { bucket, .. }, None) => Err(common::Error::Storage(format!(
            "No S3 credentials available for input bucket '{}'",
            bucket
        ))),
        (StorageUrl::Local(_), _) => Ok(vec![url.to_datafusion_path()]),
    }
}

/// `<UTC timestamp>_<8 hex chars>`; sorts by start time.
fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..8])
}
