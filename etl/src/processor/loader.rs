use crate::schema::{RAW_EVENTS_SCHEMA, RAW_SONGS_SCHEMA};
use arrow::datatypes::Schema;
use common::{Error, Result};
use datafusion::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

/// Row counts observed while loading the staging tables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub songs_loaded: usize,
    pub events_loaded: usize,
    /// Events without `ts` or `page`; they cannot be placed in time or classified.
    pub events_dropped: usize,
}

/// In-memory staging tables with the raw column names.
pub struct StagingData {
    pub songs: DataFrame,
    pub events: DataFrame,
    pub report: LoadReport,
}

pub struct RecordLoader {
    ctx: SessionContext,
}

impl RecordLoader {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    pub async fn load(&self, song_sources: &[String], log_sources: &[String]) -> Result<StagingData> {
        let (songs, songs_loaded) = self.load_songs(song_sources).await?;
        let (events, events_loaded, events_dropped) = self.load_events(log_sources).await?;

        let report = LoadReport {
            songs_loaded,
            events_loaded,
            events_dropped,
        };
        info!(?report, "Staging tables loaded");

        Ok(StagingData {
            songs,
            events,
            report,
        })
    }

    /// Loads song metadata. Records without `song_id` or `artist_id` abort the load.
    pub async fn load_songs(&self, sources: &[String]) -> Result<(DataFrame, usize)> {
        let pattern = sources.join(", ");
        info!(sources = %pattern, "Loading song metadata");
        let songs = self.read_ndjson(sources, &RAW_SONGS_SCHEMA).await?;
        let loaded = songs.clone().count().await?;
        if loaded == 0 {
            return Err(Error::Load(format!(
                "No song records found at '{}'",
                pattern
            )));
        }

        let missing_key = ident("song_id")
            .is_null()
            .or(ident("song_id").eq(lit("")))
            .or(ident("artist_id").is_null())
            .or(ident("artist_id").eq(lit("")));
        let missing = songs.clone().filter(missing_key)?.count().await?;
        if missing > 0 {
            return Err(Error::Load(format!(
                "{} of {} song records at '{}' have no song_id or artist_id",
                missing, loaded, pattern
            )));
        }

        Ok((songs, loaded))
    }

    /// Loads activity events, dropping (and counting) those without `ts` or `page`.
    pub async fn load_events(&self, sources: &[String]) -> Result<(DataFrame, usize, usize)> {
        let pattern = sources.join(", ");
        info!(sources = %pattern, "Loading event logs");
        let events = self.read_ndjson(sources, &RAW_EVENTS_SCHEMA).await?;
        let loaded = events.clone().count().await?;
        if loaded == 0 {
            return Err(Error::Load(format!(
                "No event records found at '{}'",
                pattern
            )));
        }

        let complete = ident("ts").is_not_null().and(ident("page").is_not_null());
        let kept = events.clone().filter(complete.clone())?.count().await?;
        let dropped = loaded - kept;
        if dropped == 0 {
            return Ok((events, loaded, 0));
        }

        warn!(dropped, loaded, "Dropping events without ts or page");
        let events = events.filter(complete)?.cache().await?;
        Ok((events, loaded, dropped))
    }

    async fn read_ndjson(&self, sources: &[String], schema: &Schema) -> Result<DataFrame> {
        let pattern = sources.join(", ");
        if sources.is_empty() {
            return Err(Error::Load("No input files to read".to_string()));
        }

        let options = NdJsonReadOptions::default().schema(schema);
        let df = self
            .ctx
            .read_json(sources.to_vec(), options)
            .await
            .map_err(|e| Error::Load(format!("Cannot read '{}': {}", pattern, e)))?;

        // Materialise once so malformed lines fail here rather than mid-write.
        df.cache()
            .await
            .map_err(|e| Error::Load(format!("Failed to parse records at '{}': {}", pattern, e)))
    }
}
