use super::events::NEXT_SONG_PAGE;
use super::views::TempViews;
use crate::utils::arrow::batches_to_json;
use common::{Error, Result};
use datafusion::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

const AMBIGUOUS_SAMPLE_LIMIT: usize = 5;

/// How event plays are matched against the song catalogue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinOptions {
    /// Largest accepted `|length - duration|` in seconds. Zero means exact.
    pub duration_tolerance: f64,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            duration_tolerance: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SongplayStats {
    pub plays: usize,
    pub matched: usize,
    /// Plays that matched more than one catalogue entry.
    pub ambiguous: usize,
}

/// Builds the `songplays` fact table.
///
/// Every `NextSong` event yields exactly one row. Replays of the same event
/// (same user, session and timestamp) collapse to one. `song_id` and
/// `artist_id` are filled only when title, artist name and duration all
/// match the catalogue; when several entries match, the smallest
/// `(song_id, artist_id)` is kept and the play is counted as ambiguous.
pub async fn build_songplays(
    ctx: &SessionContext,
    raw_events: DataFrame,
    songs: DataFrame,
    artists: DataFrame,
    time: DataFrame,
    options: &JoinOptions,
) -> Result<(DataFrame, SongplayStats)> {
    let tolerance = options.duration_tolerance;
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(Error::InvalidInput(format!(
            "duration_tolerance must be a finite non-negative number, got {}",
            tolerance
        )));
    }

    let mut views = TempViews::new(ctx);
    let staging = views.register("staging_events", raw_events)?;
    let songs = views.register("songs", songs)?;
    let artists = views.register("artists", artists)?;
    let time = views.register("time", time)?;

    let plays = views
        .sql(&format!(
            r#"
            SELECT
                CAST(ROW_NUMBER() OVER (ORDER BY "ts", "userId", "sessionId") AS BIGINT) AS songplay_id,
                to_timestamp_millis("ts") AS start_time,
                "userId" AS user_id,
                "level" AS "level",
                "song" AS song,
                "artist" AS artist,
                "length" AS length,
                "sessionId" AS session_id,
                "location" AS "location",
                "userAgent" AS user_agent
            FROM (
                SELECT
                    *,
                    ROW_NUMBER() OVER (
                        PARTITION BY "userId", "sessionId", "ts"
                        ORDER BY "itemInSession", "song", "artist", "length", "level"
                    ) AS replay_rank
                FROM {staging}
                WHERE "page" = '{NEXT_SONG_PAGE}' AND "ts" IS NOT NULL
            ) AS events
            WHERE replay_rank = 1
            "#
        ))
        .await?
        .cache()
        .await?;
    let plays = views.register("plays", plays)?;

    let matches = views
        .sql(&format!(
            r#"
            SELECT
                p.songplay_id,
                s.song_id,
                s.artist_id,
                ROW_NUMBER() OVER (
                    PARTITION BY p.songplay_id
                    ORDER BY s.song_id, s.artist_id
                ) AS match_rank,
                COUNT(*) OVER (PARTITION BY p.songplay_id) AS match_count
            FROM {plays} p
            JOIN {songs} s ON s.title = p.song
            JOIN {artists} a ON a.artist_id = s.artist_id AND a."name" = p.artist
            WHERE abs(s.duration - p.length) <= {tolerance}
            "#
        ))
        .await?
        .cache()
        .await?;
    let matches = views.register("matches", matches)?;

    let ambiguous = views
        .sql(&format!(
            r#"
            SELECT p.songplay_id, p.song, p.artist, p.length, m.match_count
            FROM {matches} m
            JOIN {plays} p ON p.songplay_id = m.songplay_id
            WHERE m.match_rank = 1 AND m.match_count > 1
            ORDER BY p.songplay_id
            "#
        ))
        .await?;
    let ambiguous_count = ambiguous.clone().count().await?;
    if ambiguous_count > 0 {
        let samples = ambiguous
            .limit(0, Some(AMBIGUOUS_SAMPLE_LIMIT))?
            .collect()
            .await?;
        let samples = serde_json::to_string(&batches_to_json(&samples)?)?;
        warn!(
            ambiguous = ambiguous_count,
            %samples,
            "Plays matched several catalogue entries; kept the smallest song_id"
        );
    }

    let songplays = views
        .sql(&format!(
            r#"
            SELECT
                p.songplay_id,
                p.start_time,
                p.user_id,
                p."level",
                m.song_id,
                m.artist_id,
                p.session_id,
                p."location",
                p.user_agent,
                t."year",
                t."month"
            FROM {plays} p
            LEFT JOIN (
                SELECT songplay_id, song_id, artist_id
                FROM {matches}
                WHERE match_rank = 1
            ) m ON m.songplay_id = p.songplay_id
            LEFT JOIN {time} t ON t.start_time = p.start_time
            "#
        ))
        .await?
        .cache()
        .await?;

    let stats = SongplayStats {
        plays: songplays.clone().count().await?,
        matched: songplays
            .clone()
            .filter(col("song_id").is_not_null())?
            .count()
            .await?,
        ambiguous: ambiguous_count,
    };
    info!(?stats, "Built songplays fact table");

    Ok((songplays, stats))
}
