use super::views::TempViews;
use common::Result;
use datafusion::prelude::*;
use tracing::info;

/// Builds the `songs` and `artists` dimensions from staged song metadata.
///
/// Each key keeps exactly one row. When a key repeats with different
/// attributes the row whose attributes sort first (ascending, nulls last)
/// wins, so the choice never depends on file or partition order.
pub async fn extract_song_artist(
    ctx: &SessionContext,
    raw_songs: DataFrame,
) -> Result<(DataFrame, DataFrame)> {
    let mut views = TempViews::new(ctx);
    let staging = views.register("staging_songs", raw_songs)?;

    let songs = views
        .sql(&format!(
            r#"
            SELECT song_id, title, artist_id, "year", duration
            FROM (
                SELECT
                    song_id,
                    title,
                    artist_id,
                    CAST("year" AS INT) AS "year",
                    duration,
                    ROW_NUMBER() OVER (
                        PARTITION BY song_id
                        ORDER BY title, artist_id, "year", duration
                    ) AS key_rank
                FROM {staging}
            ) AS ranked
            WHERE key_rank = 1
            "#
        ))
        .await?
        .cache()
        .await?;

    let artists = views
        .sql(&format!(
            r#"
            SELECT artist_id, "name", "location", latitude, longitude
            FROM (
                SELECT
                    artist_id,
                    artist_name AS "name",
                    artist_location AS "location",
                    artist_latitude AS latitude,
                    artist_longitude AS longitude,
                    ROW_NUMBER() OVER (
                        PARTITION BY artist_id
                        ORDER BY artist_name, artist_location, artist_latitude, artist_longitude
                    ) AS key_rank
                FROM {staging}
            ) AS ranked
            WHERE key_rank = 1
            "#
        ))
        .await?
        .cache()
        .await?;

    info!(
        songs = songs.clone().count().await?,
        artists = artists.clone().count().await?,
        "Extracted song and artist dimensions"
    );

    Ok((songs, artists))
}
