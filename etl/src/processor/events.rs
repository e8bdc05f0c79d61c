use super::views::TempViews;
use common::Result;
use datafusion::prelude::*;
use tracing::info;

/// Page value of events that represent an actual song play.
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// Builds the `users` dimension: one row per non-empty `userId`, taken from
/// that user's latest event so the current subscription level wins.
pub async fn extract_users(ctx: &SessionContext, raw_events: DataFrame) -> Result<DataFrame> {
    let mut views = TempViews::new(ctx);
    let staging = views.register("staging_events", raw_events)?;

    let users = views
        .sql(&format!(
            r#"
            SELECT user_id, first_name, last_name, gender, "level"
            FROM (
                SELECT
                    "userId" AS user_id,
                    "firstName" AS first_name,
                    "lastName" AS last_name,
                    "gender" AS gender,
                    "level" AS "level",
                    ROW_NUMBER() OVER (
                        PARTITION BY "userId"
                        ORDER BY "ts" DESC, "level" DESC, "firstName", "lastName", "gender"
                    ) AS recency_rank
                FROM {staging}
                WHERE "userId" IS NOT NULL AND "userId" <> ''
            ) AS ranked
            WHERE recency_rank = 1
            "#
        ))
        .await?
        .cache()
        .await?;

    info!(users = users.clone().count().await?, "Extracted user dimension");
    Ok(users)
}

/// Builds the `time` dimension from the distinct timestamps of song plays.
///
/// Timestamps are UTC. `week` is the ISO-8601 week number and `weekday`
/// counts from 0 (Sunday) to 6 (Saturday).
pub async fn extract_time(ctx: &SessionContext, raw_events: DataFrame) -> Result<DataFrame> {
    let mut views = TempViews::new(ctx);
    let staging = views.register("staging_events", raw_events)?;

    let time = views
        .sql(&format!(
            r#"
            SELECT
                start_time,
                CAST(date_part('hour', start_time) AS INT) AS "hour",
                CAST(date_part('day', start_time) AS INT) AS "day",
                CAST(date_part('week', start_time) AS INT) AS "week",
                CAST(date_part('month', start_time) AS INT) AS "month",
                CAST(date_part('year', start_time) AS INT) AS "year",
                CAST(date_part('dow', start_time) AS INT) AS "weekday"
            FROM (
                SELECT DISTINCT to_timestamp_millis("ts") AS start_time
                FROM {staging}
                WHERE "page" = '{NEXT_SONG_PAGE}' AND "ts" IS NOT NULL
            ) AS plays
            "#
        ))
        .await?
        .cache()
        .await?;

    info!(timestamps = time.clone().count().await?, "Extracted time dimension");
    Ok(time)
}
