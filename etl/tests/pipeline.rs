use anyhow::Result;
use datafusion::prelude::*;
use serde_json::{Value, json};
use songplay_etl::processor::TableMarker;
use songplay_etl::run_etl_pipeline;
use songplay_etl::schema::StarTable;
use std::fs;
use std::path::Path;

fn write_lines(path: &Path, lines: &[Value]) -> Result<()> {
    fs::create_dir_all(path.parent().unwrap())?;
    let body: Vec<String> = lines.iter().map(|v| v.to_string()).collect();
    fs::write(path, body.join("\n"))?;
    Ok(())
}

fn song(song_id: &str, title: &str, artist_id: &str, artist_name: &str, duration: f64, year: i64) -> Value {
    json!({
        "num_songs": 1,
        "artist_id": artist_id,
        "artist_latitude": null,
        "artist_longitude": null,
        "artist_location": "",
        "artist_name": artist_name,
        "song_id": song_id,
        "title": title,
        "duration": duration,
        "year": year
    })
}

fn event(user_id: &str, ts: i64, page: &str, song: Option<(&str, &str, f64)>) -> Value {
    let (title, artist, length) = match song {
        Some((title, artist, length)) => (json!(title), json!(artist), json!(length)),
        None => (Value::Null, Value::Null, Value::Null),
    };
    json!({
        "artist": artist,
        "auth": "Logged In",
        "firstName": "Kaylee",
        "gender": "F",
        "itemInSession": 0,
        "lastName": "Summers",
        "length": length,
        "level": "free",
        "location": "Phoenix-Mesa-Scottsdale, AZ",
        "method": "PUT",
        "page": page,
        "registration": 1540344794796.0,
        "sessionId": 139,
        "song": title,
        "status": 200,
        "ts": ts,
        "userAgent": "Mozilla/5.0 (Windows NT 6.1; WOW64)",
        "userId": user_id
    })
}

fn write_fixtures(root: &Path) -> Result<()> {
    write_lines(
        &root.join("song_data/A/A/A/TRAAAAW128F429D538.json"),
        &[song("SOMZWCG12A8C13C480", "I Didn't Mean To", "ARD7TVE1187B99BFB1", "Casual", 218.93179, 0)],
    )?;
    write_lines(
        &root.join("song_data/A/B/C/TRABCEI128F424C983.json"),
        &[song("SOUPIRU12A6D4FA1E1", "Der Kleine Dompfaff", "ARJIE2Y1187B994AB7", "Line Renaud", 152.92036, 1998)],
    )?;
    write_lines(
        &root.join("log_data/2018/11/2018-11-01-events.json"),
        &[
            event("8", 1541105830796, "NextSong", Some(("I Didn't Mean To", "Casual", 218.93179))),
            event("8", 1541106106796, "NextSong", Some(("Unknown Song", "Unknown Artist", 100.0))),
            event("8", 1541106132796, "Home", None),
        ],
    )?;
    write_lines(
        &root.join("log_data/2018/12/2018-12-03-events.json"),
        &[event("26", 1543850000000, "NextSong", Some(("Der Kleine Dompfaff", "Line Renaud", 152.92036)))],
    )?;
    Ok(())
}

fn write_config(root: &Path) -> Result<String> {
    let path = root.join("etl.toml");
    fs::write(
        &path,
        format!(
            r#"
[aws]
access_key = "unused"
secret_key = "unused"

[paths]
song_data = "{root}/song_data/*/*/*/*.json"
log_data = "{root}/log_data/*/*/*.json"
output_root = "{root}/warehouse"

[join]
duration_tolerance = 0.0
"#,
            root = root.display()
        ),
    )?;
    Ok(path.to_string_lossy().into_owned())
}

/// Reads a published table; a directory without `_SUCCESS` is not a table.
async fn count_rows(table_dir: &Path) -> Result<usize> {
    anyhow::ensure!(
        table_dir.join("_SUCCESS").is_file(),
        "{} has no _SUCCESS marker",
        table_dir.display()
    );
    let ctx = SessionContext::new();
    let df = ctx
        .read_parquet(format!("{}/", table_dir.display()), ParquetReadOptions::default())
        .await?;
    Ok(df.count().await?)
}

#[tokio::test]
async fn test_pipeline_publishes_star_schema() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_fixtures(dir.path())?;
    let config = write_config(dir.path())?;

    let summary = run_etl_pipeline(&config).await?;
    assert_eq!(summary.load.songs_loaded, 2);
    assert_eq!(summary.load.events_loaded, 4);
    assert_eq!(summary.songplays.plays, 3);
    assert_eq!(summary.songplays.matched, 2);
    assert_eq!(summary.tables.len(), 5);

    let warehouse = dir.path().join("warehouse");
    for table in StarTable::ALL {
        let marker: TableMarker =
            serde_json::from_slice(&fs::read(warehouse.join(table.name()).join("_SUCCESS"))?)?;
        assert_eq!(marker.run_id, summary.run_id);
        assert_eq!(marker.table, table.name());
    }
    assert!(!warehouse.join("_staging").join(&summary.run_id).exists());

    assert!(warehouse.join("songs/year=1998/artist_id=ARJIE2Y1187B994AB7").is_dir());
    assert!(warehouse.join("songplays/year=2018/month=11").is_dir());
    assert!(warehouse.join("songplays/year=2018/month=12").is_dir());

    assert_eq!(count_rows(&warehouse.join("songplays")).await?, 3);
    assert_eq!(count_rows(&warehouse.join("users")).await?, 2);
    assert_eq!(count_rows(&warehouse.join("time")).await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_rerun_overwrites_previous_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_fixtures(dir.path())?;
    let config = write_config(dir.path())?;

    let first = run_etl_pipeline(&config).await?;
    let second = run_etl_pipeline(&config).await?;
    assert_ne!(first.run_id, second.run_id);

    let warehouse = dir.path().join("warehouse");
    assert_eq!(count_rows(&warehouse.join("songplays")).await?, 3);
    assert_eq!(count_rows(&warehouse.join("artists")).await?, 2);

    let marker: TableMarker =
        serde_json::from_slice(&fs::read(warehouse.join("songplays/_SUCCESS"))?)?;
    assert_eq!(marker.run_id, second.run_id);
    Ok(())
}

#[tokio::test]
async fn test_missing_config_fails() {
    let result = run_etl_pipeline("/nonexistent/etl.toml").await;
    assert!(matches!(result, Err(common::Error::Config(_))));
}
