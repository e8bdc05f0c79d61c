use crate::schema::{RAW_EVENTS_SCHEMA, RAW_SONGS_SCHEMA};
use crate::utils::arrow::batches_to_json;
use arrow::datatypes::Schema;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;

/// Decodes JSON rows with `schema` into an in-memory frame.
pub fn frame(ctx: &SessionContext, schema: &Schema, rows: &[Value]) -> DataFrame {
    let schema = Arc::new(schema.clone());
    let mut buffer = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buffer, row).unwrap();
        buffer.push(b'\n');
    }

    let reader = ReaderBuilder::new(schema.clone())
        .build(Cursor::new(buffer))
        .unwrap();
    let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();
    let table = MemTable::try_new(schema, vec![batches]).unwrap();
    ctx.read_table(Arc::new(table)).unwrap()
}

pub fn songs_frame(ctx: &SessionContext, rows: &[Value]) -> DataFrame {
    frame(ctx, &RAW_SONGS_SCHEMA, rows)
}

pub fn events_frame(ctx: &SessionContext, rows: &[Value]) -> DataFrame {
    frame(ctx, &RAW_EVENTS_SCHEMA, rows)
}

pub async fn rows(df: DataFrame) -> Vec<Value> {
    batches_to_json(&df.collect().await.unwrap()).unwrap()
}

pub fn song(song_id: &str, title: &str, artist_id: &str, artist_name: &str, duration: f64) -> Value {
    json!({
        "song_id": song_id,
        "title": title,
        "artist_id": artist_id,
        "artist_name": artist_name,
        "artist_location": "",
        "artist_latitude": null,
        "artist_longitude": null,
        "duration": duration,
        "year": 2000,
        "num_songs": 1
    })
}

pub fn event(user_id: &str, ts: i64, page: &str) -> Value {
    json!({
        "artist": null,
        "auth": "Logged In",
        "firstName": "Walter",
        "gender": "M",
        "itemInSession": 0,
        "lastName": "Frye",
        "length": null,
        "level": "free",
        "location": "San Francisco-Oakland-Hayward, CA",
        "method": "GET",
        "page": page,
        "registration": 1540919166796.0,
        "sessionId": 38,
        "song": null,
        "status": 200,
        "ts": ts,
        "userAgent": "Mozilla/5.0",
        "userId": user_id
    })
}

pub fn play(user_id: &str, ts: i64, song: &str, artist: &str, length: f64) -> Value {
    let mut value = event(user_id, ts, "NextSong");
    value["song"] = json!(song);
    value["artist"] = json!(artist);
    value["length"] = json!(length);
    value["method"] = json!("PUT");
    value
}
