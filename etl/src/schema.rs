use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use lazy_static::lazy_static;

// Raw source schemas
pub fn raw_songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("artist_name", DataType::Utf8, true),
        Field::new("artist_location", DataType::Utf8, true),
        Field::new("artist_latitude", DataType::Float64, true),
        Field::new("artist_longitude", DataType::Float64, true),
        Field::new("duration", DataType::Float64, true),
        Field::new("year", DataType::Int64, true),
        Field::new("num_songs", DataType::Int64, true),
    ])
}

pub fn raw_events_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist", DataType::Utf8, true),
        Field::new("auth", DataType::Utf8, true),
        Field::new("firstName", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("itemInSession", DataType::Int64, true),
        Field::new("lastName", DataType::Utf8, true),
        Field::new("length", DataType::Float64, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("page", DataType::Utf8, true),
        Field::new("registration", DataType::Float64, true),
        Field::new("sessionId", DataType::Int64, true),
        Field::new("song", DataType::Utf8, true),
        Field::new("status", DataType::Int64, true),
        Field::new("ts", DataType::Int64, true),
        Field::new("userAgent", DataType::Utf8, true),
        Field::new("userId", DataType::Utf8, true),
    ])
}

fn start_time_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, None)
}

// Star schema
pub fn songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("song_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, false),
        Field::new("year", DataType::Int32, true),
        Field::new("duration", DataType::Float64, true),
    ])
}

pub fn artists_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
    ])
}

pub fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("user_id", DataType::Utf8, false),
        Field::new("first_name", DataType::Utf8, true),
        Field::new("last_name", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
    ])
}

pub fn time_schema() -> Schema {
    Schema::new(vec![
        Field::new("start_time", start_time_type(), false),
        Field::new("hour", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("week", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("year", DataType::Int32, false),
        Field::new("weekday", DataType::Int32, false),
    ])
}

pub fn songplays_schema() -> Schema {
    Schema::new(vec![
        Field::new("songplay_id", DataType::Int64, false),
        Field::new("start_time", start_time_type(), false),
        Field::new("user_id", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("session_id", DataType::Int64, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("user_agent", DataType::Utf8, true),
        Field::new("year", DataType::Int32, true),
        Field::new("month", DataType::Int32, true),
    ])
}

/// The five output tables of the star schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StarTable {
    Songs,
    Artists,
    Users,
    Time,
    Songplays,
}

impl StarTable {
    pub const ALL: [StarTable; 5] = [
        StarTable::Songs,
        StarTable::Artists,
        StarTable::Users,
        StarTable::Time,
        StarTable::Songplays,
    ];

    /// Directory name under the output root.
    pub fn name(&self) -> &'static str {
        match self {
            StarTable::Songs => "songs",
            StarTable::Artists => "artists",
            StarTable::Users => "users",
            StarTable::Time => "time",
            StarTable::Songplays => "songplays",
        }
    }

    pub fn schema(&self) -> &'static Schema {
        match self {
            StarTable::Songs => &SONGS_SCHEMA,
            StarTable::Artists => &ARTISTS_SCHEMA,
            StarTable::Users => &USERS_SCHEMA,
            StarTable::Time => &TIME_SCHEMA,
            StarTable::Songplays => &SONGPLAYS_SCHEMA,
        }
    }

    pub fn primary_key(&self) -> &'static str {
        match self {
            StarTable::Songs => "song_id",
            StarTable::Artists => "artist_id",
            StarTable::Users => "user_id",
            StarTable::Time => "start_time",
            StarTable::Songplays => "songplay_id",
        }
    }

    /// Hive-style partition columns, outermost first.
    pub fn partition_columns(&self) -> &'static [&'static str] {
        match self {
            StarTable::Songs => &["year", "artist_id"],
            StarTable::Time | StarTable::Songplays => &["year", "month"],
            StarTable::Artists | StarTable::Users => &[],
        }
    }
}

impl std::fmt::Display for StarTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Lazy-loaded static schemas
lazy_static! {
    pub static ref RAW_SONGS_SCHEMA: Schema = raw_songs_schema();
    pub static ref RAW_EVENTS_SCHEMA: Schema = raw_events_schema();
    static ref SONGS_SCHEMA: Schema = songs_schema();
    static ref ARTISTS_SCHEMA: Schema = artists_schema();
    static ref USERS_SCHEMA: Schema = users_schema();
    static ref TIME_SCHEMA: Schema = time_schema();
    static ref SONGPLAYS_SCHEMA: Schema = songplays_schema();
}
