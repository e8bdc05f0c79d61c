use config::{Config, ConfigError};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub aws: AwsConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub join: JoinConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Credentials and endpoint for the S3-compatible storage backend.
#[derive(Debug, Deserialize, Clone)]
pub struct AwsConfig {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Glob over newline-delimited song metadata files.
    pub song_data: String,
    /// Glob over newline-delimited event log files.
    pub log_data: String,
    /// Base location the five tables are written under.
    pub output_root: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JoinConfig {
    #[serde(default)]
    pub duration_tolerance: f64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            duration_tolerance: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("SPARKIFY")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = builder.build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        debug!(
            song_data = %settings.paths.song_data,
            log_data = %settings.paths.log_data,
            output_root = %settings.paths.output_root,
            region = %settings.aws.region,
            "Loaded ETL settings"
        );

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tolerance = self.join.duration_tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(ConfigError::Message(format!(
                "join.duration_tolerance must be a finite, non-negative number (got {})",
                tolerance
            )));
        }

        for (name, value) in [
            ("paths.song_data", &self.paths.song_data),
            ("paths.log_data", &self.paths.log_data),
            ("paths.output_root", &self.paths.output_root),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Message(format!("{} must not be empty", name)));
            }
        }

        Ok(())
    }
}
