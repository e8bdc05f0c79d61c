use clap::{Arg, Command};
use common::config::Settings;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let matches = Command::new("songplay-etl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds the Sparkify star schema from raw song and event logs")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("config/etl.toml")
                .help("Sets a custom config file"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or("config/etl.toml");

    let settings = match Settings::new(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration '{}': {}", config_path, e);
            process::exit(1);
        }
    };

    if let Err(e) = songplay_etl::init_tracing(&settings.logging) {
        eprintln!("{}", e);
        process::exit(1);
    }

    if let Err(e) = songplay_etl::run_with_settings(&settings).await {
        error!(error = %e, "ETL pipeline failed");
        eprintln!("ETL pipeline error: {}", e);
        process::exit(1);
    }
}
