use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clusterbook::api::{self, Envelope};
use clusterbook::config::Config;

/// Cluster resource availability, feasibility checks and notification scopes.
///
/// Every command reads one JSON document `{"state": {...}, "request": {...}}`
/// from FILE, or stdin when FILE is omitted, and prints the JSON result.
#[derive(Parser, Debug)]
#[command(name = "clusterbook")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Used and free capacity of every node/resource pair over a window
    Schedule { file: Option<PathBuf> },
    /// Whether a proposed allocation fits
    Check { file: Option<PathBuf> },
    /// Notification scopes of a user or group
    Notifications { file: Option<PathBuf> },
    /// Applicable limits of a user and the violations of a set of requests
    Limits { file: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the JSON result only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    clusterbook::observability::init(config.metrics_port);
    info!(
        "cache_capacity: {}, max_query_window_days: {}",
        config.cache_capacity, config.max_query_window_days
    );

    match cli.command {
        Command::Schedule { file } => {
            let envelope: Envelope<api::ScheduleRequest> = read_envelope(file).await?;
            let engine = envelope.state.build_engine(config.engine_options()).await?;
            print_json(&api::schedule(&engine, &envelope.request).await?)?;
        }
        Command::Check { file } => {
            let envelope: Envelope<api::CheckRequest> = read_envelope(file).await?;
            let engine = envelope.state.build_engine(config.engine_options()).await?;
            print_json(&api::check(&engine, &envelope.request).await?)?;
        }
        Command::Notifications { file } => {
            let envelope: Envelope<api::NotificationsRequest> = read_envelope(file).await?;
            print_json(&api::notifications(&envelope.state.directory, &envelope.request)?)?;
        }
        Command::Limits { file } => {
            let envelope: Envelope<api::LimitsRequest> = read_envelope(file).await?;
            let state = &envelope.state;
            print_json(&api::limits(&state.directory, &state.limits, &envelope.request)?)?;
        }
    }
    Ok(())
}

async fn read_envelope<R: DeserializeOwned>(
    file: Option<PathBuf>,
) -> Result<Envelope<R>, Box<dyn std::error::Error>> {
    let input = match file {
        Some(path) => tokio::fs::read_to_string(&path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    Ok(serde_json::from_str(&input)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
