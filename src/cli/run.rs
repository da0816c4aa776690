use crate::config::{load_config, ConfigError};
use crate::destination::DestinationError;
use crate::registry::Registry;
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("destination error: {0}")]
    Destination(#[from] DestinationError),

    #[error("failed to read input: {0}")]
    Input(#[from] std::io::Error),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/logship/config.yml");
            eprintln!("  /etc/logship/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'logship config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_pipeline(&config_path).await.map_err(|e| e.into())
}

async fn run_pipeline(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let registry = Registry::from_config(&config).await?;
    info!(
        destinations = config.destinations.len(),
        archives = config.archives.len(),
        "Shipping stdin, press Ctrl+C to stop"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
        result = ship_lines(stdin, &registry) => result.map(|lines| {
            info!(lines, "Input closed");
        }),
    };

    registry.shutdown().await;
    info!("Shutdown complete");

    result
}

/// Hand every non-empty line of `input` to the registry until EOF. Returns
/// the number of lines read.
pub async fn ship_lines<R>(input: R, registry: &Registry) -> Result<u64, RunError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        count += 1;
        if registry.write_all(&line, Utc::now()) == 0 && !registry.is_empty() {
            warn!(line = count, "No output accepted the line");
        }
    }

    Ok(count)
}
