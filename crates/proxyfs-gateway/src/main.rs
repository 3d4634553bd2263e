#![warn(missing_docs)]

//! ProxyFS lease gateway server: brings the inode lease service up, serves
//! the configured volumes, and drains them again on shutdown.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use proxyfs_lease::{LeaseConfig, LeaseService};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments for the gateway server.
#[derive(Debug, Parser)]
#[command(name = "proxyfs-gateway", about = "ProxyFS lease gateway server")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "proxyfs.json")]
    config: PathBuf,
}

/// On-disk gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    /// Volumes to serve at startup.
    volumes: Vec<String>,
    /// Lease subsystem settings.
    lease: LeaseConfig,
}

impl GatewayConfig {
    fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        } else {
            tracing::warn!("config file not found, using defaults: {}", path.display());
            Ok(GatewayConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("ProxyFS lease gateway starting...");

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;

    let service = LeaseService::up(config.lease.clone())?;
    for volume in &config.volumes {
        service.serve_volume(volume)?;
    }
    service.signaled_finish();
    tracing::info!(volumes = config.volumes.len(), "serving");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    for volume in &config.volumes {
        if let Err(err) = service.unserve_volume(volume).await {
            tracing::error!(volume = %volume, "failed to unserve: {}", err);
        }
    }
    service.down()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_volumes() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"volumes": ["volA", "volB"], "lease": {"lease_interrupt_limit": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.volumes, vec!["volA", "volB"]);
        assert_eq!(config.lease.lease_interrupt_limit, 7);
    }

    #[test]
    fn test_empty_config_takes_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert!(config.volumes.is_empty());
        assert_eq!(config.lease.lease_interrupt_limit, 20);
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let config = GatewayConfig::load(Path::new("/nonexistent/proxyfs.json")).unwrap();
        assert!(config.volumes.is_empty());
    }
}
