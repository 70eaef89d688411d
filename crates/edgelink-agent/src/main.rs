//! Edgelink agent - cluster-side tunnel agent CLI
//!
//! This binary keeps the cluster's outbound tunnels to the control-plane
//! broker converged with what the broker's discovery API reports, and
//! forwards every inbound sub-stream to the local gateway.

use anyhow::{Context, Result};
use clap::Parser;
use edgelink_tunnel::{DiscoveryClient, ManagerConfig, TunnelManager};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Edgelink agent - bridges cluster workloads with the control-plane broker
#[derive(Parser, Debug)]
#[command(name = "edgelink-agent")]
#[command(about = "Edgelink agent - bridges cluster workloads with the control-plane broker")]
#[command(version)]
#[command(long_about = r#"
The agent dials outward to the control-plane broker, so it works from behind
NAT and restrictive firewalls. It polls the broker's discovery API for the
tunnels this cluster should keep open, maintains one multiplexed WebSocket
connection per tunnel, and forwards every inbound sub-stream to the local
gateway.

EXAMPLES:
  # Start the agent from flags
  edgelink-agent --discovery-url https://broker.example.com/api \
    --token $TOKEN \
    --gateway-host 10.0.0.7

  # Start the agent from a config file
  edgelink-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  EDGELINK_DISCOVERY_URL  Base URL of the broker discovery API
  EDGELINK_TOKEN          Bearer token
  EDGELINK_GATEWAY_HOST   Host of the local gateway
"#)]
struct Args {
    /// Base URL of the broker discovery API
    #[arg(long, env = "EDGELINK_DISCOVERY_URL")]
    discovery_url: Option<String>,

    /// Bearer token presented to the discovery API and the broker
    #[arg(long, env = "EDGELINK_TOKEN")]
    token: Option<String>,

    /// Host of the local gateway inbound sub-streams are forwarded to
    #[arg(long, env = "EDGELINK_GATEWAY_HOST")]
    gateway_host: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    /// Base URL of the broker discovery API
    discovery_url: Option<String>,

    /// Direct bearer token (prefer using token_env)
    token: Option<String>,

    /// Environment variable name to read the bearer token from
    token_env: Option<String>,

    /// Host of the local gateway
    gateway_host: Option<String>,
}

/// Fully resolved agent settings.
#[derive(Debug)]
struct Settings {
    discovery_url: String,
    token: String,
    gateway_host: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_settings(args: Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let file_token = if let Some(env_var) = &file.token_env {
        Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        )
    } else {
        file.token
    };

    let discovery_url = args
        .discovery_url
        .or(file.discovery_url)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("Discovery URL is required (use --discovery-url or config file)")
        })?;

    let token = args
        .token
        .or(file_token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Token is required (use --token, environment variable, or config file)"
            )
        })?;

    let gateway_host = args
        .gateway_host
        .or(file.gateway_host)
        .filter(|host| !host.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("Gateway host is required (use --gateway-host or config file)")
        })?;

    Ok(Settings {
        discovery_url,
        token,
        gateway_host,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Edgelink agent starting...");

    let settings = build_settings(args).context("Failed to build agent configuration")?;

    // Log configuration (but not the token)
    info!("Discovery API: {}", settings.discovery_url);
    info!("Local gateway host: {}", settings.gateway_host);

    let backend = DiscoveryClient::new(&settings.discovery_url, settings.token.clone())
        .context("Failed to create discovery client")?;
    let manager = TunnelManager::new(
        backend,
        ManagerConfig::new(settings.token, settings.gateway_host),
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let manager_task = tokio::spawn(async move { manager.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Received ctrl-c, shutting down...");

    let _ = shutdown_tx.send(()).await;
    manager_task.await.context("Manager task panicked")?;

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            discovery_url: Some("https://broker.example.com/api".to_string()),
            token: Some("secret".to_string()),
            gateway_host: Some("10.0.0.7".to_string()),
            config: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_build_settings_from_flags() {
        let settings = build_settings(args()).unwrap();
        assert_eq!(settings.discovery_url, "https://broker.example.com/api");
        assert_eq!(settings.token, "secret");
        assert_eq!(settings.gateway_host, "10.0.0.7");
    }

    #[test]
    fn test_build_settings_requires_everything() {
        let mut missing_url = args();
        missing_url.discovery_url = None;
        assert!(build_settings(missing_url).is_err());

        let mut missing_token = args();
        missing_token.token = None;
        assert!(build_settings(missing_token).is_err());

        let mut missing_gateway = args();
        missing_gateway.gateway_host = None;
        assert!(build_settings(missing_gateway).is_err());
    }

    #[test]
    fn test_empty_values_are_rejected() {
        let mut empty_token = args();
        empty_token.token = Some(String::new());
        assert!(build_settings(empty_token).is_err());
    }

    #[test]
    fn test_config_file_fills_gaps_and_flags_win() {
        let dir = std::env::temp_dir().join("edgelink-agent-test-config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent.yaml");
        fs::write(
            &path,
            "discovery_url: https://file.example.com/api\ntoken: file-token\ngateway_host: 10.1.1.1\n",
        )
        .unwrap();

        let mut from_file = args();
        from_file.discovery_url = None;
        from_file.token = None;
        from_file.gateway_host = None;
        from_file.config = Some(path.clone());

        let settings = build_settings(from_file).unwrap();
        assert_eq!(settings.discovery_url, "https://file.example.com/api");
        assert_eq!(settings.token, "file-token");
        assert_eq!(settings.gateway_host, "10.1.1.1");

        // CLI flags take precedence over the file.
        let mut overridden = args();
        overridden.config = Some(path);
        let settings = build_settings(overridden).unwrap();
        assert_eq!(settings.token, "secret");
        assert_eq!(settings.gateway_host, "10.0.0.7");
    }
}
