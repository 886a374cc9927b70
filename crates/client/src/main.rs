//! Tapo command line client
//!
//! Discover devices on the local network and call their API.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tapo_client::config::Config;
use tapo_client::{ApiClient, CloudClient, ProtocolPreference, TapoClient};
use tapo_protocol::TapoRequest;

/// Tapo device client.
#[derive(Parser, Debug)]
#[command(name = "tapo")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Broadcast a discovery probe and list the devices that answer
    Discover {
        /// Seconds to listen for replies (defaults to the configured value)
        #[arg(long, short)]
        timeout: Option<u64>,

        /// Broadcast address (defaults to the configured value)
        #[arg(long, short)]
        broadcast: Option<String>,

        /// Print the devices as JSON
        #[arg(long)]
        json: bool,

        /// List the devices of the cloud account instead of scanning
        #[arg(long, conflicts_with = "broadcast")]
        cloud: bool,
    },

    /// Print the device information of one device
    Info {
        /// Device address
        host: String,

        /// Protocol: auto, passthrough or klap
        #[arg(long, short)]
        protocol: Option<ProtocolPreference>,
    },

    /// Call an arbitrary device method
    Send {
        /// Device address
        host: String,

        /// Method name, e.g. get_device_usage
        method: String,

        /// Method parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Protocol: auto, passthrough or klap
        #[arg(long, short)]
        protocol: Option<ProtocolPreference>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    let overridden = config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for setting in overridden {
        tracing::debug!("Overriding {} from environment", setting);
    }

    match cli.command {
        Commands::Discover {
            cloud: true, json, ..
        } => {
            require_username(&config)?;
            let timeout = Duration::from_secs(config.client.request_timeout_secs);
            let devices = CloudClient::new(timeout)?
                .get_devices(&config.credential())
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices on the cloud account.");
            } else {
                for device in &devices {
                    println!(
                        "{:<16} {:<20} {:<14} {}",
                        device.ip_address.as_deref().unwrap_or("-"),
                        device.device_type,
                        device.device_model,
                        device.device_mac,
                    );
                }
            }
        }
        Commands::Discover {
            timeout,
            broadcast,
            json,
            ..
        } => {
            let mut scanner = config.discovery_scanner();
            if let Some(secs) = timeout {
                scanner = scanner.timeout(Duration::from_secs(secs));
            }
            if let Some(address) = broadcast {
                scanner = scanner.broadcast_address(address);
            }

            let devices = scanner.scan().await?.collect().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found.");
            } else {
                for device in &devices {
                    println!(
                        "{:<16} {:<20} {:<14} {} ({})",
                        device.ip,
                        device.device_type,
                        device.device_model,
                        device.mac,
                        device
                            .mgt_encrypt_schm
                            .encrypt_type
                            .as_deref()
                            .unwrap_or("unknown"),
                    );
                }
            }
        }
        Commands::Info { host, protocol } => {
            let api = connect(&config, &host, protocol)?;
            let info = api.get_device_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Send {
            host,
            method,
            params,
            protocol,
        } => {
            let params = params
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--params is not valid JSON")?;
            let api = connect(&config, &host, protocol)?;
            let response = api.execute_raw(&TapoRequest::new(method, params)).await?;
            println!("{}", serde_json::to_string_pretty(&response.result)?);
        }
    }

    Ok(())
}

fn connect(
    config: &Config,
    host: &str,
    protocol: Option<ProtocolPreference>,
) -> anyhow::Result<ApiClient> {
    require_username(config)?;

    let mut options = config.client_options();
    if let Some(protocol) = protocol {
        options.protocol = protocol;
    }
    let client = TapoClient::new(host, config.credential(), options)
        .with_context(|| format!("Failed to create client for {}", host))?;
    Ok(ApiClient::new(client))
}

fn require_username(config: &Config) -> anyhow::Result<()> {
    if config.credentials.username.is_empty() {
        anyhow::bail!("No username configured; set TAPO_USERNAME or [credentials] in the config file");
    }
    Ok(())
}
