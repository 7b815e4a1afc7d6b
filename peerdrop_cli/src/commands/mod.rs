//! CLI command definitions and dispatch.

pub mod fetch;
pub mod share;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use peerdrop_core::config::AppConfig;
use peerdrop_core::{Connector, RelayChannels, connect_relay};
use peerdrop_rtc::RtcConnector;

/// PeerDrop: browser-compatible peer-to-peer file sharing
#[derive(Debug, Parser)]
#[command(name = "peerdrop", version, about, long_about = None)]
pub struct Cli {
    /// Relay WebSocket URL (overrides the config file)
    #[arg(long, global = true)]
    pub relay: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Share a file and serve every receiver until stopped
    Share(share::ShareArgs),
    /// Download a file from a session
    Fetch(fetch::FetchArgs),
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        let mut config = AppConfig::load();
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        match &self.command {
            Commands::Share(args) => share::execute(args, &config).await,
            Commands::Fetch(args) => fetch::execute(args, &config).await,
        }
    }
}

/// Relay connection and WebRTC connector for one session
pub fn connect(config: &AppConfig) -> Result<(Arc<dyn Connector>, RelayChannels)> {
    let connector = RtcConnector::new(&config.ice_servers)?;
    let relay = connect_relay(&config.relay_url)?;
    Ok((Arc::new(connector), relay))
}
