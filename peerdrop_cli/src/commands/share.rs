use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use peerdrop_core::config::AppConfig;
use peerdrop_core::transfer::utils::format_size;
use peerdrop_core::{AccessPolicy, Role, SessionEvent, SessionHandle, SharedFile};
use tracing::{error, info, warn};

use super::connect;
use crate::output::{ProgressSteps, render_qr};

#[derive(Debug, Args)]
pub struct ShareArgs {
    /// File to share
    pub file: PathBuf,

    /// Completed downloads allowed (defaults to the configured limit)
    #[arg(short, long)]
    pub limit: Option<u32>,

    /// Password receivers must supply
    #[arg(short, long)]
    pub password: Option<String>,

    /// Stop sharing after this many minutes
    #[arg(long, value_name = "MIN")]
    pub expires_in: Option<u64>,
}

impl ShareArgs {
    pub fn policy(&self, config: &AppConfig) -> AccessPolicy {
        let mut policy = AccessPolicy::with_limit(self.limit.unwrap_or(config.download_limit));
        if let Some(password) = &self.password {
            policy = policy.with_password(password.clone());
        }
        if let Some(minutes) = self.expires_in {
            policy = policy.expiring_after(Duration::from_secs(minutes * 60));
        }
        policy
    }
}

pub async fn execute(args: &ShareArgs, config: &AppConfig) -> Result<()> {
    let file = SharedFile::open(&args.file).await?;
    let policy = args.policy(config);
    println!(
        "Sharing {} ({}, {})",
        file.name,
        format_size(file.size()),
        file.mime_type
    );

    let (connector, relay) = connect(config)?;
    let (handle, mut events) =
        SessionHandle::spawn(Role::Sender, config.session_options(), connector, relay);
    let mut progress: HashMap<String, ProgressSteps> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing the share");
                break;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            SessionEvent::RelayConnected => handle.create_session().await?,
            SessionEvent::SessionCreated { session_id } => {
                let link = config.share_link(&session_id);
                println!("\nSession: {}\nLink:    {}\n", session_id, link);
                match render_qr(&link) {
                    Ok(qr) => println!("{}", qr),
                    Err(e) => warn!("No QR code: {:#}", e),
                }
                handle.share_file(file.clone(), policy.clone()).await?;
            }
            SessionEvent::PeerJoined { peer_id } => info!("Receiver {} joined", peer_id),
            SessionEvent::TransferProgress {
                peer_id,
                percent,
                is_sending: true,
                ..
            } => {
                let steps = progress.entry(peer_id.clone()).or_default();
                if let Some(step) = steps.update(percent) {
                    info!("{} -> {}%", peer_id, step);
                }
            }
            SessionEvent::RequestRejected { peer_id, rejection } => {
                warn!("Refused {}: {}", peer_id, rejection)
            }
            SessionEvent::TransferCompleted { peer_id, downloads } => {
                progress.remove(&peer_id);
                println!(
                    "Delivered to {} ({} of {} downloads)",
                    peer_id, downloads, policy.download_limit
                );
            }
            SessionEvent::PeerLeft { peer_id, reason } => {
                progress.remove(&peer_id);
                info!("Receiver {} left: {}", peer_id, reason);
            }
            SessionEvent::RelayError(message) | SessionEvent::Error(message) => {
                error!("{}", message)
            }
            SessionEvent::ShareExpired => println!("Share expired"),
            SessionEvent::SessionClosed { reason } => {
                info!("Session closed: {}", reason);
                break;
            }
            _ => {}
        }
    }

    handle.shutdown().await
}
