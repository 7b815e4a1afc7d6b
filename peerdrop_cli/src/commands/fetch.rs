use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use clap::Args;
use peerdrop_core::config::AppConfig;
use peerdrop_core::transfer::utils::format_size;
use peerdrop_core::{Role, SessionEvent, SessionHandle, SessionOptions};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::connect;
use crate::output::ProgressSteps;

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Session id from the share link
    pub session_id: String,

    /// Password for a protected file
    #[arg(short, long)]
    pub password: Option<String>,

    /// Directory to save into (defaults to the configured download path)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Accept either a bare session id or a full share link
pub fn session_id_from(input: &str) -> &str {
    let trimmed = input.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub async fn execute(args: &FetchArgs, config: &AppConfig) -> Result<()> {
    let save_dir = args
        .out
        .clone()
        .unwrap_or_else(|| config.download_path.clone());
    let options = SessionOptions {
        completion: config.completion,
        save_dir: Some(save_dir),
    };

    let (connector, relay) = connect(config)?;
    let (handle, mut events) = SessionHandle::spawn(Role::Receiver, options, connector, relay);

    let result = tokio::select! {
        result = receive(&handle, &mut events, args) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };
    handle.shutdown().await?;

    let path = result?;
    println!("Saved to {}", path.display());
    Ok(())
}

async fn receive(
    handle: &SessionHandle,
    events: &mut mpsc::Receiver<SessionEvent>,
    args: &FetchArgs,
) -> Result<PathBuf> {
    let session_id = session_id_from(&args.session_id);
    let mut requested = false;
    let mut received = false;
    let mut progress = ProgressSteps::default();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::RelayConnected => handle.join_session(session_id).await?,
            SessionEvent::SessionJoined { session_id } => info!("Joined {}", session_id),
            SessionEvent::MetadataReceived(metadata) => {
                println!(
                    "{} ({}, {}){}",
                    metadata.name,
                    format_size(metadata.size),
                    metadata.mime_type,
                    if metadata.is_password_protected {
                        ", password protected"
                    } else {
                        ""
                    }
                );
                if requested {
                    continue;
                }
                if metadata.is_password_protected && args.password.is_none() {
                    bail!("the file is password protected, pass --password");
                }
                handle.request_download(args.password.clone()).await?;
                requested = true;
            }
            SessionEvent::TransferProgress {
                percent,
                is_sending: false,
                ..
            } => {
                if let Some(step) = progress.update(percent) {
                    info!("Downloading... {}%", step);
                }
            }
            SessionEvent::DownloadRejected(rejection) => bail!("sender refused: {}", rejection),
            SessionEvent::FileReceived(file) => {
                received = true;
                info!("Received {} bytes, saving", file.data.len());
            }
            SessionEvent::FileSaved { path } => return Ok(path),
            SessionEvent::PeerLeft { reason, .. } if !received => {
                bail!("sender went away: {}", reason)
            }
            SessionEvent::RelayError(message) => bail!("relay: {}", message),
            SessionEvent::Error(message) => bail!(message),
            SessionEvent::SessionClosed { reason } => bail!("session closed: {}", reason),
            SessionEvent::PeerStateChanged { peer_id, state } => {
                info!("Connection to {} is {:?}", peer_id, state)
            }
            _ => {}
        }
    }
    warn!("Session loop ended without a file");
    Err(anyhow!("session ended before the file arrived"))
}
