use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, info};

use crate::error::RequestRejection;
use crate::transfer::constants::DEFAULT_MIME_TYPE;
use crate::transfer::policy::{AccessPolicy, DownloadCounter};
use crate::transfer::progress::{TransferState, TransferStatus};
use crate::transfer::protocol::FileMetadata;
use crate::transfer::utils::validate_share;

/// A file loaded once and streamed to every receiver from the same buffer
#[derive(Clone)]
pub struct SharedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.data.len())
            .finish()
    }
}

impl SharedFile {
    pub async fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("file path has no usable name")?
            .to_string();
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();
        validate_share(&name, size)?;

        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        info!("Loaded {} ({} bytes) for sharing", name, data.len());
        Ok(Self::from_bytes(name, data))
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = mime_guess::from_path(&name)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        Self {
            name,
            mime_type,
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Outcome of a `send-file-request` against the current share
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    /// The peer is already receiving
    Ignore,
    Reject(RequestRejection),
    /// Stream the file; a download slot is now reserved for this peer
    Start,
}

/// The sender's active share: one file, one policy, one counter
#[derive(Debug, Clone)]
pub struct Share {
    file: SharedFile,
    policy: AccessPolicy,
    counter: DownloadCounter,
}

impl Share {
    pub fn new(file: SharedFile, policy: AccessPolicy) -> Self {
        Self {
            file,
            policy,
            counter: DownloadCounter::default(),
        }
    }

    pub fn file(&self) -> &SharedFile {
        &self.file
    }

    pub fn downloads(&self) -> u32 {
        self.counter.completed()
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            name: self.file.name.clone(),
            size: self.file.size(),
            mime_type: self.file.mime_type.clone(),
            is_password_protected: self.policy.password.enabled,
        }
    }

    /// Decide a peer's download request and update its transfer state to match.
    pub fn admit_request(
        &mut self,
        state: &mut TransferState,
        password: Option<&str>,
    ) -> RequestDecision {
        if state.is_active() {
            debug!("Request while transfer in progress, ignoring");
            return RequestDecision::Ignore;
        }

        match self.policy.evaluate(&self.counter, password) {
            Ok(()) => {
                self.counter.reserve();
                if state.total_size != self.file.size() {
                    state.metadata_sent(self.file.size());
                }
                state.begin();
                RequestDecision::Start
            }
            Err(rejection) => {
                state.refuse(rejection == RequestRejection::DownloadLimitReached);
                RequestDecision::Reject(rejection)
            }
        }
    }

    /// The receiver confirmed every byte. Returns the new download count.
    pub fn confirm_receipt(&mut self, state: &mut TransferState) -> Option<u32> {
        if state.status != TransferStatus::InProgress {
            return None;
        }
        state.complete();
        Some(self.counter.confirm())
    }

    /// A peer holding a reservation went away before confirming
    pub fn release(&mut self) {
        self.counter.release();
    }
}
