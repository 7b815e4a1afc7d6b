use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::transfer::constants::MAX_PREALLOCATION;
use crate::transfer::progress::{TransferState, TransferStatus};
use crate::transfer::protocol::FileMetadata;
use crate::transfer::utils::{download_target, open_secure_file, validate_share};

/// A fully reassembled file
#[derive(Clone)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl fmt::Debug for ReceivedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("metadata", &self.metadata)
            .field("received", &self.data.len())
            .finish()
    }
}

impl ReceivedFile {
    /// Write into `dir` under the sanitized remote name.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;

        let path = download_target(dir, &self.metadata.name);
        let mut file = open_secure_file(&path)
            .await
            .with_context(|| format!("cannot create {}", path.display()))?;
        file.write_all(&self.data).await?;
        file.flush().await?;

        info!("Saved {} ({} bytes)", path.display(), self.data.len());
        Ok(path)
    }
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Ignored,
    /// Bytes appended; carries the new percentage when it moved
    Progress(Option<u8>),
    Complete(ReceivedFile),
}

/// Receiver-side reassembly of one incoming file
#[derive(Debug, Default)]
pub struct Download {
    metadata: Option<FileMetadata>,
    buffer: BytesMut,
    state: TransferState,
    /// Completed on request with no bytes; the sender has not ruled yet
    unconfirmed_empty: bool,
}

impl Download {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Accept a file offer. The remote side picked these values, so they are
    /// held to the same limits as a local share.
    pub fn load_metadata(&mut self, metadata: FileMetadata) -> Result<(), SessionError> {
        validate_share(&metadata.name, metadata.size)?;
        if !self.state.metadata_sent(metadata.size) {
            return Err(SessionError::TransferActive);
        }
        self.buffer.clear();
        self.metadata = Some(metadata);
        self.unconfirmed_empty = false;
        Ok(())
    }

    /// Mark the request as sent. A zero-byte file completes on the spot.
    pub fn begin_request(&mut self) -> Result<Option<ReceivedFile>, SessionError> {
        let metadata = self.metadata.clone().ok_or(SessionError::MetadataMissing)?;
        if self.state.is_active() {
            return Err(SessionError::TransferActive);
        }

        self.buffer = BytesMut::with_capacity(metadata.size.min(MAX_PREALLOCATION) as usize);
        self.state.begin();
        self.unconfirmed_empty = metadata.size == 0;
        if metadata.size == 0 {
            self.state.complete();
            return Ok(Some(ReceivedFile {
                metadata,
                data: Bytes::new(),
            }));
        }
        Ok(None)
    }

    pub fn on_chunk(&mut self, chunk: Bytes) -> ChunkOutcome {
        if !self.state.is_active() {
            warn!("Chunk of {} bytes outside a transfer, ignoring", chunk.len());
            return ChunkOutcome::Ignored;
        }
        let received = self.buffer.len() as u64 + chunk.len() as u64;
        if received > self.state.total_size {
            warn!(
                "Chunk would overrun declared size ({} > {}), ignoring",
                received, self.state.total_size
            );
            return ChunkOutcome::Ignored;
        }

        self.buffer.extend_from_slice(&chunk);
        let percent = self.state.advance(received);
        if !self.state.is_transferred() {
            return ChunkOutcome::Progress(percent);
        }

        self.state.complete();
        let data = std::mem::take(&mut self.buffer).freeze();
        match self.metadata.clone() {
            Some(metadata) => ChunkOutcome::Complete(ReceivedFile { metadata, data }),
            None => ChunkOutcome::Ignored,
        }
    }

    /// The sender refused the request. A zero-byte file completes before the
    /// sender answers, so a refusal still overrides that completion.
    /// Returns whether the refusal applied.
    pub fn on_rejected(&mut self, limit_reached: bool) -> bool {
        if self.state.status == TransferStatus::Complete && !self.unconfirmed_empty {
            return false;
        }
        self.unconfirmed_empty = false;
        self.buffer.clear();
        self.state.refuse(limit_reached);
        true
    }
}
