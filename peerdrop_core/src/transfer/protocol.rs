//! Frames exchanged over an open data channel.
//!
//! Control frames are JSON text messages tagged by `type`. File content
//! travels as raw binary messages with no envelope, so a binary message is
//! always the next chunk whatever its bytes look like.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::constants::CHUNK_SIZE;

/// Description of the shared file, sent once per receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub is_password_protected: bool,
}

/// Control-plane messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Sender -> receiver: what is on offer
    FileMetadata(FileMetadata),
    /// Receiver -> sender: please start streaming
    SendFileRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Sender -> receiver: the supplied password did not match
    PasswordIncorrect,
    /// Sender -> receiver: no downloads left on this share
    DownloadLimitReached,
    /// Receiver -> sender: every byte arrived
    FileReceived,
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag, for logging without the payload
    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::FileMetadata(_) => "file-metadata",
            ControlFrame::SendFileRequest { .. } => "send-file-request",
            ControlFrame::PasswordIncorrect => "password-incorrect",
            ControlFrame::DownloadLimitReached => "download-limit-reached",
            ControlFrame::FileReceived => "file-received",
        }
    }
}

/// A decoded channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Chunk(Bytes),
    /// Text that is not one of our control frames
    Unrecognized(String),
}

impl Frame {
    pub fn from_text(text: &str) -> Frame {
        match serde_json::from_str::<ControlFrame>(text) {
            Ok(frame) => Frame::Control(frame),
            Err(e) => Frame::Unrecognized(e.to_string()),
        }
    }

    pub fn from_binary(payload: Bytes) -> Frame {
        Frame::Chunk(payload)
    }
}

/// Split a file into consecutive `CHUNK_SIZE` slices without copying.
pub fn chunks(data: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(move |start| data.slice(start..(start + CHUNK_SIZE).min(data.len())))
}
