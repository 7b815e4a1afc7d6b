use thiserror::Error;

use crate::signaling::session::Role;
use crate::transfer::protocol::ControlFrame;

/// Failures the session loop reports back to its caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("relay connection is not ready")]
    RelayNotReady,
    #[error("command requires the {0:?} role")]
    WrongRole(Role),
    #[error("no file is being shared")]
    NoSharedFile,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("no connected peer")]
    NoPeer,
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("file metadata has not arrived yet")]
    MetadataMissing,
    #[error("a transfer is already in progress")]
    TransferActive,
    #[error("file is {size} bytes, the limit is {max}")]
    FileTooLarge { size: u64, max: u64 },
    #[error("file name is {len} characters, the limit is {max}")]
    FileNameTooLong { len: usize, max: usize },
}

/// Why a sender refused a download request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestRejection {
    #[error("download limit reached")]
    DownloadLimitReached,
    #[error("password incorrect")]
    PasswordIncorrect,
}

impl RequestRejection {
    /// The control frame that tells the receiver
    pub fn reply(self) -> ControlFrame {
        match self {
            RequestRejection::DownloadLimitReached => ControlFrame::DownloadLimitReached,
            RequestRejection::PasswordIncorrect => ControlFrame::PasswordIncorrect,
        }
    }
}
