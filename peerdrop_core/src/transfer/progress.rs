use serde::Serialize;

/// Where one peer's transfer stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Idle,
    MetadataSent,
    /// A request was refused with a retryable reply
    AwaitingRequest,
    InProgress,
    Complete,
    LimitReached,
}

/// Integer percentage, floored. 0/0 counts as done.
pub fn progress_percent(offset: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let offset = offset.min(total);
    ((offset as u128 * 100) / total as u128) as u8
}

/// Per-peer transfer bookkeeping shared by both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub status: TransferStatus,
    pub offset: u64,
    pub total_size: u64,
    pub progress_percent: u8,
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferState {
    pub fn new() -> Self {
        Self {
            status: TransferStatus::Idle,
            offset: 0,
            total_size: 0,
            progress_percent: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TransferStatus::InProgress
    }

    /// Metadata for a file of `total` bytes went out (or came in).
    /// Returns false while a transfer is running.
    pub fn metadata_sent(&mut self, total: u64) -> bool {
        if self.is_active() {
            return false;
        }
        self.status = TransferStatus::MetadataSent;
        self.offset = 0;
        self.total_size = total;
        self.progress_percent = 0;
        true
    }

    pub fn begin(&mut self) {
        self.status = TransferStatus::InProgress;
        self.offset = 0;
        self.progress_percent = progress_percent(0, self.total_size);
    }

    /// Move the offset forward. Returns the new percentage if it changed.
    ///
    /// Regressions, overshoots and updates outside an active transfer are dropped.
    pub fn advance(&mut self, offset: u64) -> Option<u8> {
        if !self.is_active() || offset < self.offset || offset > self.total_size {
            return None;
        }
        self.offset = offset;
        let percent = progress_percent(offset, self.total_size);
        if percent == self.progress_percent {
            return None;
        }
        self.progress_percent = percent;
        Some(percent)
    }

    pub fn is_transferred(&self) -> bool {
        self.offset == self.total_size
    }

    pub fn complete(&mut self) {
        self.status = TransferStatus::Complete;
        self.offset = self.total_size;
        self.progress_percent = 100;
    }

    pub fn refuse(&mut self, limit_reached: bool) {
        self.status = if limit_reached {
            TransferStatus::LimitReached
        } else {
            TransferStatus::AwaitingRequest
        };
        self.offset = 0;
        self.progress_percent = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
