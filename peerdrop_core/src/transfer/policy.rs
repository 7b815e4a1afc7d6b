use std::fmt;
use std::time::Duration;

use crate::error::RequestRejection;

/// Shared-secret gate on a share
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PasswordGate {
    pub enabled: bool,
    pub value: String,
}

impl PasswordGate {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self {
            enabled: true,
            value: value.into(),
        }
    }

    /// Exact match against the supplied value; a missing value never matches an enabled gate.
    pub fn admits(&self, supplied: Option<&str>) -> bool {
        !self.enabled || supplied == Some(self.value.as_str())
    }
}

impl fmt::Debug for PasswordGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordGate")
            .field("enabled", &self.enabled)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Rules applied to every download request on one share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Completed downloads allowed. 0 allows none.
    pub download_limit: u32,
    pub password: PasswordGate,
    /// Share lifetime, measured from the moment the file is shared
    pub expires_after: Option<Duration>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            download_limit: 1,
            password: PasswordGate::disabled(),
            expires_after: None,
        }
    }
}

impl AccessPolicy {
    pub fn with_limit(download_limit: u32) -> Self {
        Self {
            download_limit,
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = PasswordGate::new(password);
        self
    }

    pub fn expiring_after(mut self, lifetime: Duration) -> Self {
        self.expires_after = Some(lifetime);
        self
    }

    /// Limit first, then password.
    pub fn evaluate(
        &self,
        counter: &DownloadCounter,
        password: Option<&str>,
    ) -> Result<(), RequestRejection> {
        if counter.limit_reached(self.download_limit) {
            return Err(RequestRejection::DownloadLimitReached);
        }
        if !self.password.admits(password) {
            return Err(RequestRejection::PasswordIncorrect);
        }
        Ok(())
    }
}

/// Confirmed downloads plus the transfers currently holding a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadCounter {
    completed: u32,
    reserved: u32,
}

impl DownloadCounter {
    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn limit_reached(&self, limit: u32) -> bool {
        self.completed.saturating_add(self.reserved) >= limit
    }

    pub fn reserve(&mut self) {
        self.reserved += 1;
    }

    /// An in-flight transfer was abandoned
    pub fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// An in-flight transfer was confirmed by the receiver
    pub fn confirm(&mut self) -> u32 {
        self.release();
        self.completed += 1;
        self.completed
    }
}
