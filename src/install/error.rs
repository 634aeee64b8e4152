use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// Fatal conditions that end an installation attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("installation cancelled by user")]
    UserCancelled,

    /// Setup problems a retry cannot fix (bad manifest, unusable directories)
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("file construction failed: {0}")]
    Construction(String),

    #[error("failed to move {0} into the install directory")]
    MoveFileToInstall(String),

    #[error("build verification failed on {count} file(s)")]
    BuildVerifyFail { count: usize },

    #[error("prerequisites installer failed: {0}")]
    Prerequisite(String),
}

/// Structured failure category reported alongside the failure text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UserCancelled,
    Initialization,
    Download,
    Construction,
    MoveFileToInstall,
    BuildVerifyFail,
    Prerequisite,
}

impl InstallError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            InstallError::UserCancelled => ErrorCategory::UserCancelled,
            InstallError::Initialization(_) => ErrorCategory::Initialization,
            InstallError::Download(_) => ErrorCategory::Download,
            InstallError::Construction(_) => ErrorCategory::Construction,
            InstallError::MoveFileToInstall(_) => ErrorCategory::MoveFileToInstall,
            InstallError::BuildVerifyFail { .. } => ErrorCategory::BuildVerifyFail,
            InstallError::Prerequisite(_) => ErrorCategory::Prerequisite,
        }
    }

    /// Cancellation and no-retry errors end the retry loop
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            InstallError::UserCancelled | InstallError::Initialization(_) | InstallError::Prerequisite(_)
        )
    }
}

/// First fatal error of the current attempt. Owned by one installer and shared
/// with its collaborators; later errors in the same attempt are dropped.
#[derive(Debug, Default)]
pub struct ErrorState {
    current: Mutex<Option<InstallError>>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the error if none is set yet. Returns true if it was recorded.
    pub fn set_fatal(&self, err: InstallError) -> bool {
        let mut current = self.current.lock();
        if let Some(existing) = current.as_ref() {
            debug!("Ignoring fatal error '{}', already failed with '{}'", err, existing);
            return false;
        }
        error!("Fatal installation error: {}", err);
        *current = Some(err);
        true
    }

    pub fn reset(&self) {
        *self.current.lock() = None;
    }

    pub fn has_fatal(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.current.lock(), Some(InstallError::UserCancelled))
    }

    pub fn is_no_retry(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map_or(false, |err| !err.is_retryable() && *err != InstallError::UserCancelled)
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        self.current.lock().as_ref().map(InstallError::category)
    }

    /// Human readable failure text, empty when there is no error
    pub fn error_string(&self) -> String {
        self.current
            .lock()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}
