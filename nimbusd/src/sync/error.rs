use thiserror::Error;

use nimbus_core::NimbusError;

use super::copier::CopyError;
use super::paths::PathError;
use super::transfer::TransferError;
use super::watchdog::WatchdogError;

/// Failure taxonomy of the coordination layer. Absence ("not found") and
/// malformed metadata are never represented here — they travel as ordinary
/// result values and diagnostics lists.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("container {id} unavailable: {source}")]
    ContainerUnavailable {
        id: String,
        #[source]
        source: NimbusError,
    },
    #[error("transfer stalled after {attempts} attempts")]
    Stalled { attempts: usize },
    #[error("download failed: {0}")]
    Download(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("api error: {0}")]
    Store(#[from] NimbusError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("copy error: {0}")]
    Copy(#[from] CopyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote operation failed")]
    OperationFailed,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl From<WatchdogError> for SyncError {
    fn from(err: WatchdogError) -> Self {
        match err {
            WatchdogError::Stalled { attempts } => SyncError::Stalled { attempts },
            WatchdogError::Download(message) => SyncError::Download(message),
            WatchdogError::Cancelled => SyncError::Cancelled,
        }
    }
}
