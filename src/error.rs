//! Error types for the download engine.
//!
//! Segment-level failures are caught at the worker boundary and turned into a
//! `failed` status by the lifecycle code; these errors only reach callers of
//! the control operations (`enqueue`, `resume`, ...) directly.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::TransferStatus;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// No final URL could be obtained for the transfer.
    #[error("Failed to resolve metadata for {url}: {reason}")]
    MetadataResolution { url: String, reason: String },

    /// Connection, timeout, or non-success status while talking to the server.
    #[error("Network error: {message}")]
    Network {
        message: String,
        status: Option<u16>,
    },

    /// The destination file could not be opened, sized, or written.
    #[error("Storage error on {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// A ranged request was answered with the whole entity.
    #[error("Server ignored the range request for segment {segment}")]
    RangeNotHonoured { segment: usize },

    #[error("Cannot {action} transfer {id:?} while it is {status}")]
    InvalidTransition {
        id: PathBuf,
        status: TransferStatus,
        action: &'static str,
    },

    #[error("No transfer registered for {id:?}")]
    NotFound { id: PathBuf },

    /// A non-terminal transfer already owns this destination path.
    #[error("A transfer is already active for {id:?}")]
    DuplicateTransfer { id: PathBuf },

    #[error("Worker pool unavailable: {0}")]
    Pool(String),
}

impl DownloadError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: None,
        }
    }

    pub fn network_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Network {
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// HTTP status code attached to a network error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_status_is_exposed() {
        let err = DownloadError::network_with_status("Segment request failed", 503);
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(DownloadError::network("reset").status_code(), None);
    }

    #[test]
    fn invalid_transition_message_names_status() {
        let err = DownloadError::InvalidTransition {
            id: PathBuf::from("/tmp/a.bin"),
            status: TransferStatus::Completed,
            action: "resume",
        };
        assert_eq!(
            err.to_string(),
            "Cannot resume transfer \"/tmp/a.bin\" while it is completed"
        );
    }
}
