//! Error types for flistd.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::services::registry::Status;

/// Main error type for flistd operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The request could not be decoded from the connection.
    #[error("malformed command: {0}")]
    Decode(String),

    /// The request decoded but is missing something its command needs.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("mount of {target} failed: {reason}")]
    MountFailed { target: String, reason: String },

    #[error("unmount of {target} failed: {reason}")]
    UnmountFailed { target: String, reason: String },

    #[error("failed to launch entrypoint {entrypoint}: {reason}")]
    LaunchFailed { entrypoint: String, reason: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already exists: {0}")]
    DuplicateId(String),

    /// The container is not in a state that allows the operation.
    #[error("container {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: String,
        actual: Status,
    },

    /// Directory cleanup after removal failed. The registry entry is gone.
    #[error("cleanup of {path} failed: {reason}")]
    CleanupFailed { path: String, reason: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("registry unavailable")]
    RegistryUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Error classification sent back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DecodeError,
    InvalidRequest,
    MountFailed,
    UnmountFailed,
    LaunchFailed,
    NotFound,
    #[serde(rename = "DuplicateID")]
    DuplicateId,
    InvalidState,
    CleanupFailed,
    Timeout,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode(_) => ErrorKind::DecodeError,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::MountFailed { .. } => ErrorKind::MountFailed,
            Error::UnmountFailed { .. } => ErrorKind::UnmountFailed,
            Error::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DuplicateId(_) => ErrorKind::DuplicateId,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::CleanupFailed { .. } => ErrorKind::CleanupFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::RegistryUnavailable | Error::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
