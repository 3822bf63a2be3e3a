//! Error types for adc-dl
//!
//! This module provides the error handling for the library:
//! - Domain-specific error types (Queue, Share, Hub, Upload)
//! - Hook rejections surfaced verbatim from extension points
//! - HTTP status code mapping for the API boundary
//! - Structured error responses with machine-readable error codes

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::QueueToken;

/// Result type alias for adc-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for adc-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "queue.download_slots")
        key: Option<String>,
    },

    /// Queue or bundle operation failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Share or refresh operation failed
    #[error("share error: {0}")]
    Share(#[from] ShareError),

    /// Hub connection error
    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    /// Upload slot or transfer preparation error
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// A validation or completion hook rejected the operation
    #[error("rejected by hook {}: {}", .0.hook_id, .0.message)]
    HookRejected(#[from] HookRejection),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted document could not be read or written
    #[error("persistence error for {path}: {message}")]
    Persistence {
        /// Document path
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Queue and bundle errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// The target path is malformed or not absolute
    #[error("invalid target path: {path}")]
    InvalidPath {
        /// The offending path
        path: PathBuf,
    },

    /// File name matched the download skiplist
    #[error("{path} matches the download skiplist")]
    SkiplistMatch {
        /// The offending path
        path: PathBuf,
    },

    /// File carries a forbidden extension
    #[error("forbidden file extension: {extension}")]
    ForbiddenExtension {
        /// The extension, without dot
        extension: String,
    },

    /// Zero-byte files are not queued
    #[error("{path} is a zero-byte file")]
    ZeroByte {
        /// The offending path
        path: PathBuf,
    },

    /// File exceeds the configured maximum size
    #[error("file size {size} exceeds the configured limit {limit}")]
    FileTooLarge {
        /// Requested file size
        size: u64,
        /// Configured maximum
        limit: u64,
    },

    /// Identical content is already in the share
    #[error("{path} is already shared")]
    DuplicateInShare {
        /// The shared path carrying the same TTH
        path: PathBuf,
    },

    /// Identical content is already queued under a different target
    #[error("{path} is already queued")]
    DuplicateInQueue {
        /// The queued target carrying the same TTH
        path: PathBuf,
    },

    /// The target file already exists on disk with the expected size
    #[error("target {path} already exists")]
    TargetExists {
        /// The existing target
        path: PathBuf,
    },

    /// The new directory target is a parent of existing bundles
    #[error("the target contains {count} existing sub-bundles")]
    SubBundlesExist {
        /// How many existing bundles the target would swallow
        count: usize,
    },

    /// A completed bundle already covers this directory
    #[error("a finished bundle already contains {path}")]
    DuplicateFinished {
        /// The conflicting path
        path: PathBuf,
    },

    /// No bundle or item with this token
    #[error("queue entry {token} not found")]
    NotFound {
        /// The unknown token
        token: QueueToken,
    },

    /// The stored hash tree is missing, recheck cannot run
    #[error("no full tree available for {path}")]
    NoFullTree {
        /// Target of the item being rechecked
        path: PathBuf,
    },

    /// Operation requires the entry to be in a different state
    #[error("cannot {operation} entry {token} in its current state")]
    InvalidState {
        /// The entry token
        token: QueueToken,
        /// The attempted operation
        operation: String,
    },
}

/// Share and refresh errors
#[derive(Debug, Error)]
pub enum ShareError {
    /// The path is malformed, relative, or points outside allowed locations
    #[error("invalid share path: {path}")]
    InvalidPath {
        /// The offending path
        path: PathBuf,
    },

    /// The path is already covered by a share root
    #[error("{path} is already shared")]
    PathAlreadyShared {
        /// The offending path
        path: PathBuf,
    },

    /// The path is inside the excluded-path set
    #[error("{path} is excluded from sharing")]
    PathExcluded {
        /// The offending path
        path: PathBuf,
    },

    /// No share root covers the path
    #[error("{path} is not shared")]
    PathNotShared {
        /// The offending path
        path: PathBuf,
    },

    /// File name matched the share skiplist
    #[error("{path} matches the share skiplist")]
    SkiplistMatch {
        /// The offending path
        path: PathBuf,
    },

    /// No share profile with this token
    #[error("share profile {0} not found")]
    ProfileNotFound(u32),
}

/// Hub connection errors
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub URL could not be parsed
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),

    /// Certificate keyprint pinned for this hub did not match
    #[error("certificate keyprint mismatch for {url}")]
    KeyprintMismatch {
        /// Hub URL
        url: String,
    },

    /// TLS certificate could not be verified and untrusted hubs are not allowed
    #[error("untrusted TLS certificate for {url}")]
    TlsUntrusted {
        /// Hub URL
        url: String,
    },

    /// The hub redirected the session
    #[error("redirected to {target}")]
    Redirect {
        /// Redirect target URL
        target: String,
    },

    /// Session disconnected after a severe incoming flood
    #[error("disconnected after severe flood from {ip}")]
    FloodSevere {
        /// Offending peer address
        ip: String,
    },

    /// Operation requires a logged-in session
    #[error("not connected to {url}")]
    NotConnected {
        /// Hub URL
        url: String,
    },

    /// Socket-level failure
    #[error("connection failed: {0}")]
    ConnectFailed(String),
}

/// Upload slot and transfer preparation errors
#[derive(Debug, Error)]
pub enum UploadError {
    /// The requesting user is not online on any shared hub
    #[error("unknown user")]
    UnknownUser,

    /// The requested file is not in the share (or the partial set)
    #[error("file not available: {path}")]
    FileNotAvailable {
        /// Requested virtual path or TTH rendering
        path: String,
    },

    /// The file exists but the requesting profile may not access it
    #[error("access denied: {path}")]
    FileAccessDenied {
        /// Requested virtual path
        path: String,
    },

    /// No slot free; the estimated waiting-queue position is attached
    #[error("all upload slots taken, queue position {position}")]
    SlotsFull {
        /// Estimated position in the waiting queue (1-based)
        position: usize,
    },

    /// Malformed transfer request
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Rejection raised by a hook subscriber.
///
/// Surfaced verbatim to the initiating caller; the operation is aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{hook_id}: {message}")]
pub struct HookRejection {
    /// Identifier of the hook subscriber that rejected
    pub hook_id: String,
    /// Machine-readable rejection id
    pub reject_id: String,
    /// Human-readable message
    pub message: String,
}

/// API error response format for the host-facing boundary.
///
/// ```json
/// {
///   "error": {
///     "code": "duplicate_in_queue",
///     "message": "/dl/a.bin is already queued",
///     "details": { "path": "/dl/a.bin" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "slots_full")
    pub code: String,

    /// Human-readable message; hosts localise on their side
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - caller fault
            Error::Config { .. } => 400,
            Error::Queue(e) => match e {
                QueueError::InvalidPath { .. } => 400,
                QueueError::NotFound { .. } => 404,
                QueueError::DuplicateInQueue { .. }
                | QueueError::DuplicateInShare { .. }
                | QueueError::DuplicateFinished { .. }
                | QueueError::TargetExists { .. }
                | QueueError::SubBundlesExist { .. }
                | QueueError::InvalidState { .. } => 409,
                _ => 422,
            },
            Error::Share(e) => match e {
                ShareError::InvalidPath { .. } => 400,
                ShareError::PathNotShared { .. } | ShareError::ProfileNotFound(_) => 404,
                ShareError::PathAlreadyShared { .. } => 409,
                _ => 422,
            },
            Error::Upload(e) => match e {
                UploadError::UnknownUser => 404,
                UploadError::FileNotAvailable { .. } => 404,
                UploadError::FileAccessDenied { .. } => 403,
                UploadError::SlotsFull { .. } => 503,
                UploadError::Protocol(_) => 400,
            },
            Error::HookRejected(_) => 422,
            Error::NotFound(_) => 404,
            Error::InsufficientSpace { .. } => 422,
            Error::ShuttingDown => 503,
            Error::Hub(_) => 502,
            Error::Io(_) | Error::Persistence { .. } | Error::Serialization(_) | Error::Other(_) => {
                500
            }
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Queue(e) => match e {
                QueueError::InvalidPath { .. } => "invalid_path",
                QueueError::SkiplistMatch { .. } => "skiplist_match",
                QueueError::ForbiddenExtension { .. } => "forbidden_extension",
                QueueError::ZeroByte { .. } => "zero_byte",
                QueueError::FileTooLarge { .. } => "file_too_large",
                QueueError::DuplicateInShare { .. } => "duplicate_in_share",
                QueueError::DuplicateInQueue { .. } => "duplicate_in_queue",
                QueueError::TargetExists { .. } => "target_exists",
                QueueError::SubBundlesExist { .. } => "subbundle_detected",
                QueueError::DuplicateFinished { .. } => "duplicate_finished",
                QueueError::NotFound { .. } => "queue_entry_not_found",
                QueueError::NoFullTree { .. } => "no_full_tree",
                QueueError::InvalidState { .. } => "invalid_state",
            },
            Error::Share(e) => match e {
                ShareError::InvalidPath { .. } => "invalid_path",
                ShareError::PathAlreadyShared { .. } => "path_already_shared",
                ShareError::PathExcluded { .. } => "path_excluded",
                ShareError::PathNotShared { .. } => "path_not_shared",
                ShareError::SkiplistMatch { .. } => "skiplist_match",
                ShareError::ProfileNotFound(_) => "profile_not_found",
            },
            Error::Hub(e) => match e {
                HubError::InvalidUrl(_) => "invalid_hub_url",
                HubError::KeyprintMismatch { .. } => "keyprint_mismatch",
                HubError::TlsUntrusted { .. } => "tls_untrusted",
                HubError::Redirect { .. } => "redirect",
                HubError::FloodSevere { .. } => "flood_severe",
                HubError::NotConnected { .. } => "not_connected",
                HubError::ConnectFailed(_) => "connect_failed",
            },
            Error::Upload(e) => match e {
                UploadError::UnknownUser => "unknown_user",
                UploadError::FileNotAvailable { .. } => "file_not_available",
                UploadError::FileAccessDenied { .. } => "file_access_denied",
                UploadError::SlotsFull { .. } => "slots_full",
                UploadError::Protocol(_) => "protocol_error",
            },
            Error::HookRejected(_) => "hook_rejected",
            Error::Io(_) => "io_error",
            Error::Persistence { .. } => "persistence_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::InsufficientSpace { .. } => "insufficient_space",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Queue(QueueError::NotFound { token }) => Some(serde_json::json!({
                "token": token,
            })),
            Error::Queue(QueueError::SubBundlesExist { count }) => Some(serde_json::json!({
                "sub_bundles": count,
            })),
            Error::Queue(QueueError::FileTooLarge { size, limit }) => Some(serde_json::json!({
                "size": size,
                "limit": limit,
            })),
            Error::Upload(UploadError::SlotsFull { position }) => Some(serde_json::json!({
                "queue_position": position,
            })),
            Error::InsufficientSpace {
                required,
                available,
            } => Some(serde_json::json!({
                "required_bytes": required,
                "available_bytes": available,
            })),
            Error::HookRejected(r) => Some(serde_json::json!({
                "hook_id": r.hook_id,
                "reject_id": r.reject_id,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
