//! Error types for the conversion pipeline.
//!
//! Each component has its own error enum; all of them fold into the
//! job-level [`JobError`], which is what observers see.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use humansize::{format_size, DECIMAL};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest stderr excerpt carried in a job error detail.
const MAX_DETAIL_EXCERPT: usize = 200;

/// The four ways an encoder invocation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeFailure {
    Timeout,
    EncoderFailed,
    Cancelled,
    SpawnError,
}

impl fmt::Display for EncodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncodeFailure::Timeout => "Timeout",
            EncodeFailure::EncoderFailed => "EncoderFailed",
            EncodeFailure::Cancelled => "Cancelled",
            EncodeFailure::SpawnError => "SpawnError",
        };
        f.write_str(name)
    }
}

/// Stable error kind attached to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or unsupported input, rejected before resources are committed
    Validation,
    /// Input or artifact crossed the configured size ceiling
    SizeLimitExceeded,
    /// Not enough disk, or the workspace could not be created
    Resource,
    /// Stream failure while downloading or uploading
    Transfer,
    /// Failure reported by the encoder supervisor
    Encode(EncodeFailure),
    /// Anything unclassified
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => f.write_str("ValidationError"),
            ErrorKind::SizeLimitExceeded => f.write_str("SizeLimitExceeded"),
            ErrorKind::Resource => f.write_str("ResourceError"),
            ErrorKind::Transfer => f.write_str("TransferError"),
            ErrorKind::Encode(failure) => write!(f, "EncodeError:{}", failure),
            ErrorKind::Internal => f.write_str("InternalError"),
        }
    }
}

/// Terminal error of a job: a stable kind plus a short diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {detail}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// Message suitable for the person who submitted the file.
    pub fn user_message(&self) -> String {
        match self.kind {
            ErrorKind::Validation => format!("❌ This file can't be converted: {}", self.detail),
            ErrorKind::SizeLimitExceeded => format!("❌ File too large! {}", self.detail),
            ErrorKind::Resource => "⏳ The service is busy right now, please try again later.".to_string(),
            ErrorKind::Transfer => "❌ Transfer failed, please send the file again.".to_string(),
            ErrorKind::Encode(EncodeFailure::Timeout) => "⌛ Conversion took too long and was stopped.".to_string(),
            ErrorKind::Encode(EncodeFailure::EncoderFailed) => "❌ The encoder crashed while converting this file.".to_string(),
            ErrorKind::Encode(EncodeFailure::Cancelled) => "🛑 Conversion cancelled.".to_string(),
            ErrorKind::Encode(EncodeFailure::SpawnError) => "⚠️ The converter is unavailable right now.".to_string(),
            ErrorKind::Internal => "❌ Conversion failed due to an internal error.".to_string(),
        }
    }
}

/// Errors from the workspace manager
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("insufficient free space under {root}: {available} bytes available, {required} required")]
    InsufficientSpace {
        root: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("workspace I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the transfer stager
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("payload exceeds the {limit} byte ceiling ({observed} bytes seen)")]
    SizeLimitExceeded { limit: u64, observed: u64 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Terminal failure of one encoder invocation
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("encoder exited with code {exit_code:?}")]
    EncoderFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("encoding cancelled")]
    Cancelled,

    #[error("failed to spawn encoder {binary}: {message}")]
    SpawnError { binary: PathBuf, message: String },
}

impl EncodeError {
    pub fn kind(&self) -> EncodeFailure {
        match self {
            EncodeError::Timeout(_) => EncodeFailure::Timeout,
            EncodeError::EncoderFailed { .. } => EncodeFailure::EncoderFailed,
            EncodeError::Cancelled => EncodeFailure::Cancelled,
            EncodeError::SpawnError { .. } => EncodeFailure::SpawnError,
        }
    }
}

/// Profile lookup miss
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown encode profile: {0}")]
pub struct UnknownProfile(pub String);

impl From<WorkspaceError> for JobError {
    fn from(err: WorkspaceError) -> Self {
        JobError::new(ErrorKind::Resource, err.to_string())
    }
}

impl From<TransferError> for JobError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::SizeLimitExceeded { limit, observed } => JobError::new(
                ErrorKind::SizeLimitExceeded,
                format!(
                    "Maximum size is {}, received at least {}.",
                    format_size(limit, DECIMAL),
                    format_size(observed, DECIMAL)
                ),
            ),
            other => JobError::new(ErrorKind::Transfer, other.to_string()),
        }
    }
}

impl From<EncodeError> for JobError {
    fn from(err: EncodeError) -> Self {
        let kind = ErrorKind::Encode(err.kind());
        let detail = match &err {
            EncodeError::EncoderFailed { stderr_tail, .. } => {
                match last_meaningful_line(stderr_tail) {
                    Some(line) => format!("{} ({})", err, line),
                    None => err.to_string(),
                }
            }
            _ => err.to_string(),
        };
        JobError::new(kind, detail)
    }
}

impl From<UnknownProfile> for JobError {
    fn from(err: UnknownProfile) -> Self {
        JobError::validation(err.to_string())
    }
}

/// Last non-empty stderr line, truncated, so diagnostics never carry a stderr dump.
fn last_meaningful_line(stderr: &str) -> Option<String> {
    let line = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let excerpt: String = line.chars().take(MAX_DETAIL_EXCERPT).collect();
    Some(excerpt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display_is_stable() {
        assert_eq!(ErrorKind::SizeLimitExceeded.to_string(), "SizeLimitExceeded");
        assert_eq!(ErrorKind::Encode(EncodeFailure::SpawnError).to_string(), "EncodeError:SpawnError");
        assert_eq!(ErrorKind::Resource.to_string(), "ResourceError");
    }

    #[test]
    fn test_size_limit_maps_to_its_own_kind() {
        let err: JobError = TransferError::SizeLimitExceeded { limit: 2_000_000_000, observed: 2_500_000_000 }.into();
        assert_eq!(err.kind, ErrorKind::SizeLimitExceeded);
        assert!(err.detail.contains("2 GB"), "detail was {}", err.detail);
    }

    #[test]
    fn test_encoder_failure_detail_carries_one_line_only() {
        let stderr_tail = (0..50).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let err: JobError = EncodeError::EncoderFailed { exit_code: Some(1), stderr_tail }.into();

        assert_eq!(err.kind, ErrorKind::Encode(EncodeFailure::EncoderFailed));
        assert!(err.detail.contains("line 49"));
        assert!(!err.detail.contains("line 48"));
    }

    #[test]
    fn test_user_messages_distinguish_kinds() {
        let too_large = JobError::new(ErrorKind::SizeLimitExceeded, "x").user_message();
        let busy = JobError::new(ErrorKind::Resource, "x").user_message();
        let crashed = JobError::new(ErrorKind::Encode(EncodeFailure::EncoderFailed), "x").user_message();
        assert_ne!(too_large, busy);
        assert_ne!(busy, crashed);
        assert_ne!(too_large, crashed);
    }

    #[test]
    fn test_error_kind_serde_roundtrip_keeps_encode_variant() {
        let json = serde_json::to_string(&ErrorKind::Encode(EncodeFailure::Timeout)).unwrap();
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::Encode(EncodeFailure::Timeout));
    }
}
