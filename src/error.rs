//! Error types for sticker conversion

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::media::MediaKind;
use crate::pipeline::StageReport;

/// Result type for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Coarse classification used by callers to map errors to user-facing text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidOptions,
    UnknownFormat,
    UnsupportedConversion,
    InputTooLarge,
    Resource,
    StageTimeout,
    StageFailed,
    Cancelled,
}

/// Why a stage was considered failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The process could not be started at all
    SpawnFailed(String),
    /// Exited with a non-zero status code
    ExitCode(i32),
    /// Terminated without an exit code (killed by a signal)
    Terminated,
    /// Exited successfully but the declared output is missing or empty
    MissingOutput(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::SpawnFailed(e) => write!(f, "could not spawn: {}", e),
            FailureReason::ExitCode(code) => write!(f, "exit status {}", code),
            FailureReason::Terminated => write!(f, "terminated by signal"),
            FailureReason::MissingOutput(what) => write!(f, "expected output missing: {}", what),
        }
    }
}

/// Error types for conversion operations
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Unknown input format: {0}")]
    UnknownFormat(String),

    #[error("Unsupported conversion: {from} -> {to}")]
    UnsupportedConversion { from: MediaKind, to: MediaKind },

    #[error("Input too large: {size} bytes (limit {limit})")]
    InputTooLarge { size: u64, limit: u64 },

    #[error("Resource error: {context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage '{stage}' timed out after {timeout:?}")]
    StageTimeout {
        stage: String,
        timeout: Duration,
        report: Box<StageReport>,
    },

    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed {
        stage: String,
        reason: FailureReason,
        report: Box<StageReport>,
    },

    #[error("Conversion cancelled during stage '{stage}'")]
    Cancelled { stage: String },
}

impl ConvertError {
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::InvalidOptions(_) => ErrorKind::InvalidOptions,
            ConvertError::UnknownFormat(_) => ErrorKind::UnknownFormat,
            ConvertError::UnsupportedConversion { .. } => ErrorKind::UnsupportedConversion,
            ConvertError::InputTooLarge { .. } => ErrorKind::InputTooLarge,
            ConvertError::Resource { .. } => ErrorKind::Resource,
            ConvertError::StageTimeout { .. } => ErrorKind::StageTimeout,
            ConvertError::StageFailed { .. } => ErrorKind::StageFailed,
            ConvertError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Whether the caller may reasonably try the same request again later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Resource | ErrorKind::StageTimeout | ErrorKind::StageFailed
        )
    }

    /// Name of the failing stage, for stage-level errors
    pub fn stage(&self) -> Option<&str> {
        match self {
            ConvertError::StageTimeout { stage, .. }
            | ConvertError::StageFailed { stage, .. }
            | ConvertError::Cancelled { stage } => Some(stage.as_str()),
            _ => None,
        }
    }

    /// Captured diagnostics of the failing stage
    pub fn report(&self) -> Option<&StageReport> {
        match self {
            ConvertError::StageTimeout { report, .. } | ConvertError::StageFailed { report, .. } => {
                Some(report.as_ref())
            }
            _ => None,
        }
    }

    /// Short message suitable for showing to the person who sent the media
    pub fn user_message(&self) -> String {
        match self {
            ConvertError::InvalidOptions(msg) => msg.clone(),
            ConvertError::UnknownFormat(_) => "File is not an image.".to_string(),
            ConvertError::UnsupportedConversion { .. } => {
                "Please send an image, GIF, or sticker.".to_string()
            }
            ConvertError::InputTooLarge { .. } => "File is too large.".to_string(),
            ConvertError::Cancelled { .. } => "Conversion was cancelled.".to_string(),
            ConvertError::Resource { .. }
            | ConvertError::StageTimeout { .. }
            | ConvertError::StageFailed { .. } => "Something went wrong.".to_string(),
        }
    }
}
