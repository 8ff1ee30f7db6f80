//! Central error type and status codes (thiserror-based).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::MediaTime;

/// Status codes surfaced to callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success,
    PropertyNotSupported,
    PropertyReadOnly,
    InvalidParameter,
    InvalidSession,
    AllocationFailed,
    CodecNotFound,
    CodecMalfunction,
    FormatChangeNotSupported,
    InvalidTimestamp,
    InvalidTimeRange,
    StorageInvalid,
    UnsupportedFormat,
}

/// Broad error classes, used to decide how a caller recovers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad property, capability or format. Fix the configuration.
    Configuration,
    /// Call made out of order. A programming error.
    Sequencing,
    /// The codec failed while working on a frame.
    CodecRuntime,
    /// Backing storage problem; fatal to the current pass only.
    Storage,
}

/// Errors produced by sessions, codecs and multi-pass storage.
#[derive(Error, Debug)]
pub enum CodingError {
    #[error("Property not supported: {key}")]
    PropertyNotSupported { key: String },

    #[error("Property is read-only: {key}")]
    PropertyReadOnly { key: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Session has been invalidated")]
    InvalidSession,

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("No codec found for {0}")]
    CodecNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Codec malfunction: {0}")]
    CodecMalfunction(String),

    #[error("Format change not supported: {0}")]
    FormatChangeNotSupported(String),

    #[error("Invalid timestamp {timestamp}: must be greater than {last}")]
    InvalidTimestamp {
        timestamp: MediaTime,
        last: MediaTime,
    },

    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("Storage invalid: {0}")]
    StorageInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodingError {
    pub fn status(&self) -> Status {
        match self {
            Self::PropertyNotSupported { .. } => Status::PropertyNotSupported,
            Self::PropertyReadOnly { .. } => Status::PropertyReadOnly,
            Self::InvalidParameter(_) => Status::InvalidParameter,
            Self::InvalidSession => Status::InvalidSession,
            Self::AllocationFailed(_) => Status::AllocationFailed,
            Self::CodecNotFound(_) => Status::CodecNotFound,
            Self::UnsupportedFormat(_) => Status::UnsupportedFormat,
            Self::CodecMalfunction(_) => Status::CodecMalfunction,
            Self::FormatChangeNotSupported(_) => Status::FormatChangeNotSupported,
            Self::InvalidTimestamp { .. } => Status::InvalidTimestamp,
            Self::InvalidTimeRange(_) => Status::InvalidTimeRange,
            Self::StorageInvalid(_) | Self::Io(_) | Self::Json(_) => Status::StorageInvalid,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.status() {
            Status::PropertyNotSupported
            | Status::PropertyReadOnly
            | Status::InvalidParameter
            | Status::CodecNotFound
            | Status::UnsupportedFormat
            | Status::FormatChangeNotSupported => ErrorClass::Configuration,
            Status::InvalidSession | Status::InvalidTimestamp => ErrorClass::Sequencing,
            Status::CodecMalfunction | Status::AllocationFailed | Status::Success => {
                ErrorClass::CodecRuntime
            }
            Status::InvalidTimeRange | Status::StorageInvalid => ErrorClass::Storage,
        }
    }

    pub fn invalid_timestamp(timestamp: MediaTime, last: MediaTime) -> Self {
        Self::InvalidTimestamp { timestamp, last }
    }
}

/// Convenience Result type for coding operations.
pub type CodingResult<T> = Result<T, CodingError>;
