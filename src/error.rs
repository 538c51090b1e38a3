// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Error taxonomy for the read path. Variants group by the kinds §7 of the
/// design distinguishes: permanent data errors, transient fetch errors,
/// shape errors, and shutdown errors.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("article {message_id} not found")]
    ArticleNotFound { message_id: String },

    #[error("data corruption detected: {reason}")]
    DataCorruption { reason: String },

    #[error(
        "file corrupted: {bytes_already_delivered} of {total_expected_size} bytes delivered: {source}"
    )]
    CorruptedFile {
        total_expected_size: u64,
        bytes_already_delivered: u64,
        #[source]
        source: Box<ReaderError>,
    },

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("closed")]
    Closed,

    #[error("pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("fetch timed out after {0} attempts")]
    FetchTimeout(u32),

    #[error("transient fetch error: {0}")]
    Transient(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ReaderError {
    /// Whether this error should be retried by the downloader's worker loop.
    ///
    /// Pool unavailability is deliberately excluded: spec-wise, failing to
    /// obtain a pool client at all is fatal for that attempt and is not
    /// retried at this layer.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ReaderError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ReaderError::ArticleNotFound { .. } | ReaderError::DataCorruption { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReaderError>;
