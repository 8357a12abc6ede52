//! Error types for segment-dl
//!
//! Errors are layered the same way the engine is:
//! - [`BlockIoError`] - what went wrong while copying one block (HTTP, disk, short body)
//! - [`BlockTransferError`] - a [`BlockIoError`] tagged with the block it happened to,
//!   carrying enough information to re-issue exactly that byte range
//! - [`Error`] - the crate-level error returned by planning and lifecycle operations

use std::sync::Arc;

use thiserror::Error;

use crate::types::{BlockId, BlockTransferContext, ByteRange};

/// Result type alias for segment-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for segment-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "chunk_size")
        key: Option<String>,
    },

    /// A block failed and was not recovered by its retry policy
    #[error(transparent)]
    Block(#[from] BlockTransferError),

    /// I/O error outside of a block copy (preparing the destination file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error outside of a block copy (building the client, probing the size)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Probing the remote while planning failed
    #[error("remote request failed: {0}")]
    Remote(#[from] BlockIoError),

    /// The remote location is not a usable URL
    #[error("invalid remote location: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The remote did not report its size, so no block layout can be planned
    #[error("remote did not report a content length for {0}")]
    MissingContentLength(String),

    /// A block layout violates the coverage invariant
    #[error("invalid block layout: {0}")]
    InvalidLayout(String),

    /// Operation not allowed in the transfer's current state
    #[error("cannot {operation} transfer in state {current_state}")]
    InvalidState {
        /// The operation that was attempted (e.g., "activate")
        operation: String,
        /// The state that prevented it
        current_state: String,
    },

    /// The downloader has been disposed
    #[error("transfer has been disposed")]
    Disposed,

    /// The caller's cancellation token fired while waiting for the transfer
    #[error("transfer activation was cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a configuration error tied to a config key
    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Failure while copying a single block
#[derive(Debug, Error)]
pub enum BlockIoError {
    /// The HTTP request or body stream failed
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Reading from the remote or writing the local file failed
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The remote answered with an unsuccessful status code
    #[error("remote answered with status {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },

    /// The remote did not honour the range request
    #[error("remote did not honour the range request (status {status})")]
    RangeNotSatisfied {
        /// HTTP status code returned instead of 206
        status: u16,
    },

    /// The remote data ended before the block was filled
    #[error("remote data ended after {received} of {expected} bytes")]
    ShortRead {
        /// Bytes the block still needed when the copy started
        expected: u64,
        /// Bytes actually received before end of data
        received: u64,
    },

    /// Failure reported by a custom [`RemoteSource`](crate::source::RemoteSource)
    #[error("{0}")]
    Source(String),
}

/// A block I/O failure tagged with the block it happened to
///
/// The wrapped context is the block's state at the moment of failure, so
/// `completed_bytes` tells how much of the range is already on disk and
/// [`retry_range`](Self::retry_range) gives the exact remainder to re-fetch.
#[derive(Clone, Debug, Error)]
#[error("{context} failed: {source}")]
pub struct BlockTransferError {
    context: BlockTransferContext,
    #[source]
    source: Arc<BlockIoError>,
}

impl BlockTransferError {
    /// Wrap a failure together with the block context it belongs to
    pub fn new(context: BlockTransferContext, source: impl Into<BlockIoError>) -> Self {
        Self {
            context,
            source: Arc::new(source.into()),
        }
    }

    /// The block context at the moment of failure
    pub fn context(&self) -> &BlockTransferContext {
        &self.context
    }

    /// The failure cause
    pub fn cause(&self) -> &BlockIoError {
        &self.source
    }

    /// Id of the failed block
    pub fn block_id(&self) -> BlockId {
        self.context.id
    }

    /// Offset of the failed block within the resource
    pub fn offset(&self) -> u64 {
        self.context.offset
    }

    /// Full length of the failed block
    pub fn length(&self) -> u64 {
        self.context.length
    }

    /// The part of the block that still has to be fetched
    pub fn retry_range(&self) -> ByteRange {
        self.context.remaining_range()
    }
}
