//! # segment-dl
//!
//! Segmented, resumable downloads of a single remote resource.
//!
//! A transfer is split into contiguous blocks. Each block is copied by its own
//! engine from an HTTP range request into the matching region of the
//! destination file, reporting per-chunk progress as it goes. The
//! [`Downloader`] runs the engines concurrently, merges their progress and
//! settles the transfer as completed, faulted or suspended.
//!
//! ## Design Philosophy
//!
//! - **Resumable** - Every block records how far it got; a suspended or
//!   faulted transfer continues from there
//! - **Fail fast** - The first block that fails for good stops its siblings
//! - **Event-driven** - Consumers subscribe to progress and status changes
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//!
//! ## Quick Start
//!
//! ```no_run
//! use segment_dl::{Config, Downloader, TransferStatus};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = Downloader::new(
//!         "https://example.com/large.iso",
//!         "downloads/large.iso",
//!         Config::default(),
//!     )?;
//!
//!     // Watch per-block progress
//!     let mut progress = downloader.subscribe_progress();
//!     tokio::spawn(async move {
//!         while let Ok(block) = progress.recv().await {
//!             println!("{block}: {} bytes", block.completed_bytes);
//!         }
//!     });
//!
//!     let status = downloader.activate(CancellationToken::new()).await?;
//!     assert_eq!(status, TransferStatus::Completed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Block stream engine
pub mod block;
/// Configuration types
pub mod config;
/// Transfer orchestration
pub mod downloader;
/// Error types
pub mod error;
/// Block layout planning
pub mod layout;
/// Retry logic with exponential backoff
pub mod retry;
/// Remote sources and local destinations
pub mod source;
/// Speed limiting with token bucket
pub mod speed_limiter;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use block::{BlockCheckpoint, BlockEvent, BlockEvents, BlockStream, BlockSubscription};
pub use config::{Config, HttpConfig, RetryConfig};
pub use downloader::Downloader;
pub use error::{BlockIoError, BlockTransferError, Error, Result};
pub use retry::IsRetryable;
pub use source::{HttpSource, RemoteSource, StreamPair};
pub use speed_limiter::SpeedLimiter;
pub use types::{
    BlockDescriptor, BlockId, BlockTransferContext, ByteRange, Event, TransferContext, TransferId,
    TransferStatus,
};

/// Activate a transfer and suspend it cleanly once `shutdown` resolves.
///
/// Runs [`Downloader::activate`] until the transfer settles. If `shutdown`
/// finishes first, the run is suspended with its checkpoints kept and the
/// settled status is returned instead of [`Error::Cancelled`], so
/// [`Downloader::context`] can be persisted and resumed later.
pub async fn run_until<F>(downloader: &Downloader, shutdown: F) -> Result<TransferStatus>
where
    F: Future<Output = ()>,
{
    let cancel = tokio_util::sync::CancellationToken::new();
    let activation = downloader.activate(cancel.clone());
    tokio::pin!(activation);

    tokio::select! {
        result = &mut activation => result,
        () = shutdown => {
            tracing::info!(transfer_id = %downloader.id(), "Shutdown requested, suspending transfer");
            cancel.cancel();
            match activation.await {
                Err(Error::Cancelled) => Ok(downloader.status()),
                other => other,
            }
        }
    }
}

/// [`run_until`] with a termination signal as the shutdown.
///
/// SIGTERM or SIGINT on Unix, Ctrl+C elsewhere.
///
/// # Example
///
/// ```no_run
/// use segment_dl::{Config, Downloader, run_until_signal};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = Downloader::new("https://example.com/a.bin", "a.bin", Config::default())?;
///
///     let status = run_until_signal(&downloader).await?;
///     println!("transfer {status}");
///
///     Ok(())
/// }
/// ```
pub async fn run_until_signal(downloader: &Downloader) -> Result<TransferStatus> {
    run_until(downloader, termination()).await
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Interrupt handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn termination() {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = terminate => tracing::info!("Received SIGTERM"),
        () = interrupt() => tracing::info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn termination() {
    interrupt().await;
    tracing::info!("Received Ctrl+C");
}
