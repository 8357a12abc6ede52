//! Retry logic with exponential backoff
//!
//! Two layers:
//! - [`catch`] / [`retry_block`] - recovery combinators over a block's progress
//!   stream. A failed block is replaced by a fresh engine anchored at its
//!   unwritten remainder, so bytes already on disk are never fetched twice.
//! - [`with_backoff`] - plain async retry for one-shot operations such as
//!   probing the resource size.
//!
//! # Example
//!
//! ```no_run
//! use segment_dl::retry::{IsRetryable, with_backoff};
//! use segment_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = with_backoff(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use rand::Rng;

use crate::block::{BlockEvents, BlockStream};
use crate::config::RetryConfig;
use crate::error::{BlockIoError, BlockTransferError, Error};
use crate::types::BlockTransferContext;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (not found, range refused, disk full) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

fn is_transient_io(e: &std::io::Error) -> bool {
    if let Some(inner) = e.get_ref()
        && let Some(http) = inner.downcast_ref::<reqwest::Error>()
    {
        // Body stream failures arrive wrapped in an io::Error
        return is_transient_http(http);
    }
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
    )
}

fn is_transient_http(e: &reqwest::Error) -> bool {
    if let Some(status) = e.status() {
        return is_transient_status(status.as_u16());
    }
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

fn is_transient_status(status: u16) -> bool {
    // 408 Request Timeout, 429 Too Many Requests, 5xx server side
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl IsRetryable for BlockIoError {
    fn is_retryable(&self) -> bool {
        match self {
            BlockIoError::Http(e) => is_transient_http(e),
            BlockIoError::Io(e) => is_transient_io(e),
            BlockIoError::Status { status } => is_transient_status(*status),
            // The server cannot serve ranges; asking again will not change that
            BlockIoError::RangeNotSatisfied { .. } => false,
            // Connection dropped mid-body
            BlockIoError::ShortRead { .. } => true,
            BlockIoError::Source(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout")
                    || msg.contains("busy")
                    || msg.contains("connection")
                    || msg.contains("temporary")
            }
        }
    }
}

impl IsRetryable for BlockTransferError {
    fn is_retryable(&self) -> bool {
        self.cause().is_retryable()
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => is_transient_http(e),
            Error::Io(e) => is_transient_io(e),
            Error::Block(e) => e.is_retryable(),
            Error::Remote(e) => e.is_retryable(),
            // Planning and lifecycle errors are permanent
            Error::Config { .. }
            | Error::InvalidUrl(_)
            | Error::MissingContentLength(_)
            | Error::InvalidLayout(_)
            | Error::InvalidState { .. }
            | Error::Disposed
            | Error::Cancelled => false,
        }
    }
}

/// Recover a block's progress stream from its error item
///
/// Progress items pass through untouched. On an error item, `handler` either
/// returns a replacement stream, which is drained in place of the failed one,
/// or hands the error back, which is yielded unchanged and ends the stream.
/// The failed stream has already ended when its error arrives, so the result
/// still carries at most one terminal item.
pub fn catch<H>(events: BlockEvents, handler: H) -> BlockEvents
where
    H: FnMut(BlockTransferError) -> Result<BlockEvents, BlockTransferError> + Send + 'static,
{
    struct State<H> {
        current: Option<BlockEvents>,
        handler: H,
    }

    let state = State {
        current: Some(events),
        handler,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            let current = state.current.as_mut()?;
            let item = current.next().await;
            match item {
                Some(Ok(context)) => return Some((Ok(context), state)),
                Some(Err(err)) => match (state.handler)(err) {
                    Ok(replacement) => state.current = Some(replacement),
                    Err(err) => {
                        state.current = None;
                        return Some((Err(err), state));
                    }
                },
                None => return None,
            }
        }
    })
    .boxed()
}

/// Retry a failing block with exponential backoff
///
/// Errors accepted by `is_handled` are retried at most `policy.max_attempts`
/// times. Before each attempt the combinator waits the backoff delay, then
/// calls `rebuild` with the context carried by the error and activates the
/// returned engine. The context's `completed_bytes` anchors the new copy at
/// the unwritten remainder. Anything else, including the error that exhausts
/// the budget, is propagated unchanged.
pub fn retry_block<P, R>(
    events: BlockEvents,
    policy: RetryConfig,
    is_handled: P,
    mut rebuild: R,
) -> BlockEvents
where
    P: Fn(&BlockTransferError) -> bool + Send + 'static,
    R: FnMut(BlockTransferContext) -> BlockStream + Send + 'static,
{
    let mut attempt = 0u32;

    catch(events, move |err| {
        if !is_handled(&err) {
            tracing::debug!(block_id = %err.block_id(), error = %err, "Block error not retryable");
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            tracing::error!(
                block_id = %err.block_id(),
                error = %err,
                attempts = attempt + 1,
                "Block failed after all retry attempts exhausted"
            );
            return Err(err);
        }

        attempt += 1;
        let delay = backoff_delay(&policy, attempt);
        tracing::warn!(
            block_id = %err.block_id(),
            error = %err,
            attempt,
            max_attempts = policy.max_attempts,
            resume_offset = err.retry_range().offset,
            delay_ms = delay.as_millis() as u64,
            "Block failed, retrying"
        );

        // Built now, activated after the delay; construction opens nothing
        let engine = rebuild(err.context().clone());
        let replacement = stream::once(async move {
            tokio::time::sleep(delay).await;
            engine.activate().into_events()
        })
        .flatten();
        Ok(replacement.boxed())
    })
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let delay = backoff_delay(config, attempt);

                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based)
///
/// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`,
/// then jittered if enabled.
///
/// Total for any policy: a negative result waits zero, a non-finite or
/// overflowing one waits `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let capped = if secs.is_nan() {
        config.max_delay
    } else {
        Duration::try_from_secs_f64(secs.max(0.0))
            .map_or(config.max_delay, |delay| delay.min(config.max_delay))
    };

    if config.jitter {
        add_jitter(capped)
    } else {
        capped
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor)).unwrap_or(delay)
}
