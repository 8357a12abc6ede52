//! Transfer orchestrator split into focused submodules.
//!
//! The `Downloader` struct and its methods are organized by concern:
//! - [`config_ops`] - runtime bandwidth limit
//! - [`control`] - activation, suspension and layout planning
//! - [`lifecycle`] - disposal
//! - [`supervisor`] - per-run block engines and result aggregation

mod config_ops;
mod control;
mod lifecycle;
mod supervisor;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use url::Url;

use crate::config::Config;
use crate::error::Result;
use crate::source::{HttpSource, RemoteSource};
use crate::speed_limiter::SpeedLimiter;
use crate::types::{BlockTransferContext, Event, TransferContext, TransferId, TransferStatus};

use supervisor::TransferState;

/// State shared by every handle of one transfer and its background tasks
pub(crate) struct Shared {
    /// Transfer id, fixed for the downloader's lifetime
    pub(crate) id: TransferId,
    /// Validated configuration
    pub(crate) config: Arc<Config>,
    /// Where the bytes come from
    pub(crate) source: Arc<dyn RemoteSource>,
    /// Lifecycle and aggregation events
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Per-chunk progress merged from all blocks
    pub(crate) progress_tx: broadcast::Sender<BlockTransferContext>,
    /// Current status, for synchronous reads and waiters
    pub(crate) status_tx: watch::Sender<TransferStatus>,
    /// Aggregate state; every status change happens under this lock
    pub(crate) state: Mutex<TransferState>,
    /// Serializes layout planning between concurrent activations
    pub(crate) plan_lock: Mutex<()>,
    /// Caps the number of blocks copying at once
    pub(crate) connections: Arc<Semaphore>,
    /// Bandwidth limit shared by all blocks
    pub(crate) speed_limiter: SpeedLimiter,
    /// Supervisor tasks, joined on dispose
    pub(crate) tasks: TaskTracker,
    /// Parent of every run scope; cancelled on dispose or when the last handle drops
    pub(crate) root: CancellationToken,
}

impl Shared {
    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// Segmented, resumable download of one remote resource into one local file
///
/// Cloneable; all clones drive the same transfer. Dropping the last clone
/// cancels every running block, use [`dispose`](Self::dispose) to also wait
/// until they have released their connections and file handles.
#[derive(Clone)]
pub struct Downloader {
    pub(crate) shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl Downloader {
    /// Create a downloader fetching `remote` over HTTP into `local_path`
    ///
    /// Nothing is requested until [`activate`](Self::activate).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use segment_dl::{Config, Downloader};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let downloader = Downloader::new(
    ///         "https://example.com/big.iso",
    ///         "downloads/big.iso",
    ///         Config::default(),
    ///     )?;
    ///
    ///     let status = downloader.activate(CancellationToken::new()).await?;
    ///     println!("finished: {status}");
    ///     Ok(())
    /// }
    /// ```
    pub fn new(remote: &str, local_path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let url = Url::parse(remote)?;
        config.validate()?;
        let source = HttpSource::new(url, &config.http)?;
        Self::with_source(Arc::new(source), local_path, config)
    }

    /// Create a downloader reading from any [`RemoteSource`]
    pub fn with_source(
        source: Arc<dyn RemoteSource>,
        local_path: impl Into<PathBuf>,
        config: Config,
    ) -> Result<Self> {
        let context = TransferContext::new(source.location().clone(), local_path);
        Self::from_context(context, source, config)
    }

    /// Adopt a previously captured transfer context
    ///
    /// Used to resume a transfer after a restart: blocks keep their confirmed
    /// byte counts and only the unwritten remainder is fetched. The downloader
    /// starts in [`TransferStatus::Ready`].
    pub fn from_context(
        context: TransferContext,
        source: Arc<dyn RemoteSource>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        if context.is_planned() {
            context.validate()?;
        }

        let (event_tx, _rx) = broadcast::channel(config.event_buffer);
        let (progress_tx, _rx) = broadcast::channel(config.event_buffer);
        let (status_tx, _rx) = watch::channel(TransferStatus::Ready);
        let root = CancellationToken::new();

        let shared = Shared {
            id: context.id,
            connections: Arc::new(Semaphore::new(config.max_concurrent_blocks)),
            speed_limiter: SpeedLimiter::with_limit(config.speed_limit_bps),
            config: Arc::new(config),
            source,
            event_tx,
            progress_tx,
            status_tx,
            state: Mutex::new(TransferState::new(context)),
            plan_lock: Mutex::new(()),
            tasks: TaskTracker::new(),
            root: root.clone(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            _guard: Arc::new(root.drop_guard()),
        })
    }

    /// Transfer id
    pub fn id(&self) -> TransferId {
        self.shared.id
    }

    /// Get the configuration this downloader was built with
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.shared.config)
    }

    /// Current status
    pub fn status(&self) -> TransferStatus {
        *self.shared.status_tx.borrow()
    }

    /// Watch status changes
    ///
    /// Intermediate values may be skipped; use [`subscribe`](Self::subscribe)
    /// to see every transition.
    pub fn watch_status(&self) -> watch::Receiver<TransferStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Snapshot of the transfer context, including live block progress
    pub async fn context(&self) -> TransferContext {
        self.shared.state.lock().await.snapshot()
    }

    /// Subscribe to lifecycle events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls behind by more than `event_buffer` events receives
    /// `RecvError::Lagged` and continues with the newest ones; the transfer never
    /// waits for a subscriber.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use segment_dl::{Config, Downloader, Event};
    ///
    /// # fn example(downloader: Downloader) {
    /// let mut events = downloader.subscribe();
    /// tokio::spawn(async move {
    ///     while let Ok(event) = events.recv().await {
    ///         if let Event::StatusChanged { to, .. } = event {
    ///             println!("status: {to}");
    ///         }
    ///     }
    /// });
    /// # }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.event_tx.subscribe()
    }

    /// Subscribe to per-chunk progress of all blocks
    ///
    /// Snapshots arrive in the order the supervisor receives them; the order of
    /// one block's snapshots is preserved.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<BlockTransferContext> {
        self.shared.progress_tx.subscribe()
    }

    /// Per-chunk progress as a [`Stream`], skipping over lag
    pub fn progress_stream(&self) -> impl Stream<Item = BlockTransferContext> + Send + 'static {
        let id = self.shared.id;
        BroadcastStream::new(self.subscribe_progress()).filter_map(move |item| match item {
            Ok(context) => Some(context),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!(transfer_id = %id, skipped, "Progress subscriber lagged");
                None
            }
        })
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("id", &self.shared.id)
            .field("remote", &self.shared.source.location().as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
