//! Transfer lifecycle control: activate, suspend and layout planning.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::layout;
use crate::retry::with_backoff;
use crate::source::prepare_destination;
use crate::types::TransferStatus;

use super::Downloader;
use super::supervisor::{self, context_changed, transition};

/// What an activation request does in a given state
enum Admission {
    /// Start a new run
    Start,
    /// A run is already in progress; wait for it
    Join,
    /// Nothing to run; return this status
    Done(TransferStatus),
}

fn admit(status: TransferStatus) -> Result<Admission> {
    match status {
        TransferStatus::Disposed => Err(Error::Disposed),
        TransferStatus::Completed => Ok(Admission::Done(TransferStatus::Completed)),
        TransferStatus::Active => Ok(Admission::Join),
        TransferStatus::Ready | TransferStatus::Suspended | TransferStatus::Faulted => {
            Ok(Admission::Start)
        }
    }
}

fn invalid_state(operation: &str, status: TransferStatus) -> Error {
    Error::InvalidState {
        operation: operation.to_string(),
        current_state: status.to_string(),
    }
}

impl Downloader {
    /// Start (or resume) the transfer and wait until the run settles
    ///
    /// From `Ready` the layout is planned first: the remote size is probed
    /// (with the configured retry policy) and split into blocks. The
    /// destination file is created if missing and extended to the full size,
    /// never truncated. Then one engine per unfinished block is started; blocks
    /// resumed from `Suspended` or `Faulted` continue at their confirmed offset.
    ///
    /// Calling `activate` while a run is in progress starts nothing and waits
    /// for that run instead.
    ///
    /// # Returns
    ///
    /// - `Ok(Completed)` when every block finished (immediately if already complete)
    /// - `Ok(Suspended)` when the run was suspended while waiting
    /// - `Err(Error::Block(_))` when a block failed and faulted the transfer
    /// - `Err(Error::Cancelled)` when `cancel` fired; the transfer is suspended
    /// - `Err(Error::Disposed)` after [`dispose`](Self::dispose)
    ///
    /// Planning failures (remote unreachable, no content length) are returned
    /// as is and leave the transfer in `Ready`, so activation can be retried.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use segment_dl::*;
    /// # use tokio_util::sync::CancellationToken;
    /// # async fn example(downloader: Downloader) -> Result<()> {
    /// let cancel = CancellationToken::new();
    /// match downloader.activate(cancel.clone()).await {
    ///     Ok(TransferStatus::Completed) => println!("done"),
    ///     Ok(status) => println!("stopped: {status}"),
    ///     Err(Error::Block(e)) => println!("block {} failed at {}", e.block_id(), e.retry_range().offset),
    ///     Err(e) => return Err(e),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn activate(&self, cancel: CancellationToken) -> Result<TransferStatus> {
        let mut status_rx = self.shared.status_tx.subscribe();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(transfer_id = %self.shared.id, "Activation cancelled by caller");
                self.suspend().await?;
                Err(Error::Cancelled)
            }
            result = self.start_and_wait(&mut status_rx) => result,
        }
    }

    async fn start_and_wait(
        &self,
        status_rx: &mut watch::Receiver<TransferStatus>,
    ) -> Result<TransferStatus> {
        if let Some(status) = self.start().await? {
            return Ok(status);
        }
        self.wait_for_settled(status_rx).await
    }

    /// Start a run unless one is running; `Some` if there is nothing to wait for
    async fn start(&self) -> Result<Option<TransferStatus>> {
        let planned = {
            let state = self.shared.state.lock().await;
            match admit(state.status)? {
                Admission::Start => {}
                Admission::Join => return Ok(None),
                Admission::Done(status) => return Ok(Some(status)),
            }
            state.context.is_planned()
        };

        if !planned {
            self.plan().await?;
        }

        let (path, total_length) = {
            let state = self.shared.state.lock().await;
            (state.context.local_path.clone(), state.context.total_length)
        };
        prepare_destination(&path, total_length).await?;

        // Re-check: another activation may have started the run meanwhile
        let mut state = self.shared.state.lock().await;
        match admit(state.status)? {
            Admission::Start => Ok(supervisor::start_run(&self.shared, &mut state)),
            Admission::Join => Ok(None),
            Admission::Done(status) => Ok(Some(status)),
        }
    }

    /// Probe the remote size and install a block layout
    async fn plan(&self) -> Result<()> {
        let _plan = self.shared.plan_lock.lock().await;
        if self.shared.state.lock().await.context.is_planned() {
            return Ok(());
        }

        let source = &self.shared.source;
        let config = &self.shared.config;
        tracing::debug!(transfer_id = %self.shared.id, remote = %source.location(), "Probing content length");

        let total_length = with_backoff(&config.retry, || source.content_length())
            .await?
            .ok_or_else(|| Error::MissingContentLength(source.location().to_string()))?;
        let blocks = layout::plan(total_length, config.block_count, config.min_block_size);

        let mut state = self.shared.state.lock().await;
        if state.status == TransferStatus::Disposed {
            return Err(Error::Disposed);
        }
        state.context.set_layout(total_length, &blocks);
        state.context.validate()?;

        tracing::info!(
            transfer_id = %self.shared.id,
            total_length,
            blocks = blocks.len(),
            "Transfer planned"
        );
        context_changed(&self.shared, &state);
        Ok(())
    }

    async fn wait_for_settled(
        &self,
        status_rx: &mut watch::Receiver<TransferStatus>,
    ) -> Result<TransferStatus> {
        let status = *status_rx
            .wait_for(TransferStatus::is_settled)
            .await
            .map_err(|_| Error::Disposed)?;

        match status {
            TransferStatus::Completed | TransferStatus::Suspended => Ok(status),
            TransferStatus::Disposed => Err(Error::Disposed),
            TransferStatus::Faulted => match &self.shared.state.lock().await.fault {
                Some(err) => Err(Error::Block(err.clone())),
                None => Err(invalid_state("activate", status)),
            },
            TransferStatus::Ready | TransferStatus::Active => Err(invalid_state("activate", status)),
        }
    }

    /// Suspend the transfer
    ///
    /// Cancels every running block, waits until their workers have exited and
    /// records each block's confirmed offset. A later [`activate`](Self::activate)
    /// continues from there without fetching any written byte again.
    ///
    /// Does nothing unless the transfer is `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose).
    pub async fn suspend(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            TransferStatus::Disposed => return Err(Error::Disposed),
            TransferStatus::Active => {}
            status => {
                tracing::debug!(transfer_id = %self.shared.id, %status, "Nothing to suspend");
                return Ok(());
            }
        }

        if let Some(run) = &state.run {
            run.stop().await;
        }
        state.capture_checkpoints();
        context_changed(&self.shared, &state);
        transition(&self.shared, &mut state, TransferStatus::Suspended);
        Ok(())
    }
}
