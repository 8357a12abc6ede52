//! Per-run block engines and result aggregation.
//!
//! A run starts one engine per unfinished block, wraps each in the retry
//! combinator and hands the merged streams to a supervisor task. The
//! supervisor forwards progress, counts completions and turns the first
//! unrecovered error into a fault. Every status write checks the run's
//! generation, so a run that was suspended (or replaced by a newer one) can
//! never overwrite the current status.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, select_all};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::block::{BlockCheckpoint, BlockEvents, BlockStream};
use crate::error::{BlockIoError, BlockTransferError};
use crate::retry::{IsRetryable, retry_block};
use crate::source::{RemoteSource, open_stream_pair};
use crate::speed_limiter::SpeedLimiter;
use crate::types::{BlockTransferContext, Event, TransferContext, TransferStatus};

use super::Shared;

/// Aggregate state of one transfer, guarded by `Shared::state`
pub(crate) struct TransferState {
    pub(crate) context: TransferContext,
    pub(crate) status: TransferStatus,
    /// Incremented each time a run starts
    pub(crate) generation: u64,
    pub(crate) run: Option<ActiveRun>,
    /// Error that faulted the last run
    pub(crate) fault: Option<BlockTransferError>,
}

impl TransferState {
    pub(crate) fn new(context: TransferContext) -> Self {
        Self {
            context,
            status: TransferStatus::Ready,
            generation: 0,
            run: None,
            fault: None,
        }
    }

    /// The context with live checkpoints of the active run applied
    pub(crate) fn snapshot(&self) -> TransferContext {
        let mut context = self.context.clone();
        if let Some(run) = &self.run {
            run.apply_checkpoints(&mut context);
        }
        context
    }

    /// Stop tracking the active run and fold its checkpoints into the context
    pub(crate) fn capture_checkpoints(&mut self) {
        if let Some(run) = self.run.take() {
            run.apply_checkpoints(&mut self.context);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
            && self.status == TransferStatus::Active
            && self.run.is_some()
    }
}

/// Bookkeeping for the run in progress
pub(crate) struct ActiveRun {
    pub(crate) generation: u64,
    pub(crate) scope: RunScope,
    /// One checkpoint per block, indexed like `TransferContext::blocks`
    pub(crate) checkpoints: Vec<BlockCheckpoint>,
}

impl ActiveRun {
    fn apply_checkpoints(&self, context: &mut TransferContext) {
        for (block, checkpoint) in context.blocks.iter_mut().zip(&self.checkpoints) {
            block.completed_bytes = checkpoint.get().min(block.length);
            block.bytes_in_last_chunk = 0;
        }
    }

    /// Cancel every block of the run and wait for the workers to exit
    pub(crate) async fn stop(&self) {
        self.scope.cancel.cancel();
        self.scope.tracker.wait().await;
        tracing::debug!(generation = self.generation, "Run stopped");
    }
}

/// Cancellation scope and worker tracker of one run
#[derive(Clone)]
pub(crate) struct RunScope {
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

/// Everything needed to build an engine for a block of the current run
#[derive(Clone)]
struct EngineBuilder {
    source: Arc<dyn RemoteSource>,
    local_path: PathBuf,
    chunk_size: usize,
    buffer: usize,
    connections: Arc<Semaphore>,
    speed_limiter: SpeedLimiter,
    scope: RunScope,
}

impl EngineBuilder {
    fn build(&self, context: BlockTransferContext, checkpoint: BlockCheckpoint) -> BlockStream {
        let source = self.source.clone();
        let local_path = self.local_path.clone();
        BlockStream::new(context, move |range| open_stream_pair(source, local_path, range))
            .chunk_size(self.chunk_size)
            .buffer(self.buffer)
            .cancel_scope(&self.scope.cancel)
            .tracker(&self.scope.tracker)
            .connections(self.connections.clone())
            .speed_limiter(Some(self.speed_limiter.clone()))
            .checkpoint(checkpoint)
    }

    /// Activate the block with the configured retry policy around it
    fn events(
        &self,
        context: BlockTransferContext,
        checkpoint: BlockCheckpoint,
        policy: crate::config::RetryConfig,
    ) -> BlockEvents {
        let first = self.build(context.clone(), checkpoint.clone()).activate().into_events();
        let builder = self.clone();
        let events = retry_block(
            first,
            policy,
            |e| e.is_retryable(),
            move |context| builder.build(context, checkpoint.clone()),
        );
        require_terminal(events, context, self.scope.cancel.clone())
    }
}

/// Fail a block stream that ends without completing or failing
///
/// Such a stream would otherwise leave the run waiting for a block that is
/// gone. Ending after `cancel` fired is normal and passes through.
pub(super) fn require_terminal(
    events: BlockEvents,
    context: BlockTransferContext,
    cancel: CancellationToken,
) -> BlockEvents {
    stream::unfold(Some((events, context)), move |state| {
        let cancel = cancel.clone();
        async move {
            let (mut events, last) = state?;
            match events.next().await {
                Some(Ok(context)) if context.is_completion_signal() => Some((Ok(context), None)),
                Some(Ok(context)) => Some((Ok(context.clone()), Some((events, context)))),
                Some(Err(err)) => Some((Err(err), None)),
                None if cancel.is_cancelled() => None,
                None => {
                    tracing::warn!(block_id = %last.id, "Block stream ended without a result");
                    let err = BlockTransferError::new(
                        last,
                        BlockIoError::Source("block stream ended without a result".into()),
                    );
                    Some((Err(err), None))
                }
            }
        }
    })
    .boxed()
}

/// Move the transfer to `to`, notifying watchers and subscribers
pub(crate) fn transition(shared: &Shared, state: &mut TransferState, to: TransferStatus) {
    let from = state.status;
    if from == to {
        return;
    }
    state.status = to;
    shared.status_tx.send_replace(to);
    tracing::info!(transfer_id = %shared.id, %from, %to, "Transfer status changed");
    shared.emit_event(Event::StatusChanged {
        id: shared.id,
        from,
        to,
    });
}

/// Announce the current aggregate progress
pub(crate) fn context_changed(shared: &Shared, state: &TransferState) {
    shared.emit_event(Event::ContextChanged {
        id: shared.id,
        total_length: state.context.total_length,
        completed_bytes: state.context.completed_bytes(),
    });
}

/// Start a run over the unfinished blocks of a planned context
///
/// Called with the state lock held. Returns `Some(Completed)` if there was
/// nothing left to copy, `None` if a supervisor was started.
pub(crate) fn start_run(shared: &Arc<Shared>, state: &mut TransferState) -> Option<TransferStatus> {
    state.generation += 1;
    let generation = state.generation;
    state.fault = None;
    transition(shared, state, TransferStatus::Active);

    // An empty block still runs once so its completion is reported
    let pending: Vec<BlockTransferContext> = state
        .context
        .blocks
        .iter()
        .filter(|b| !b.is_complete() || b.length == 0)
        .cloned()
        .collect();

    if pending.is_empty() {
        tracing::info!(transfer_id = %shared.id, "Nothing left to copy");
        context_changed(shared, state);
        transition(shared, state, TransferStatus::Completed);
        return Some(TransferStatus::Completed);
    }

    let scope = RunScope {
        cancel: shared.root.child_token(),
        tracker: TaskTracker::new(),
    };
    let checkpoints: Vec<BlockCheckpoint> = state
        .context
        .blocks
        .iter()
        .map(|b| BlockCheckpoint::new(b.completed_bytes))
        .collect();

    let builder = EngineBuilder {
        source: shared.source.clone(),
        local_path: state.context.local_path.clone(),
        chunk_size: shared.config.chunk_size,
        buffer: shared.config.progress_buffer,
        connections: shared.connections.clone(),
        speed_limiter: shared.speed_limiter.clone(),
        scope: scope.clone(),
    };

    let streams: Vec<BlockEvents> = pending
        .iter()
        .map(|block| {
            let checkpoint = checkpoints[block.id.index()].clone();
            builder.events(block.clone(), checkpoint, shared.config.retry.clone())
        })
        .collect();
    // Retried engines may still be spawned; wait() only needs the tracker closed
    scope.tracker.close();

    tracing::info!(
        transfer_id = %shared.id,
        generation,
        blocks = pending.len(),
        completed_bytes = state.context.completed_bytes(),
        total_length = state.context.total_length,
        "Run started"
    );

    state.run = Some(ActiveRun {
        generation,
        scope: scope.clone(),
        checkpoints,
    });

    shared
        .tasks
        .spawn(supervise(shared.clone(), generation, scope, streams));
    None
}

/// Merge the run's block streams and aggregate their outcome
async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    scope: RunScope,
    streams: Vec<BlockEvents>,
) {
    let mut remaining = streams.len();
    let mut merged = select_all(streams);

    loop {
        let item = tokio::select! {
            biased;
            _ = scope.cancel.cancelled() => {
                tracing::debug!(transfer_id = %shared.id, generation, "Supervisor cancelled");
                return;
            }
            item = merged.next() => item,
        };

        match item {
            Some(Ok(context)) => {
                let completed = context.is_completion_signal();
                let block = context.id;
                shared.progress_tx.send(context).ok();

                if completed {
                    remaining -= 1;
                    let mut state = shared.state.lock().await;
                    if !state.is_current(generation) {
                        return;
                    }
                    tracing::debug!(
                        transfer_id = %shared.id,
                        block_id = %block,
                        remaining,
                        generation,
                        "Block completed"
                    );
                    shared.emit_event(Event::BlockCompleted {
                        id: shared.id,
                        block,
                    });

                    if remaining == 0 {
                        state.capture_checkpoints();
                        context_changed(&shared, &state);
                        transition(&shared, &mut state, TransferStatus::Completed);
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                fault(&shared, generation, &scope, err).await;
                return;
            }
            None => {
                // Every stream ends with a terminal item unless the run was cancelled
                tracing::debug!(transfer_id = %shared.id, generation, remaining, "Block streams ended");
                return;
            }
        }
    }
}

/// Fail fast: stop the siblings of a failed block and fault the transfer
async fn fault(shared: &Shared, generation: u64, scope: &RunScope, err: BlockTransferError) {
    tracing::error!(
        transfer_id = %shared.id,
        block_id = %err.block_id(),
        offset = err.offset(),
        length = err.length(),
        completed_bytes = err.context().completed_bytes,
        error = %err,
        "Block failed, faulting transfer"
    );

    scope.cancel.cancel();
    scope.tracker.wait().await;

    let mut state = shared.state.lock().await;
    if !state.is_current(generation) {
        return;
    }
    state.capture_checkpoints();

    let failed = err.context();
    let completed_bytes = state
        .context
        .block(failed.id)
        .map_or(failed.completed_bytes, |b| b.completed_bytes);
    state.fault = Some(err.clone());
    shared.emit_event(Event::BlockFailed {
        id: shared.id,
        block: failed.id,
        offset: failed.offset,
        length: failed.length,
        completed_bytes,
        error: err.to_string(),
    });
    context_changed(shared, &state);
    transition(shared, &mut state, TransferStatus::Faulted);
}
