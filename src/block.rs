//! Block stream engine
//!
//! A [`BlockStream`] copies one block of the remote resource into the local
//! file in fixed-size chunks and reports progress as a stream of
//! [`BlockTransferContext`] snapshots:
//!
//! - one `Ok` item per chunk written, with `bytes_in_last_chunk` set to the chunk size
//! - one final `Ok` item with `bytes_in_last_chunk == 0` once the block is full
//! - or exactly one `Err` item if anything fails, after which the stream ends
//!
//! Cancellation ends the stream without a terminal item.
//!
//! Construction is two-phase. [`BlockStream::new`] only records the context and
//! a factory for the reader/writer pair; nothing is opened until
//! [`BlockStream::activate`] spawns the worker, and the factory runs inside it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use futures::stream::BoxStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{BlockIoError, BlockTransferError};
use crate::source::StreamPair;
use crate::speed_limiter::SpeedLimiter;
use crate::types::{BlockId, BlockTransferContext, ByteRange};

/// Default size of the copy buffer
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Default capacity of a block's event channel
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// One item of a block's progress stream
pub type BlockEvent = Result<BlockTransferContext, BlockTransferError>;

/// A boxed block progress stream, as consumed by the retry combinators
pub type BlockEvents = BoxStream<'static, BlockEvent>;

type PairFactory =
    Box<dyn FnOnce(ByteRange) -> BoxFuture<'static, Result<StreamPair, BlockIoError>> + Send>;

/// Confirmed written byte count of one block, shared between its engine and observers
///
/// Updated after every chunk write, before the progress event is sent, so it
/// stays accurate even when the event is never delivered (cancelled engine,
/// full channel).
#[derive(Clone, Debug, Default)]
pub struct BlockCheckpoint(Arc<AtomicU64>);

impl BlockCheckpoint {
    /// Create a checkpoint starting at `completed_bytes`
    pub fn new(completed_bytes: u64) -> Self {
        Self(Arc::new(AtomicU64::new(completed_bytes)))
    }

    /// Bytes confirmed written
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, completed_bytes: u64) {
        self.0.store(completed_bytes, Ordering::Release);
    }
}

/// A not-yet-started copy of one block
pub struct BlockStream {
    context: BlockTransferContext,
    factory: PairFactory,
    chunk_size: usize,
    buffer: usize,
    parent: Option<CancellationToken>,
    tracker: Option<TaskTracker>,
    connections: Option<Arc<Semaphore>>,
    limiter: Option<SpeedLimiter>,
    checkpoint: Option<BlockCheckpoint>,
}

impl BlockStream {
    /// Prepare a copy of the unwritten part of `context`
    ///
    /// `factory` receives the remaining range of the block and must return a
    /// reader over exactly that range and a writer positioned at its offset.
    /// It is not called for a block that has nothing left to copy.
    pub fn new<F, Fut>(context: BlockTransferContext, factory: F) -> Self
    where
        F: FnOnce(ByteRange) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StreamPair, BlockIoError>> + Send + 'static,
    {
        Self {
            context,
            factory: Box::new(move |range| Box::pin(factory(range))),
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer: DEFAULT_EVENT_BUFFER,
            parent: None,
            tracker: None,
            connections: None,
            limiter: None,
            checkpoint: None,
        }
    }

    /// Copy buffer size (clamped to at least one byte)
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Capacity of the event channel; a full channel pauses the copy
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Cancel this block whenever `parent` is cancelled
    pub fn cancel_scope(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Spawn the worker on `tracker` instead of a detached task
    pub fn tracker(mut self, tracker: &TaskTracker) -> Self {
        self.tracker = Some(tracker.clone());
        self
    }

    /// Hold a permit from `connections` for the whole copy
    pub fn connections(mut self, connections: Arc<Semaphore>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Throttle every chunk through a shared limiter
    pub fn speed_limiter(mut self, limiter: Option<SpeedLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Publish confirmed progress to `checkpoint`
    pub fn checkpoint(mut self, checkpoint: BlockCheckpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// The context the copy will start from
    pub fn context(&self) -> &BlockTransferContext {
        &self.context
    }

    /// Start the copy
    ///
    /// Must be called from within a tokio runtime. Never fails: every failure,
    /// including one from the factory, arrives as the stream's single `Err`.
    pub fn activate(self) -> BlockSubscription {
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.context.id;

        let worker = BlockWorker {
            context: self.context,
            chunk_size: self.chunk_size,
            connections: self.connections,
            limiter: self.limiter,
            checkpoint: self.checkpoint,
            cancel: cancel.clone(),
            tx,
        };

        let handle = match &self.tracker {
            Some(tracker) => tracker.spawn(worker.run(self.factory)),
            None => tokio::spawn(worker.run(self.factory)),
        };

        BlockSubscription {
            id,
            events: rx,
            cancel,
            worker: Some(handle),
            finished: false,
        }
    }
}

impl std::fmt::Debug for BlockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStream")
            .field("context", &self.context)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Handle to a running block copy and its progress stream
///
/// Dropping the subscription cancels the copy. Use [`dispose`](Self::dispose)
/// to also wait until the worker has released the connection and file handle.
#[derive(Debug)]
pub struct BlockSubscription {
    id: BlockId,
    events: mpsc::Receiver<BlockEvent>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl BlockSubscription {
    /// Id of the block being copied
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Stop the copy; the stream ends without a terminal item
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the copy has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the copy and wait for the worker to exit
    pub async fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            tracing::warn!(block_id = %self.id, error = %e, "Block worker ended abnormally");
        }
    }

    /// Box the subscription for use with the retry combinators
    pub fn into_events(self) -> BlockEvents {
        Box::pin(self)
    }
}

impl Stream for BlockSubscription {
    type Item = BlockEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // Buffered events are discarded once cancelled
        if this.finished || this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }

        match this.events.poll_recv(cx) {
            Poll::Ready(Some(Ok(context))) => {
                if context.is_completion_signal() {
                    this.finished = true;
                }
                Poll::Ready(Some(Ok(context)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a copy ended when it did not fail
enum CopyEnd {
    Completed,
    Cancelled,
}

struct BlockWorker {
    context: BlockTransferContext,
    chunk_size: usize,
    connections: Option<Arc<Semaphore>>,
    limiter: Option<SpeedLimiter>,
    checkpoint: Option<BlockCheckpoint>,
    cancel: CancellationToken,
    tx: mpsc::Sender<BlockEvent>,
}

impl BlockWorker {
    async fn run(mut self, factory: PairFactory) {
        let id = self.context.id;
        tracing::debug!(
            block_id = %id,
            offset = self.context.offset,
            length = self.context.length,
            completed_bytes = self.context.completed_bytes,
            "Block stream activated"
        );

        // A panicking source or reader still ends the stream with its one error
        let outcome = match AssertUnwindSafe(self.copy(factory)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(block_id = %id, "Block worker panicked");
                Err(BlockIoError::Source("block worker panicked".into()))
            }
        };

        match outcome {
            Ok(CopyEnd::Completed) => {
                tracing::debug!(block_id = %id, "Block copy completed");
            }
            Ok(CopyEnd::Cancelled) => {
                tracing::debug!(
                    block_id = %id,
                    completed_bytes = self.context.completed_bytes,
                    "Block copy cancelled"
                );
            }
            Err(e) => {
                tracing::debug!(block_id = %id, error = %e, "Block copy failed");
                let err = BlockTransferError::new(self.context.clone(), e);
                self.emit(Err(err)).await;
            }
        }

        tracing::debug!(block_id = %id, "Block stream disposed");
    }

    async fn copy(&mut self, factory: PairFactory) -> Result<CopyEnd, BlockIoError> {
        let remaining = self.context.remaining();
        if remaining == 0 {
            return Ok(self.complete().await);
        }

        let _permit = match &self.connections {
            Some(connections) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(CopyEnd::Cancelled),
                permit = connections.clone().acquire_owned() => Some(
                    permit.map_err(|_| BlockIoError::Source("connection limiter closed".into()))?,
                ),
            },
            None => None,
        };

        let range = self.context.remaining_range();
        let StreamPair { reader, mut writer } = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CopyEnd::Cancelled),
            pair = factory(range) => pair?,
        };

        // Cap the reader so a server ignoring the range cannot spill into the next block
        let mut reader = reader.take(remaining);
        let mut buf = vec![0u8; self.chunk_size];
        let mut received = 0u64;

        loop {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(CopyEnd::Cancelled),
                n = reader.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(CopyEnd::Cancelled),
                    _ = limiter.acquire(n as u64) => {}
                }
            }
            if self.cancel.is_cancelled() {
                return Ok(CopyEnd::Cancelled);
            }

            // A started chunk write runs to completion so the checkpoint stays exact
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;

            received += n as u64;
            self.context.bytes_in_last_chunk = n as u64;
            self.context.completed_bytes += n as u64;
            if let Some(checkpoint) = &self.checkpoint {
                checkpoint.set(self.context.completed_bytes);
            }

            tracing::trace!(
                block_id = %self.context.id,
                chunk = n,
                completed_bytes = self.context.completed_bytes,
                "Chunk written"
            );

            if !self.emit(Ok(self.context.clone())).await {
                return Ok(CopyEnd::Cancelled);
            }
        }

        if received < remaining {
            return Err(BlockIoError::ShortRead {
                expected: remaining,
                received,
            });
        }

        Ok(self.complete().await)
    }

    async fn complete(&mut self) -> CopyEnd {
        self.context.bytes_in_last_chunk = 0;
        if self.emit(Ok(self.context.clone())).await {
            CopyEnd::Completed
        } else {
            CopyEnd::Cancelled
        }
    }

    /// Send one event unless cancelled; returns false if the copy should stop
    async fn emit(&self, event: BlockEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        };
        if !sent {
            // Receiver gone: nobody is listening, stop copying
            self.cancel.cancel();
        }
        sent
    }
}
