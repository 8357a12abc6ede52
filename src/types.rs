//! Core types for segment-dl
//!
//! The data model of one transfer: identifiers, byte ranges, the per-block
//! progress context, the transfer context that owns them, the lifecycle
//! status and the events published to collaborators.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use url::Url;

/// Unique identifier for a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

impl TransferId {
    /// Create a TransferId from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique TransferId
    pub fn next() -> Self {
        Self(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a block, unique within its transfer
///
/// Blocks are numbered by their position in the layout, starting at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Position of the block in its transfer's layout
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous byte range `[offset, offset + length)` of the remote resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte of the range
    pub offset: u64,
    /// Number of bytes in the range
    pub length: u64,
}

impl ByteRange {
    /// Create a new range
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end of the range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Whether the range covers no bytes
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Value for an HTTP `Range` header (`bytes=first-last`, inclusive)
    ///
    /// Returns `None` for an empty range, which has no HTTP representation.
    pub fn to_header_value(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        Some(format!("bytes={}-{}", self.offset, self.end() - 1))
    }
}

/// Immutable definition of one block of a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Byte offset of the block within the resource
    pub offset: u64,
    /// Number of bytes in the block
    pub length: u64,
}

impl BlockDescriptor {
    /// Create a new descriptor
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// The byte range covered by this block
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.length)
    }
}

/// Progress state of one block
///
/// A snapshot of this struct is carried by every progress event. Only the
/// block's own engine mutates the live copy; everybody else sees clones.
///
/// `bytes_in_last_chunk` is a delta, not a running total: it holds the size of
/// the chunk that was just written. The engine's final event resets it to 0,
/// so a zero after a non-empty transfer means "block done". `completed_bytes`
/// is the running total of bytes confirmed written and is what resumes anchor on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransferContext {
    /// Block id, stable for the block's lifetime
    pub id: BlockId,
    /// Owning transfer
    pub transfer: TransferId,
    /// Byte offset of the block within the resource
    pub offset: u64,
    /// Number of bytes in the block
    pub length: u64,
    /// Size of the most recently copied chunk (0 on completion)
    pub bytes_in_last_chunk: u64,
    /// Bytes of this block confirmed written to the destination
    pub completed_bytes: u64,
}

impl BlockTransferContext {
    /// Create a fresh context for a block with nothing written yet
    pub fn new(transfer: TransferId, id: BlockId, offset: u64, length: u64) -> Self {
        Self {
            id,
            transfer,
            offset,
            length,
            bytes_in_last_chunk: 0,
            completed_bytes: 0,
        }
    }

    /// Create a context from a planned descriptor
    pub fn from_descriptor(transfer: TransferId, id: BlockId, descriptor: BlockDescriptor) -> Self {
        Self::new(transfer, id, descriptor.offset, descriptor.length)
    }

    /// The descriptor this context was created from
    pub fn descriptor(&self) -> BlockDescriptor {
        BlockDescriptor::new(self.offset, self.length)
    }

    /// Bytes still to be fetched
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.completed_bytes)
    }

    /// The unwritten tail of the block, where a (re)started copy begins
    pub fn remaining_range(&self) -> ByteRange {
        ByteRange::new(
            self.offset + self.completed_bytes.min(self.length),
            self.remaining(),
        )
    }

    /// Whether every byte of the block is confirmed written
    pub fn is_complete(&self) -> bool {
        self.completed_bytes >= self.length
    }

    /// Whether this snapshot is the engine's completion signal
    pub fn is_completion_signal(&self) -> bool {
        self.bytes_in_last_chunk == 0 && self.is_complete()
    }
}

impl std::fmt::Display for BlockTransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {} ({}+{})", self.id, self.offset, self.length)
    }
}

/// Aggregate description of one transfer
///
/// Serializable so a collaborator can persist it between process runs and hand
/// it back to [`Downloader::from_context`](crate::Downloader::from_context);
/// the storage format is up to them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferContext {
    /// Transfer id
    pub id: TransferId,
    /// Remote resource
    pub remote_location: Url,
    /// Local destination file
    pub local_path: PathBuf,
    /// Size of the resource in bytes
    pub total_length: u64,
    /// Block layout in offset order (empty until planned)
    pub blocks: Vec<BlockTransferContext>,
}

impl TransferContext {
    /// Create an unplanned transfer context
    pub fn new(remote_location: Url, local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: TransferId::next(),
            remote_location,
            local_path: local_path.into(),
            total_length: 0,
            blocks: Vec::new(),
        }
    }

    /// Whether a block layout has been planned
    pub fn is_planned(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Install a planned layout, replacing any previous one
    pub fn set_layout(&mut self, total_length: u64, descriptors: &[BlockDescriptor]) {
        self.total_length = total_length;
        self.blocks = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| BlockTransferContext::from_descriptor(self.id, BlockId(i as u32), *d))
            .collect();
    }

    /// Bytes confirmed written across all blocks
    pub fn completed_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.completed_bytes.min(b.length)).sum()
    }

    /// Whether every block is complete
    pub fn is_complete(&self) -> bool {
        self.is_planned() && self.blocks.iter().all(BlockTransferContext::is_complete)
    }

    /// Blocks that still have bytes to fetch
    pub fn incomplete_blocks(&self) -> impl Iterator<Item = &BlockTransferContext> + '_ {
        self.blocks.iter().filter(|b| !b.is_complete())
    }

    /// Look up a block by id
    pub fn block(&self, id: BlockId) -> Option<&BlockTransferContext> {
        self.blocks.get(id.index()).filter(|b| b.id == id)
    }

    /// Check the layout invariant: blocks are numbered in order, contiguous,
    /// non-overlapping, and exactly cover `[0, total_length)`.
    pub fn validate(&self) -> crate::error::Result<()> {
        let descriptors: Vec<_> = self.blocks.iter().map(|b| b.descriptor()).collect();
        crate::layout::validate(self.total_length, &descriptors)?;

        for (i, block) in self.blocks.iter().enumerate() {
            if block.id != BlockId(i as u32) {
                return Err(crate::error::Error::InvalidLayout(format!(
                    "block at position {i} has id {}",
                    block.id
                )));
            }
            if block.transfer != self.id {
                return Err(crate::error::Error::InvalidLayout(format!(
                    "block {} belongs to transfer {}, not {}",
                    block.id, block.transfer, self.id
                )));
            }
            if block.completed_bytes > block.length {
                return Err(crate::error::Error::InvalidLayout(format!(
                    "block {} reports {} of {} bytes written",
                    block.id, block.completed_bytes, block.length
                )));
            }
        }
        Ok(())
    }
}

/// Transfer lifecycle state
///
/// ```text
/// Ready -> Active -> Completed | Faulted | Suspended
/// Suspended -> Active
/// Faulted -> Active            (explicit re-activation only)
/// any state -> Disposed        (absorbing)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Created, not started
    Ready,
    /// Blocks are being copied
    Active,
    /// Paused by the caller, resumable
    Suspended,
    /// Every block finished
    Completed,
    /// A block failed and was not recovered
    Faulted,
    /// Released, no further transitions
    Disposed,
}

impl TransferStatus {
    /// Whether the status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Disposed)
    }

    /// Whether a run in this state has finished (successfully or not)
    pub fn is_settled(&self) -> bool {
        !matches!(self, TransferStatus::Ready | TransferStatus::Active)
    }

    /// Whether `activate` may start engines from this state
    pub fn can_activate(&self) -> bool {
        matches!(
            self,
            TransferStatus::Ready | TransferStatus::Suspended | TransferStatus::Faulted
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Ready => "ready",
            TransferStatus::Active => "active",
            TransferStatus::Suspended => "suspended",
            TransferStatus::Completed => "completed",
            TransferStatus::Faulted => "faulted",
            TransferStatus::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Event emitted by the downloader
///
/// Subscribe with [`Downloader::subscribe`](crate::Downloader::subscribe).
/// Per-chunk progress is published on a separate feed
/// ([`Downloader::subscribe_progress`](crate::Downloader::subscribe_progress)).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The transfer moved to a new status
    StatusChanged {
        /// Transfer id
        id: TransferId,
        /// Status before the transition
        from: TransferStatus,
        /// Status after the transition
        to: TransferStatus,
    },

    /// The transfer context changed (layout planned, checkpoints captured)
    ContextChanged {
        /// Transfer id
        id: TransferId,
        /// Total size of the resource
        total_length: u64,
        /// Bytes confirmed written across all blocks
        completed_bytes: u64,
    },

    /// One block finished
    BlockCompleted {
        /// Transfer id
        id: TransferId,
        /// Completed block
        block: BlockId,
    },

    /// A block failed and faulted the transfer
    BlockFailed {
        /// Transfer id
        id: TransferId,
        /// Failed block
        block: BlockId,
        /// Offset of the failed block
        offset: u64,
        /// Length of the failed block
        length: u64,
        /// Bytes of the block already on disk
        completed_bytes: u64,
        /// Error message
        error: String,
    },

    /// The bandwidth limit was changed at runtime
    SpeedLimitChanged {
        /// Transfer id
        id: TransferId,
        /// New limit in bytes per second (None = unlimited)
        limit_bps: Option<u64>,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn planned(total: u64, descriptors: &[BlockDescriptor]) -> TransferContext {
        let mut ctx = TransferContext::new(
            Url::parse("http://example.com/file.bin").unwrap(),
            "/tmp/file.bin",
        );
        ctx.set_layout(total, descriptors);
        ctx
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(
            ByteRange::new(262_144, 131_072).to_header_value().as_deref(),
            Some("bytes=262144-393215")
        );
        assert_eq!(ByteRange::new(0, 1).to_header_value().as_deref(), Some("bytes=0-0"));
        assert_eq!(ByteRange::new(10, 0).to_header_value(), None);
    }

    #[test]
    fn remaining_range_starts_after_confirmed_bytes() {
        let mut block = BlockTransferContext::new(TransferId::new(1), BlockId(2), 1000, 500);
        block.completed_bytes = 200;

        assert_eq!(block.remaining(), 300);
        assert_eq!(block.remaining_range(), ByteRange::new(1200, 300));
        assert!(!block.is_complete());

        block.completed_bytes = 500;
        assert!(block.is_complete());
        assert!(block.remaining_range().is_empty());
    }

    #[test]
    fn completion_signal_requires_zero_delta_and_full_block() {
        let mut block = BlockTransferContext::new(TransferId::new(1), BlockId(0), 0, 10);
        assert!(!block.is_completion_signal(), "fresh block is not done");

        block.completed_bytes = 10;
        block.bytes_in_last_chunk = 10;
        assert!(!block.is_completion_signal(), "last data chunk is not the signal");

        block.bytes_in_last_chunk = 0;
        assert!(block.is_completion_signal());
    }

    #[test]
    fn set_layout_numbers_blocks_in_order() {
        let ctx = planned(
            30,
            &[
                BlockDescriptor::new(0, 10),
                BlockDescriptor::new(10, 10),
                BlockDescriptor::new(20, 10),
            ],
        );

        let ids: Vec<_> = ctx.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![BlockId(0), BlockId(1), BlockId(2)]);
        assert!(ctx.blocks.iter().all(|b| b.transfer == ctx.id));
        ctx.validate().unwrap();
    }

    #[test]
    fn validate_rejects_overcounted_block() {
        let mut ctx = planned(10, &[BlockDescriptor::new(0, 10)]);
        ctx.blocks[0].completed_bytes = 11;

        assert!(matches!(
            ctx.validate(),
            Err(crate::error::Error::InvalidLayout(_))
        ));
    }

    #[test]
    fn completed_bytes_and_incomplete_blocks() {
        let mut ctx = planned(20, &[BlockDescriptor::new(0, 10), BlockDescriptor::new(10, 10)]);
        ctx.blocks[0].completed_bytes = 10;
        ctx.blocks[1].completed_bytes = 4;

        assert_eq!(ctx.completed_bytes(), 14);
        let incomplete: Vec<_> = ctx.incomplete_blocks().map(|b| b.id).collect();
        assert_eq!(incomplete, vec![BlockId(1)]);
        assert!(!ctx.is_complete());
    }

    #[test]
    fn unplanned_context_is_not_complete() {
        let ctx = planned(0, &[]);
        assert!(!ctx.is_complete());
        assert!(!ctx.is_planned());
    }

    #[test]
    fn status_transition_helpers() {
        assert!(TransferStatus::Ready.can_activate());
        assert!(TransferStatus::Suspended.can_activate());
        assert!(TransferStatus::Faulted.can_activate());
        assert!(!TransferStatus::Active.can_activate());
        assert!(!TransferStatus::Completed.can_activate());
        assert!(!TransferStatus::Disposed.can_activate());

        assert!(TransferStatus::Disposed.is_terminal());
        assert!(!TransferStatus::Completed.is_terminal());
        assert!(!TransferStatus::Active.is_settled());
        assert!(TransferStatus::Suspended.is_settled());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::StatusChanged {
            id: TransferId::new(7),
            from: TransferStatus::Active,
            to: TransferStatus::Faulted,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["id"], 7);
        assert_eq!(json["to"], "faulted");
    }

    #[test]
    fn transfer_context_round_trips_for_persistence() {
        let mut ctx = planned(20, &[BlockDescriptor::new(0, 10), BlockDescriptor::new(10, 10)]);
        ctx.blocks[1].completed_bytes = 3;

        let json = serde_json::to_string(&ctx).unwrap();
        let restored: TransferContext = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, ctx);
    }
}
