//! Shared test helpers: an in-memory remote with fault injection.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};
use url::Url;

use crate::config::{Config, RetryConfig};
use crate::downloader::Downloader;
use crate::error::BlockIoError;
use crate::source::{RemoteReader, RemoteSource};
use crate::types::ByteRange;

pub(crate) const KIB: u64 = 1024;
pub(crate) const MIB: u64 = 1024 * KIB;

#[derive(Clone, Debug)]
enum FaultKind {
    /// Opening the range fails with a retryable 503
    FailOnOpen,
    /// Opening the range fails as if ranges were unsupported
    RejectRange,
    /// The body breaks with a connection reset after this many bytes
    FailAfter(u64),
    /// The body stops producing data after this many bytes
    StallAfter(u64),
    /// The body waits for the gate after this many bytes, then breaks
    FailAfterGate(u64, Gate),
    /// Opening the range panics
    PanicOnOpen,
}

/// A latch that holds a reader until the test opens it
#[derive(Clone, Debug, Default)]
pub(crate) struct Gate(Arc<Mutex<GateState>>);

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    wakers: Vec<Waker>,
}

impl Gate {
    pub(crate) fn open(&self) {
        let mut state = self.0.lock().unwrap();
        state.open = true;
        for waker in state.wakers.drain(..) {
            waker.wake();
        }
    }

    fn poll_open(&self, cx: &mut Context<'_>) -> bool {
        let mut state = self.0.lock().unwrap();
        if !state.open {
            state.wakers.push(cx.waker().clone());
        }
        state.open
    }
}

#[derive(Debug)]
struct Fault {
    offset: u64,
    kind: FaultKind,
    remaining_hits: usize,
}

#[derive(Debug, Default)]
struct SourceState {
    faults: Vec<Fault>,
    opened: Vec<ByteRange>,
}

/// [`RemoteSource`] serving a byte vector, with per-range fault injection
///
/// Faults are keyed by the offset of the requested range and consumed each
/// time they fire.
#[derive(Debug)]
pub(crate) struct MemorySource {
    url: Url,
    data: Arc<Vec<u8>>,
    report_length: bool,
    state: Mutex<SourceState>,
}

impl MemorySource {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            url: Url::parse("memory://test/resource.bin").unwrap(),
            data: Arc::new(data),
            report_length: true,
            state: Mutex::new(SourceState::default()),
        }
    }

    /// A source of `len` bytes with a recognizable, non-repeating-per-block pattern
    pub(crate) fn patterned(len: u64) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    /// A source that does not report its size
    pub(crate) fn without_length(mut self) -> Self {
        self.report_length = false;
        self
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn fail_on_open(&self, offset: u64, times: usize) {
        self.add_fault(offset, FaultKind::FailOnOpen, times);
    }

    pub(crate) fn reject_range(&self, offset: u64) {
        self.add_fault(offset, FaultKind::RejectRange, usize::MAX);
    }

    pub(crate) fn fail_after(&self, offset: u64, bytes: u64, times: usize) {
        self.add_fault(offset, FaultKind::FailAfter(bytes), times);
    }

    pub(crate) fn stall_after(&self, offset: u64, bytes: u64, times: usize) {
        self.add_fault(offset, FaultKind::StallAfter(bytes), times);
    }

    /// Break the range at `offset` after `bytes`, but only once the returned gate opens
    pub(crate) fn fail_after_gate(&self, offset: u64, bytes: u64) -> Gate {
        let gate = Gate::default();
        self.add_fault(offset, FaultKind::FailAfterGate(bytes, gate.clone()), 1);
        gate
    }

    pub(crate) fn panic_on_open(&self, offset: u64) {
        self.add_fault(offset, FaultKind::PanicOnOpen, usize::MAX);
    }

    fn add_fault(&self, offset: u64, kind: FaultKind, times: usize) {
        self.state.lock().unwrap().faults.push(Fault {
            offset,
            kind,
            remaining_hits: times,
        });
    }

    /// Ranges requested so far, in request order
    pub(crate) fn opened_ranges(&self) -> Vec<ByteRange> {
        self.state.lock().unwrap().opened.clone()
    }

    /// Total bytes requested across all ranges
    pub(crate) fn requested_bytes(&self) -> u64 {
        self.opened_ranges().iter().map(|r| r.length).sum()
    }

    fn take_fault(&self, offset: u64) -> Option<FaultKind> {
        let mut state = self.state.lock().unwrap();
        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.offset == offset && f.remaining_hits > 0)?;
        fault.remaining_hits -= 1;
        Some(fault.kind.clone())
    }
}

#[async_trait::async_trait]
impl RemoteSource for MemorySource {
    fn location(&self) -> &Url {
        &self.url
    }

    async fn content_length(&self) -> Result<Option<u64>, BlockIoError> {
        Ok(self.report_length.then_some(self.data.len() as u64))
    }

    async fn open_range(&self, range: ByteRange) -> Result<RemoteReader, BlockIoError> {
        self.state.lock().unwrap().opened.push(range);

        let end = range.end().min(self.data.len() as u64);
        let mut reader = MemoryReader {
            data: self.data.clone(),
            pos: range.offset,
            end,
            fail_at: None,
            stall_at: None,
            hold: None,
        };

        match self.take_fault(range.offset) {
            Some(FaultKind::FailOnOpen) => return Err(BlockIoError::Status { status: 503 }),
            Some(FaultKind::RejectRange) => {
                return Err(BlockIoError::RangeNotSatisfied { status: 416 });
            }
            Some(FaultKind::FailAfter(bytes)) => reader.fail_at = Some(range.offset + bytes),
            Some(FaultKind::StallAfter(bytes)) => reader.stall_at = Some(range.offset + bytes),
            Some(FaultKind::FailAfterGate(bytes, gate)) => {
                reader.fail_at = Some(range.offset + bytes);
                reader.hold = Some((range.offset + bytes, gate));
            }
            Some(FaultKind::PanicOnOpen) => panic!("injected panic opening {range:?}"),
            None => {}
        }
        Ok(Box::new(reader))
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    pos: u64,
    end: u64,
    fail_at: Option<u64>,
    stall_at: Option<u64>,
    hold: Option<(u64, Gate)>,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some((at, gate)) = &self.hold
            && *at == self.pos
            && !gate.poll_open(cx)
        {
            return Poll::Pending;
        }
        if self.fail_at == Some(self.pos) {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected connection reset",
            )));
        }
        if self.stall_at == Some(self.pos) {
            // Never woken; the engine leaves through its cancellation branch
            return Poll::Pending;
        }

        let mut limit = self.end;
        for stop in [self.fail_at, self.stall_at].into_iter().flatten() {
            if stop > self.pos {
                limit = limit.min(stop);
            }
        }

        let n = (limit.saturating_sub(self.pos) as usize).min(buf.remaining());
        let start = self.pos as usize;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Config with small blocks and fast, jitter-free retries
pub(crate) fn test_config() -> Config {
    Config {
        chunk_size: 32 * KIB as usize,
        block_count: 8,
        min_block_size: 64 * KIB,
        retry: RetryConfig {
            max_attempts: 0,
            initial_delay: std::time::Duration::from_millis(10),
            max_delay: std::time::Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..Config::default()
    }
}

/// Create a downloader over `source` writing into a fresh temp dir.
/// Returns the downloader and the tempdir (which must be kept alive).
pub(crate) fn create_test_downloader(
    source: Arc<MemorySource>,
    config: Config,
) -> (Downloader, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("downloads").join("resource.bin");
    let downloader = Downloader::with_source(source, path, config).unwrap();
    (downloader, temp_dir)
}

/// Read the destination file of a test downloader
pub(crate) async fn read_destination(downloader: &Downloader) -> Vec<u8> {
    let path = downloader.context().await.local_path;
    tokio::fs::read(path).await.unwrap()
}
