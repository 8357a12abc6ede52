//! Downloader tests, grouped by concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::Downloader;
use super::test_helpers::*;
use crate::config::{Config, RetryConfig};
use crate::error::{BlockIoError, Error};
use crate::types::{BlockId, BlockTransferContext, ByteRange, Event, TransferStatus};


/// Poll `condition` until it holds, failing the test after five seconds
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until every listed block has confirmed at least `bytes`
async fn wait_for_progress(downloader: &Downloader, blocks: &[u32], bytes: u64) {
    wait_until(|| async {
        let context = downloader.context().await;
        blocks.iter().all(|id| {
            context
                .block(BlockId(*id))
                .is_some_and(|b| b.completed_bytes >= bytes)
        })
    })
    .await;
}

/// Run `activate` on a background task
fn spawn_activate(
    downloader: &Downloader,
) -> tokio::task::JoinHandle<crate::error::Result<TransferStatus>> {
    let downloader = downloader.clone();
    tokio::spawn(async move { downloader.activate(CancellationToken::new()).await })
}

/// Drain everything currently buffered in a broadcast receiver
fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

fn status_changes(events: &[Event]) -> Vec<(TransferStatus, TransferStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StatusChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
