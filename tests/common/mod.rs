//! Common test utilities for segment-dl HTTP tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use segment_dl::Event;
use tokio::sync::broadcast;
use wiremock::{Request, Respond, ResponseTemplate};

pub const KIB: usize = 1024;

/// Deterministic resource content
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Responder that serves `data` the way a range-capable file server does
///
/// HEAD gets the size, GET honours a single `Range: bytes=a-b` header with a
/// 206 and falls back to the whole body with a 200. Optional failures are
/// injected for the first `fail_first` ranged requests at `fail_offset`.
#[derive(Clone)]
pub struct RangeResponder {
    data: Arc<Vec<u8>>,
    fail_offset: Option<u64>,
    fail_first: Arc<AtomicUsize>,
    fail_status: u16,
}

impl RangeResponder {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            fail_offset: None,
            fail_first: Arc::new(AtomicUsize::new(0)),
            fail_status: 503,
        }
    }

    /// Answer the first `times` requests for the range starting at `offset` with `status`
    pub fn failing(mut self, offset: u64, times: usize, status: u16) -> Self {
        self.fail_offset = Some(offset);
        self.fail_first = Arc::new(AtomicUsize::new(times));
        self.fail_status = status;
        self
    }

    fn should_fail(&self, offset: u64) -> bool {
        self.fail_offset == Some(offset)
            && self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.data.len() as u64;

        if request.method.as_str() == "HEAD" {
            // Content-Length is derived from the body; HEAD never sends it
            return ResponseTemplate::new(200).set_body_bytes(self.data.as_slice());
        }

        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        let Some((start, end)) = range else {
            return ResponseTemplate::new(200).set_body_bytes(self.data.as_slice());
        };
        if start >= total || end < start {
            return ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{total}").as_str());
        }
        if self.should_fail(start) {
            return ResponseTemplate::new(self.fail_status);
        }

        let end = end.min(total - 1);
        ResponseTemplate::new(206)
            .insert_header(
                "Content-Range",
                format!("bytes {start}-{end}/{total}").as_str(),
            )
            .set_body_bytes(&self.data[start as usize..=end as usize])
    }
}

/// Parse `bytes=a-b` into inclusive bounds
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Offsets of every ranged GET the server received, in arrival order
pub async fn requested_offsets(server: &wiremock::MockServer) -> Vec<u64> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .filter_map(|r| r.headers.get("range")?.to_str().ok().and_then(parse_range))
        .map(|(start, _)| start)
        .collect()
}

/// Collect events until the transfer settles or `timeout` elapses
pub async fn collect_events_until_settled(
    mut events: broadcast::Receiver<Event>,
    timeout: Duration,
) -> Vec<Event> {
    let mut collected = Vec::new();

    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let settled = matches!(&event, Event::StatusChanged { to, .. } if to.is_settled());
            collected.push(event);
            if settled {
                return;
            }
        }
    })
    .await;

    collected
}
