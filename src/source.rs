//! Remote and local endpoints of a block copy
//!
//! - [`RemoteSource`] - abstraction over where bytes come from, enabling testability
//! - [`HttpSource`] - production source issuing HTTP range requests with `reqwest`
//! - [`prepare_destination`] / [`open_block_writer`] - the shared local file
//! - [`open_stream_pair`] - the deferred reader/writer pair a block engine copies between

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tokio_util::io::StreamReader;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{BlockIoError, Error, Result};
use crate::types::ByteRange;

/// Reader over the bytes of one range of the remote resource
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writer positioned at the start of a block in the local file
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The connected pair a block engine copies between
///
/// Dropping the pair releases both sides (HTTP response, file handle).
pub struct StreamPair {
    /// Remote side, scoped to the block's range
    pub reader: RemoteReader,
    /// Local side, positioned at the block's offset
    pub writer: LocalWriter,
}

impl StreamPair {
    /// Pair up a reader and a writer
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

/// Where a transfer's bytes come from
#[async_trait::async_trait]
pub trait RemoteSource: Send + Sync {
    /// Location of the resource, for logging and the transfer context
    fn location(&self) -> &Url;

    /// Size of the resource in bytes, or `None` if the remote does not say
    async fn content_length(&self) -> std::result::Result<Option<u64>, BlockIoError>;

    /// Open a reader over exactly `range` of the resource
    async fn open_range(&self, range: ByteRange) -> std::result::Result<RemoteReader, BlockIoError>;
}

/// [`RemoteSource`] backed by HTTP range requests
#[derive(Clone, Debug)]
pub struct HttpSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpSource {
    /// Build a source with its own connection pool configured from `config`
    pub fn new(url: Url, config: &HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone());
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(Error::Network)?;
        Ok(Self { client, url })
    }

    /// Use an existing client (shared pool, custom TLS, proxies, ...)
    pub fn with_client(url: Url, client: reqwest::Client) -> Self {
        Self { client, url }
    }

    async fn probe_length_with_range(&self) -> std::result::Result<Option<u64>, BlockIoError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)),
            // Range ignored: the full body length is the resource length
            StatusCode::OK => Ok(header_u64(response.headers(), CONTENT_LENGTH)),
            status => Err(BlockIoError::Status {
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl RemoteSource for HttpSource {
    fn location(&self) -> &Url {
        &self.url
    }

    async fn content_length(&self) -> std::result::Result<Option<u64>, BlockIoError> {
        let response = self.client.head(self.url.clone()).send().await?;
        let status = response.status();

        // Read the header directly: the body of a HEAD response is always empty
        if status.is_success()
            && let Some(length) = header_u64(response.headers(), CONTENT_LENGTH)
        {
            return Ok(Some(length));
        }

        tracing::debug!(
            url = %self.url,
            status = status.as_u16(),
            "HEAD gave no content length, probing with a range request"
        );
        self.probe_length_with_range().await
    }

    async fn open_range(&self, range: ByteRange) -> std::result::Result<RemoteReader, BlockIoError> {
        let header = range.to_header_value().ok_or(BlockIoError::RangeNotSatisfied {
            status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
        })?;

        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, header)
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            // A full body is only usable when the range starts at 0; the engine
            // caps the read at the range length.
            StatusCode::OK if range.offset == 0 => {
                tracing::debug!(url = %self.url, "Server ignored range header for leading block");
            }
            StatusCode::OK | StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(BlockIoError::RangeNotSatisfied {
                    status: response.status().as_u16(),
                });
            }
            status => {
                return Err(BlockIoError::Status {
                    status: status.as_u16(),
                });
            }
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(body)))
    }
}

fn header_u64(
    headers: &reqwest::header::HeaderMap,
    name: reqwest::header::HeaderName,
) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Parse the total from a `Content-Range: bytes 0-0/12345` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Create the destination file (and parent directories) and extend it to `total_length`
///
/// An existing file is never truncated, so bytes written by an earlier run
/// survive a restart.
pub async fn prepare_destination(path: &Path, total_length: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() < total_length {
        file.set_len(total_length).await?;
    }
    Ok(())
}

/// Open the destination for writing one block, positioned at `offset`
///
/// Each block gets its own handle; blocks never share a cursor.
pub async fn open_block_writer(path: &Path, offset: u64) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Connect the remote range and the local file for one block copy
///
/// Meant to be called from inside the block's worker, so planning many blocks
/// never opens a connection.
pub async fn open_stream_pair(
    source: Arc<dyn RemoteSource>,
    local_path: PathBuf,
    range: ByteRange,
) -> std::result::Result<StreamPair, BlockIoError> {
    let reader = source.open_range(range).await?;
    let writer = open_block_writer(&local_path, range.offset).await?;
    Ok(StreamPair {
        reader,
        writer: Box::new(writer),
    })
}
