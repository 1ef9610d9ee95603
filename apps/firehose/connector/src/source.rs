//! Feed sources
//!
//! A source reads newline-delimited records and offers each one to the
//! pipeline. The HTTP source holds one long-lived streaming connection and
//! reconnects with backoff when it drops or stalls; blank keep-alive lines
//! are skipped.

use crate::config::HttpSourceConfig;
use async_trait::async_trait;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_producer::{DropReason, Offer, PipelineHandle, Record};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Credentials rejected (HTTP {0})")]
    Unauthorized(u16),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("No data received for {0:?}")]
    Stalled(Duration),

    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Fatal errors stop the source instead of triggering a reconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unauthorized(_))
    }
}

/// Splits a byte stream into lines across chunk boundaries.
///
/// Accepts `\n` and `\r\n` terminators and skips blank lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(line) = trim_line(&self.buffer[start..end]) {
                lines.push(line.to_vec());
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Take whatever is left after the stream ended without a final newline
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        trim_line(&rest).map(<[u8]>::to_vec)
    }

    /// Bytes buffered for an incomplete line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn trim_line(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(line)
    }
}

/// Connection and delivery counters for a source
#[derive(Debug, Default)]
pub struct SourceStats {
    connects: AtomicU64,
    disconnects: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    messages: AtomicU64,
    rejected: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`SourceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStatsSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub messages: u64,
    pub rejected: u64,
    pub bytes: u64,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        counter!("firehose_source_connects_total").increment(1);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        counter!("firehose_source_disconnects_total").increment(1);
    }

    /// Count a non-success HTTP status by class
    pub fn record_status(&self, status: u16) {
        if (400..500).contains(&status) {
            self.client_errors.fetch_add(1, Ordering::Relaxed);
            counter!("firehose_source_http_errors_total", "class" => "4xx").increment(1);
        } else if status >= 500 {
            self.server_errors.fetch_add(1, Ordering::Relaxed);
            counter!("firehose_source_http_errors_total", "class" => "5xx").increment(1);
        }
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        counter!("firehose_source_bytes_total").increment(bytes as u64);
    }

    /// Count the outcome of offering one line to the pipeline
    pub fn record_offer(&self, offer: &Offer) {
        match offer {
            Offer::Accepted => {
                self.messages.fetch_add(1, Ordering::Relaxed);
                counter!("firehose_source_messages_total").increment(1);
            }
            Offer::Rejected(reason) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("firehose_source_rejected_total", "reason" => reason.to_string())
                    .increment(1);
            }
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Why a single read loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// Shutdown was requested or the pipeline stopped accepting records
    Stopped,
    /// The remote side closed the stream
    Closed,
}

/// Offer one line; `None` once the pipeline no longer accepts anything
async fn forward(handle: &PipelineHandle, stats: &SourceStats, line: Vec<u8>) -> Option<Offer> {
    let offer = handle.offer(Record::new(line)).await;
    stats.record_offer(&offer);
    match offer {
        Offer::Rejected(DropReason::Closed) => None,
        offer => Some(offer),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Produces records into a running pipeline until shutdown or end of input
#[async_trait]
pub trait FeedSource: Send {
    async fn run(
        &mut self,
        handle: PipelineHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), SourceError>;

    fn name(&self) -> &'static str;
}

/// Long-lived HTTP streaming connection with reconnects
pub struct HttpStreamSource {
    config: HttpSourceConfig,
    client: reqwest::Client,
    stats: Arc<SourceStats>,
}

impl HttpStreamSource {
    pub fn new(config: HttpSourceConfig, stats: Arc<SourceStats>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            stats,
        })
    }

    async fn stream_once(
        &self,
        handle: &PipelineHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd, SourceError> {
        let url = self.config.endpoint_url();
        let credentials = &self.config.credentials;
        debug!(url = %url, "Connecting to feed");

        let mut response = tokio::select! {
            _ = wait_for_shutdown(shutdown) => return Ok(StreamEnd::Stopped),
            response = self
                .client
                .get(&url)
                .basic_auth(&credentials.username, Some(&credentials.password))
                .send() => response?,
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            self.stats.record_status(status);
            return match status {
                401 | 403 => Err(SourceError::Unauthorized(status)),
                _ => Err(SourceError::Status(status)),
            };
        }
        self.stats.record_connect();
        info!(url = %url, "Connected to feed");

        let stall_timeout = self.config.stall_timeout;
        let mut splitter = LineSplitter::new();
        loop {
            let chunk = tokio::select! {
                _ = wait_for_shutdown(shutdown) => return Ok(StreamEnd::Stopped),
                chunk = tokio::time::timeout(stall_timeout, response.chunk()) => chunk,
            };
            let chunk = chunk.map_err(|_| SourceError::Stalled(stall_timeout))??;

            let Some(bytes) = chunk else {
                if let Some(line) = splitter.finish() {
                    if forward(handle, &self.stats, line).await.is_none() {
                        return Ok(StreamEnd::Stopped);
                    }
                }
                return Ok(StreamEnd::Closed);
            };

            self.stats.record_bytes(bytes.len());
            for line in splitter.push(&bytes) {
                if forward(handle, &self.stats, line).await.is_none() {
                    return Ok(StreamEnd::Stopped);
                }
            }
        }
    }
}

#[async_trait]
impl FeedSource for HttpStreamSource {
    async fn run(
        &mut self,
        handle: PipelineHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let mut failures = 0u32;
        loop {
            let connects_before = self.stats.connects();
            let result = self.stream_once(&handle, &mut shutdown).await;
            if self.stats.connects() > connects_before {
                self.stats.record_disconnect();
                failures = 0;
            }

            match result {
                Ok(StreamEnd::Stopped) => return Ok(()),
                Ok(StreamEnd::Closed) if self.config.replay.is_some() => {
                    info!("Replay window complete");
                    return Ok(());
                }
                Ok(StreamEnd::Closed) => warn!("Feed closed the connection"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Feed connection failed"),
            }

            failures += 1;
            let delay = self.config.reconnect.backoff_delay(failures);
            info!(attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnecting to feed");
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Newline-delimited records from any async reader, standard input by default
pub struct ReaderSource<R> {
    reader: R,
    stats: Arc<SourceStats>,
}

impl ReaderSource<tokio::io::Stdin> {
    pub fn stdin(stats: Arc<SourceStats>) -> Self {
        Self::new(tokio::io::stdin(), stats)
    }
}

impl<R> ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, stats: Arc<SourceStats>) -> Self {
        Self { reader, stats }
    }
}

#[async_trait]
impl<R> FeedSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn run(
        &mut self,
        handle: PipelineHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SourceError> {
        let mut reader = BufReader::new(&mut self.reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            let read = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                read = reader.read_until(b'\n', &mut buffer) => read?,
            };
            if read == 0 {
                debug!("Input exhausted");
                return Ok(());
            }

            self.stats.record_bytes(read);
            let line = buffer.strip_suffix(b"\n").unwrap_or(&buffer);
            if let Some(line) = trim_line(line) {
                if forward(&handle, &self.stats, line.to_vec()).await.is_none() {
                    return Ok(());
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "reader"
    }
}
