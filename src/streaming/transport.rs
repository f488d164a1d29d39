//! Transport adapters
//!
//! Thin wrappers that deliver raw frames and expose send / close:
//!
//! - [`WsTransport`]: duplex WebSocket used by realtime voice sessions.
//! - [`LineFramer`]: splits a chunked HTTP body into one frame per line.
//!
//! # Retry Strategy
//!
//! WebSocket connection retries with exponential backoff (1s, 2s, 4s).
//! Authentication failures are not retried. A connection that drops
//! mid-session is not resumed; the provider reports it as lost.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::credentials::bearer;
use crate::error::ProviderError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed: {0}")]
    Disconnected(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl From<TransportError> for ProviderError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthenticationFailed(_) => ProviderError::rejected(err.to_string()),
            _ => ProviderError::connection_lost(err.to_string()),
        }
    }
}

/// One unit of data off the wire, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    /// Doubles on every retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        base_delay: Duration::ZERO,
    };

    fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Connected WebSocket, split into write and read halves.
pub struct WsTransport {
    write: SplitSink<WsStream, Message>,
    read: Option<FrameReader>,
}

impl WsTransport {
    /// Connect with retries.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        // Harmless if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut last_error = None;

        for attempt in 0..=retry.retries {
            if attempt > 0 {
                let delay = retry.delay_before(attempt);
                log::info!(
                    "Transport: retrying WebSocket connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    retry.retries + 1
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(url, token).await {
                Ok(transport) => return Ok(transport),
                Err(e @ TransportError::AuthenticationFailed(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Transport: connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::ConnectionFailed("Max retries exceeded".to_string())))
    }

    async fn try_connect(url: &str, token: Option<&str>) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if let Some(token) = token {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&bearer(token))
                    .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?,
            );
        }

        log::info!("Transport: connecting to {}", url);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(map_connect_error)?;

        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read: Some(FrameReader { read }),
        })
    }

    pub async fn send_json<T: Serialize>(&mut self, msg: &T) -> Result<(), TransportError> {
        let json =
            serde_json::to_string(msg).map_err(|e| TransportError::Protocol(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Next frame, while the reader has not been taken.
    pub async fn recv(&mut self) -> Option<Result<RawFrame, TransportError>> {
        match self.read.as_mut() {
            Some(reader) => reader.next_frame().await,
            None => None,
        }
    }

    /// Take the read half so frames can be consumed on another task.
    pub fn take_reader(&mut self) -> Option<FrameReader> {
        self.read.take()
    }

    /// Send a close frame. Errors are logged, never returned.
    pub async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            log::debug!("Transport: error closing WebSocket: {}", e);
        }
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::AuthenticationFailed(format!("HTTP {}", status))
            } else {
                TransportError::ConnectionFailed(format!("HTTP {}", status))
            }
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

/// Read half of a [`WsTransport`].
pub struct FrameReader {
    read: SplitStream<WsStream>,
}

impl FrameReader {
    /// Next data frame. `None` once the peer closed the connection.
    ///
    /// Ping / pong are skipped (tungstenite answers pings itself).
    pub async fn next_frame(&mut self) -> Option<Result<RawFrame, TransportError>> {
        while let Some(msg) = self.read.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(RawFrame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(RawFrame::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    log::info!("Transport: WebSocket closed by server: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Disconnected(e.to_string()))),
            }
        }
        None
    }
}

/// Longest line the framer buffers while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a chunked HTTP body into line frames.
///
/// Accepts NDJSON and server-sent-event style `data:` lines. Blank lines,
/// SSE comments and the `[DONE]` sentinel are skipped.
#[derive(Debug)]
pub struct LineFramer {
    pending: Vec<u8>,
    max_line: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
        }
    }

    /// Feed a body chunk; returns every frame it completed.
    ///
    /// Fails once an unterminated line grows past the limit. The buffer is
    /// dropped and the framer should not be fed again.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>, TransportError> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(frame) = Self::frame_from_line(&line) {
                frames.push(frame);
            }
        }

        if self.pending.len() > self.max_line {
            let buffered = self.pending.len();
            self.pending = Vec::new();
            return Err(TransportError::Protocol(format!(
                "line of {} bytes exceeds {} without a newline",
                buffered, self.max_line
            )));
        }
        Ok(frames)
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<RawFrame> {
        let line = std::mem::take(&mut self.pending);
        Self::frame_from_line(&line)
    }

    fn frame_from_line(line: &[u8]) -> Option<RawFrame> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() || text.starts_with(':') {
            return None;
        }
        let text = text
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(text);
        if text.is_empty() || text == "[DONE]" {
            return None;
        }
        Some(RawFrame::Text(text.to_string()))
    }
}
