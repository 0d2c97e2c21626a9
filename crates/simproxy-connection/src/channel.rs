//! Length-prefixed channel over a TCP stream
//!
//! Both relay directions speak the same framing: a 4-byte big-endian length
//! followed by the payload. A channel either wraps an accepted stream or
//! dials its target on the first send.

use bytes::Bytes;
use futures::FutureExt;
use simproxy_proto::{CodecError, FrameCodec, HEADER_SIZE};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Number of payload bytes shown when echoing messages
const ECHO_PREVIEW_LEN: usize = 40;

/// Target used by lazily connected channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
}

impl DialTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Channel closed")]
    Closed,
}

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    NotConnected = 0,
    Connected = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::NotConnected,
            1 => ChannelState::Connected,
            _ => ChannelState::Closed,
        }
    }
}

/// Result of a best-effort send
///
/// Sends never propagate errors to the forwarding loops; this tells the
/// caller what actually happened so it can log or ignore it.
#[derive(Debug)]
pub enum SendOutcome {
    /// Frame written and flushed
    Sent,
    /// Empty payload, nothing written
    Empty,
    /// Channel is closed (or has nothing to dial)
    Closed,
    /// The send failed and the channel has been disconnected
    Failed(ChannelError),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// Framed, duplex channel to one peer
///
/// Reading and writing use separate halves so one task can block in
/// `receive()` while another sends.
pub struct FramedChannel {
    label: String,
    state: AtomicU8,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    dial_target: Option<DialTarget>,
    echo: AtomicBool,
    shutdown: CancellationToken,
}

impl FramedChannel {
    /// Wrap an already established stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let label = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = Self::prepare(stream, &label);

        Self {
            label,
            state: AtomicU8::new(ChannelState::Connected as u8),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            dial_target: None,
            echo: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a channel that connects to `target` on the first send
    pub fn lazy(target: DialTarget) -> Self {
        Self {
            label: target.to_string(),
            state: AtomicU8::new(ChannelState::NotConnected as u8),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            dial_target: Some(target),
            echo: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn prepare(stream: TcpStream, label: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %label, "Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half), write_half)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn echo_enabled(&self) -> bool {
        self.echo.load(Ordering::Relaxed)
    }

    pub fn set_echo(&self, enabled: bool) {
        self.echo.store(enabled, Ordering::Relaxed);
    }

    /// Flip message echo, returning the new setting
    pub fn toggle_echo(&self) -> bool {
        !self.echo.fetch_xor(true, Ordering::Relaxed)
    }

    /// Send one payload as a frame
    ///
    /// Dials first if the channel is lazy and not yet connected. Failures
    /// disconnect the channel and are reported through the outcome only.
    pub async fn send(&self, payload: &[u8]) -> SendOutcome {
        let mut writer = self.writer.lock().await;

        if self.state() == ChannelState::NotConnected {
            if let Some(target) = &self.dial_target {
                match self.dial(target).await {
                    Ok(stream) => {
                        let (read_half, write_half) = Self::prepare(stream, &self.label);
                        *self.reader.lock().await = Some(read_half);
                        *writer = Some(write_half);

                        if self
                            .state
                            .compare_exchange(
                                ChannelState::NotConnected as u8,
                                ChannelState::Connected as u8,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_err()
                        {
                            // Closed while dialing
                            writer.take();
                            self.reader.lock().await.take();
                            return SendOutcome::Closed;
                        }

                        debug!(peer = %self.label, "Connected to upstream");
                    }
                    Err(ChannelError::Closed) => return SendOutcome::Closed,
                    Err(e) => {
                        warn!(peer = %self.label, "{}", e);
                        drop(writer);
                        self.disconnect().await;
                        return SendOutcome::Failed(e);
                    }
                }
            }
        }

        if self.state() != ChannelState::Connected {
            return SendOutcome::Closed;
        }
        let Some(stream) = writer.as_mut() else {
            return SendOutcome::Closed;
        };

        if payload.is_empty() {
            if self.echo_enabled() {
                info!(target: "simproxy::echo", peer = %self.label, "<empty message>");
            }
            return SendOutcome::Empty;
        }

        if self.echo_enabled() {
            let preview = &payload[..payload.len().min(ECHO_PREVIEW_LEN)];
            info!(
                target: "simproxy::echo",
                peer = %self.label,
                "{}",
                String::from_utf8_lossy(preview)
            );
        }

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            result = Self::write_frame(stream, payload) => result,
        };

        match result {
            Ok(()) => {
                trace!(peer = %self.label, len = payload.len(), "Sent frame");
                SendOutcome::Sent
            }
            Err(ChannelError::Closed) => SendOutcome::Closed,
            Err(e) => {
                debug!(peer = %self.label, "Send failed: {}", e);
                writer.take();
                drop(writer);
                self.disconnect().await;
                SendOutcome::Failed(e)
            }
        }
    }

    /// Receive the next complete payload
    ///
    /// Returns None once the channel is closed, the peer went away, or the
    /// stream carried a malformed header. Any of these disconnects the channel.
    pub async fn receive(&self) -> Option<Bytes> {
        if self.state() != ChannelState::Connected {
            return None;
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut()?;

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            result = Self::read_frame(reader) => result,
        };

        match result {
            Ok(payload) => {
                trace!(peer = %self.label, len = payload.len(), "Received frame");
                Some(payload)
            }
            Err(e) => {
                guard.take();
                drop(guard);

                match &e {
                    ChannelError::Closed => {}
                    ChannelError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!(peer = %self.label, "Peer closed connection");
                    }
                    ChannelError::Codec(codec) => {
                        warn!(peer = %self.label, "Invalid frame: {}", codec);
                    }
                    _ => {
                        debug!(peer = %self.label, "Receive failed: {}", e);
                    }
                }

                self.disconnect().await;
                None
            }
        }
    }

    /// Non-blocking check for input that can be read right away
    pub fn input_available(&self) -> bool {
        if self.state() != ChannelState::Connected {
            return false;
        }

        // A pending receive owns the reader, so nothing is waiting unread
        let Ok(mut guard) = self.reader.try_lock() else {
            return false;
        };
        let Some(reader) = guard.as_mut() else {
            return false;
        };

        if !reader.buffer().is_empty() {
            return true;
        }

        match reader.fill_buf().now_or_never() {
            Some(Ok(buf)) => !buf.is_empty(),
            _ => false,
        }
    }

    /// Close the channel. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let previous = self
            .state
            .swap(ChannelState::Closed as u8, Ordering::SeqCst);
        if previous == ChannelState::Closed as u8 {
            return;
        }

        self.shutdown.cancel();

        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        if previous == ChannelState::Connected as u8 {
            debug!(peer = %self.label, "Channel disconnected");
        }
    }

    async fn dial(&self, target: &DialTarget) -> Result<TcpStream, ChannelError> {
        let address = target.to_string();
        debug!(peer = %address, "Dialing upstream");

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            result = TcpStream::connect((target.host.as_str(), target.port)) => {
                result.map_err(|source| ChannelError::ConnectFailed { address, source })
            }
        }
    }

    async fn write_frame(stream: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), ChannelError> {
        let frame = FrameCodec::encode(payload)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Bytes, ChannelError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let length = FrameCodec::parse_header(header)?;

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        Ok(Bytes::from(payload))
    }
}

impl fmt::Display for FramedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedChannel")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("lazy", &self.dial_target.is_some())
            .finish()
    }
}
