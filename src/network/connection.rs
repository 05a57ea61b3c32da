//! Connection handling
//!
//! Wraps a single peer's TCP stream:
//! - Reading raw packets off the socket
//! - Writing encoded frames
//! - Connection state and traffic statistics

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use super::packet::TcpPacket;

/// Size of a single socket read
const READ_BUFFER_SIZE: usize = 4096;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Send channel closed")]
    SendChannelClosed,

    #[error("Write queue full")]
    QueueFull,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for communication
    Connected,
    /// Connection is closing gracefully
    Closing,
    /// Connection has been closed
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames written
    pub frames_sent: u64,
    /// Packets read
    pub packets_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A TCP connection to a remote module
pub struct Connection {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// Read buffer
    read_buf: Box<[u8]>,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        Self {
            remote_addr,
            stream,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            state: ConnectionState::Connected,
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Read whatever the peer sent next
    ///
    /// Returns None once the peer has closed the stream. Cancel safe.
    pub async fn read_packet(&mut self) -> ConnectionResult<Option<TcpPacket>> {
        let n = self.stream.read(&mut self.read_buf).await?;
        if n == 0 {
            self.state = ConnectionState::Closed;
            return Ok(None);
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += n as u64;

        Ok(Some(TcpPacket::new(
            self.remote_addr,
            Bytes::copy_from_slice(&self.read_buf[..n]),
        )))
    }

    /// Write an encoded frame
    pub async fn write_frame(&mut self, frame: &[u8]) -> ConnectionResult<()> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        self.stream.write_all(frame).await?;
        self.stream.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        Ok(())
    }

    /// Close the connection gracefully
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        self.state = ConnectionState::Closing;
        let result = self.stream.shutdown().await;
        self.state = ConnectionState::Closed;

        result.map_err(ConnectionError::from)
    }

    /// Check if the connection is still active
    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }
}

/// A handle for writing frames to a connection owned by another task
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            close: Arc::new(Notify::new()),
        }
    }

    /// Queue an encoded frame for writing
    pub async fn send(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(frame)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Queue an encoded frame without waiting for room in the queue
    pub fn try_send(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::SendChannelClosed,
        })
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Ask the owning task to close the connection
    pub fn request_close(&self) {
        self.mark_disconnected();
        self.close.notify_one();
    }

    /// Resolves once a close has been requested
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}
