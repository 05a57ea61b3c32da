//! Raw packets and the seams between transport and protocol
//!
//! A [`TcpPacket`] is whatever a single socket read produced. Parser tasks turn
//! packets into [`Message`]s and hand them to a [`MessageSink`].

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use super::ManagerEvent;
use crate::protocol::{Command, Message, Response};

/// Bytes received from (or destined to) a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    remote: SocketAddr,
    data: Bytes,
}

impl TcpPacket {
    pub fn new(remote: SocketAddr, data: impl Into<Bytes>) -> Self {
        Self {
            remote,
            data: data.into(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Receives messages parsed from an endpoint's byte stream
pub trait MessageSink: Send + Sync + 'static {
    fn deliver(&self, from: SocketAddr, message: Message);
}

impl MessageSink for mpsc::UnboundedSender<(SocketAddr, Message)> {
    fn deliver(&self, from: SocketAddr, message: Message) {
        if self.send((from, message)).is_err() {
            tracing::debug!("Message from {} dropped: receiver closed", from);
        }
    }
}

/// Sends messages to connected endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    /// Send a command; false if the endpoint is not connected or the write failed
    async fn send_command(&self, command: &Command, endpoint: SocketAddr) -> bool;

    /// Send a response; false if the endpoint is not connected or the write failed
    async fn send_response(&self, response: &Response, endpoint: SocketAddr) -> bool;

    async fn is_connected(&self, endpoint: SocketAddr) -> bool;

    /// Close the connection to an endpoint; false if it was not connected
    async fn disconnect(&self, endpoint: SocketAddr) -> bool;
}

/// Source of connection lifecycle and message events
pub trait MessageSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ManagerEvent>;
}
