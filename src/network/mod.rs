//! Network module - TCP transport between modules
//!
//! Provides:
//! - Connection manager accepting module connections
//! - Per-endpoint packet parsing and its dispatcher
//! - Client for connecting to a connection manager

mod client;
mod connection;
mod dispatcher;
mod manager;
mod packet;
mod parser;

pub use client::*;
pub use connection::*;
pub use dispatcher::*;
pub use manager::*;
pub use packet::*;
pub use parser::*;

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to
    pub bind_address: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Longest a single frame write may take before the peer is dropped
    pub write_timeout_ms: u64,
    /// Maximum frame size
    pub max_frame_size: usize,
    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5000,
            write_timeout_ms: 5000,
            max_frame_size: crate::protocol::MAX_FRAME_SIZE,
            event_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
