//! Connection manager
//!
//! Accepts module connections, keeps the set of live peers, feeds their raw
//! packets to the packet dispatcher and publishes everything that happens as
//! [`ManagerEvent`]s.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{Connection, ConnectionHandle};
use super::dispatcher::PacketDispatcher;
use super::packet::{Connector, MessageSink, MessageSource, TcpPacket};
use super::NetworkConfig;
use crate::protocol::{encode_frame, Command, Message, Response};

/// Capacity of each connection's outgoing frame queue
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection manager already running")]
    AlreadyRunning,

    #[error("Cannot reconfigure a running connection manager")]
    Running,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Lifecycle of the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerStatus::Stopped => "stopped",
            ManagerStatus::Starting => "starting",
            ManagerStatus::Running => "running",
            ManagerStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Listener bound and accepting
    Started {
        bind_addr: SocketAddr,
    },
    /// Listener closed and every peer disconnected
    Stopped,
    StatusChanged {
        status: ManagerStatus,
    },
    ClientConnected {
        addr: SocketAddr,
    },
    ClientDisconnected {
        addr: SocketAddr,
        reason: String,
    },
    /// Raw bytes read from a peer, before parsing
    DataReceived {
        packet: TcpPacket,
    },
    CommandReceived {
        addr: SocketAddr,
        command: Command,
    },
    ResponseReceived {
        addr: SocketAddr,
        response: Response,
    },
    CommandSent {
        addr: SocketAddr,
        command: Command,
    },
    ResponseSent {
        addr: SocketAddr,
        response: Response,
    },
    /// Non-fatal error
    Error {
        message: String,
    },
}

impl MessageSink for broadcast::Sender<ManagerEvent> {
    fn deliver(&self, from: SocketAddr, message: Message) {
        let event = match message {
            Message::Command(command) => ManagerEvent::CommandReceived {
                addr: from,
                command,
            },
            Message::Response(response) => ManagerEvent::ResponseReceived {
                addr: from,
                response,
            },
        };
        // No subscriber is not an error
        let _ = self.send(event);
    }
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Peer address
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: SystemTime,
    /// Handle for sending frames to this peer
    pub handle: ConnectionHandle,
}

type ClientTable = Arc<RwLock<HashMap<SocketAddr, ClientInfo>>>;

/// TCP connection manager
pub struct ConnectionManager {
    /// Network configuration
    config: NetworkConfig,
    /// Current lifecycle status
    status: Arc<RwLock<ManagerStatus>>,
    /// Connected peers
    clients: ClientTable,
    /// Per-endpoint parsing
    dispatcher: Arc<PacketDispatcher>,
    /// Event fan-out
    event_tx: broadcast::Sender<ManagerEvent>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// The accept loop
    accept_task: Option<JoinHandle<()>>,
    /// Bound address while running
    local_addr: Option<SocketAddr>,
}

impl ConnectionManager {
    /// Create a new, stopped connection manager
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let dispatcher = Arc::new(PacketDispatcher::new(
            Arc::new(event_tx.clone()),
            config.max_frame_size,
        ));

        Self {
            config,
            status: Arc::new(RwLock::new(ManagerStatus::Stopped)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            dispatcher,
            event_tx,
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Change the listening port; refused while running
    pub async fn set_port(&mut self, port: u16) -> ManagerResult<()> {
        if *self.status.read().await != ManagerStatus::Stopped {
            return Err(ManagerError::Running);
        }
        self.config.port = port;
        Ok(())
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    /// Start listening for connections
    pub async fn start(&mut self) -> ManagerResult<()> {
        {
            let status = self.status.read().await;
            if *status != ManagerStatus::Stopped {
                return Err(ManagerError::AlreadyRunning);
            }
        }

        set_status(&self.status, &self.event_tx, ManagerStatus::Starting).await;

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let bound = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                set_status(&self.status, &self.event_tx, ManagerStatus::Stopped).await;
                return Err(ManagerError::BindFailed(format!(
                    "Failed to bind to {}: {}",
                    bind_addr, e
                )));
            }
        };

        tracing::info!("Connection manager listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.dispatcher.start();

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            self.clients.clone(),
            self.dispatcher.clone(),
            self.event_tx.clone(),
            self.config.write_timeout(),
        )));

        set_status(&self.status, &self.event_tx, ManagerStatus::Running).await;
        let _ = self.event_tx.send(ManagerEvent::Started {
            bind_addr: local_addr,
        });

        Ok(())
    }

    /// Stop listening, disconnect every peer and stop all parsing
    ///
    /// Does nothing if the manager is not running.
    pub async fn stop(&mut self) -> ManagerResult<()> {
        {
            let status = self.status.read().await;
            if *status != ManagerStatus::Running {
                return Ok(());
            }
        }

        set_status(&self.status, &self.event_tx, ManagerStatus::Stopping).await;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop failed: {}", e);
            }
        }

        self.dispatcher.stop_all().await;
        self.local_addr = None;

        set_status(&self.status, &self.event_tx, ManagerStatus::Stopped).await;
        let _ = self.event_tx.send(ManagerEvent::Stopped);
        tracing::info!("Connection manager stopped");

        Ok(())
    }

    pub async fn status(&self) -> ManagerStatus {
        *self.status.read().await
    }

    /// Check if the manager is running
    pub async fn is_running(&self) -> bool {
        self.status().await == ManagerStatus::Running
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Snapshot of the connected peers
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        clients.values().cloned().collect()
    }

    /// Number of connected peers at the time of the call
    pub async fn connected_clients_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Number of endpoints that currently have a parser task
    pub async fn parser_task_count(&self) -> usize {
        self.dispatcher.task_count().await
    }

    /// Send a message to a peer
    ///
    /// Returns false without waiting when the peer's write queue is full.
    pub async fn send(&self, message: &Message, endpoint: SocketAddr) -> bool {
        let handle = {
            let clients = self.clients.read().await;
            clients.get(&endpoint).map(|c| c.handle.clone())
        };
        let Some(handle) = handle else {
            tracing::debug!("Cannot send '{}' to {}: not connected", message.name(), endpoint);
            return false;
        };
        if let Err(e) = message.validate() {
            tracing::warn!("Refusing to send '{}' to {}: {}", message.name(), endpoint, e);
            return false;
        }

        // A peer that stops reading fills its queue; never wait on it
        if let Err(e) = handle.try_send(encode_frame(message)) {
            tracing::warn!("Failed to send '{}' to {}: {}", message.name(), endpoint, e);
            return false;
        }

        let event = match message {
            Message::Command(command) => ManagerEvent::CommandSent {
                addr: endpoint,
                command: command.clone(),
            },
            Message::Response(response) => ManagerEvent::ResponseSent {
                addr: endpoint,
                response: response.clone(),
            },
        };
        let _ = self.event_tx.send(event);
        true
    }

    pub async fn send_command(&self, command: &Command, endpoint: SocketAddr) -> bool {
        self.send(&Message::Command(command.clone()), endpoint).await
    }

    pub async fn send_response(&self, response: &Response, endpoint: SocketAddr) -> bool {
        self.send(&Message::Response(response.clone()), endpoint).await
    }

    /// Send a command to every connected peer, returning how many sends succeeded
    pub async fn broadcast_command(&self, command: &Command) -> usize {
        let endpoints: Vec<SocketAddr> = self.clients.read().await.keys().copied().collect();
        let message = Message::Command(command.clone());

        let mut sent = 0;
        for endpoint in endpoints {
            if self.send(&message, endpoint).await {
                sent += 1;
            }
        }
        sent
    }

    /// Close the connection to a peer
    pub async fn disconnect(&self, endpoint: SocketAddr) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&endpoint) {
            Some(client) => {
                client.handle.request_close();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn send_command(&self, command: &Command, endpoint: SocketAddr) -> bool {
        ConnectionManager::send_command(self, command, endpoint).await
    }

    async fn send_response(&self, response: &Response, endpoint: SocketAddr) -> bool {
        ConnectionManager::send_response(self, response, endpoint).await
    }

    async fn is_connected(&self, endpoint: SocketAddr) -> bool {
        let clients = self.clients.read().await;
        clients
            .get(&endpoint)
            .map(|c| c.handle.is_connected())
            .unwrap_or(false)
    }

    async fn disconnect(&self, endpoint: SocketAddr) -> bool {
        ConnectionManager::disconnect(self, endpoint).await
    }
}

impl MessageSource for ConnectionManager {
    fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        ConnectionManager::subscribe(self)
    }
}

async fn set_status(
    status: &RwLock<ManagerStatus>,
    event_tx: &broadcast::Sender<ManagerEvent>,
    next: ManagerStatus,
) {
    *status.write().await = next;
    tracing::debug!("Connection manager {}", next);
    let _ = event_tx.send(ManagerEvent::StatusChanged { status: next });
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: mpsc::Receiver<()>,
    clients: ClientTable,
    dispatcher: Arc<PacketDispatcher>,
    event_tx: broadcast::Sender<ManagerEvent>,
    write_timeout: Duration,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::info!("New connection from {}", addr);

                        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);
                        let handle = ConnectionHandle::new(frame_tx);

                        // Registered before the handler runs so shutdown always sees it
                        clients.write().await.insert(addr, ClientInfo {
                            addr,
                            connected_at: SystemTime::now(),
                            handle: handle.clone(),
                        });
                        let _ = event_tx.send(ManagerEvent::ClientConnected { addr });

                        handlers.spawn(handle_client(
                            stream,
                            addr,
                            handle,
                            frame_rx,
                            clients.clone(),
                            dispatcher.clone(),
                            event_tx.clone(),
                            write_timeout,
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        let _ = event_tx.send(ManagerEvent::Error {
                            message: format!("Accept failed: {}", e),
                        });
                    }
                }
            }
            Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = result {
                    tracing::error!("Client handler failed: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Connection manager shutdown requested");
                break;
            }
        }
    }

    drop(listener);

    {
        let clients = clients.read().await;
        for client in clients.values() {
            client.handle.request_close();
        }
    }
    while let Some(result) = handlers.join_next().await {
        if let Err(e) = result {
            tracing::error!("Client handler failed: {}", e);
        }
    }
}

/// Pump one peer's socket until it closes or a close is requested
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    handle: ConnectionHandle,
    mut frame_rx: mpsc::Receiver<Bytes>,
    clients: ClientTable,
    dispatcher: Arc<PacketDispatcher>,
    event_tx: broadcast::Sender<ManagerEvent>,
    write_timeout: Duration,
) {
    let mut conn = Connection::new(stream, addr);

    let disconnect_reason = loop {
        tokio::select! {
            result = conn.read_packet() => {
                match result {
                    Ok(Some(packet)) => {
                        let _ = event_tx.send(ManagerEvent::DataReceived {
                            packet: packet.clone(),
                        });
                        dispatcher.enqueue(packet).await;
                    }
                    Ok(None) => {
                        break "Connection closed".to_string();
                    }
                    Err(e) => {
                        break format!("Read error: {}", e);
                    }
                }
            }

            Some(frame) = frame_rx.recv() => {
                // A stalled peer must not hold off a close request
                tokio::select! {
                    result = tokio::time::timeout(write_timeout, conn.write_frame(&frame)) => {
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break format!("Send error: {}", e),
                            Err(_) => break format!("Write timed out after {:?}", write_timeout),
                        }
                    }
                    _ = handle.closed() => {
                        break "Disconnect requested".to_string();
                    }
                }
            }

            _ = handle.closed() => {
                break "Disconnect requested".to_string();
            }
        }
    };

    handle.mark_disconnected();
    clients.write().await.remove(&addr);

    if let Err(e) = conn.close().await {
        tracing::debug!("Error closing connection to {}: {}", addr, e);
    }

    // Packets already read are still parsed before the task goes away
    dispatcher.stop_endpoint(addr).await;

    tracing::info!("Client {} disconnected: {}", addr, disconnect_reason);
    let _ = event_tx.send(ManagerEvent::ClientDisconnected {
        addr,
        reason: disconnect_reason,
    });
}
