//! Module client
//!
//! Connects a module to a connection manager, sends commands and waits for
//! their correlated responses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::parser::ParserTask;
use super::NetworkConfig;
use crate::protocol::{
    encode_frame, validate_identifier, Command, CommandResponsePair, Correlator, Message, ParseError,
    Response,
};

/// Capacity of the client event channel
const EVENT_CAPACITY: usize = 256;

/// Capacity of the outgoing frame queue
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,

    #[error("No response to '{name}' @{id} within {timeout:?}")]
    ResponseTimeout {
        name: String,
        id: u32,
        timeout: Duration,
    },

    #[error("Disconnected while waiting for a response")]
    Disconnected,

    #[error("Message cannot be sent: {0}")]
    InvalidMessage(#[from] ParseError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully connected to the manager
    Connected {
        server_addr: SocketAddr,
    },
    /// Disconnected from the manager
    Disconnected {
        reason: String,
    },
    /// The manager (or a module behind it) sent us a command
    CommandReceived {
        command: Command,
    },
    /// A response arrived for no pending command
    UnmatchedResponse {
        response: Response,
    },
    /// Connection error
    Error {
        message: String,
    },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// State shared between the client and its session task
#[derive(Clone)]
struct Shared {
    state: Arc<RwLock<ClientState>>,
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
    correlator: Arc<Mutex<Correlator>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Client event dropped: {}", e);
        }
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let pair = self.correlator.lock().await.resolve(&response);
                if pair.is_none() {
                    tracing::debug!(
                        "Unmatched response '{}' @{}",
                        response.name(),
                        response.id()
                    );
                    self.emit(ClientEvent::UnmatchedResponse { response });
                }
            }
            Message::Command(command) => {
                self.emit(ClientEvent::CommandReceived { command });
            }
        }
    }
}

/// Client side of a module connection
pub struct ModuleClient {
    /// Client configuration
    config: NetworkConfig,
    /// Name this module uses as command source
    module_name: String,
    shared: Shared,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Next correlation id
    next_id: AtomicU32,
    /// The running session
    session: Mutex<Option<JoinHandle<()>>>,
}

impl ModuleClient {
    /// Create a new client
    pub fn new(config: NetworkConfig, module_name: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        Self {
            config,
            module_name: module_name.into(),
            shared: Shared {
                state: Arc::new(RwLock::new(ClientState::Disconnected)),
                connection_handle: Arc::new(RwLock::new(None)),
                correlator: Arc::new(Mutex::new(Correlator::new())),
                event_tx,
            },
            event_rx: Some(event_rx),
            next_id: AtomicU32::new(1),
            session: Mutex::new(None),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to a connection manager by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        validate_identifier(&self.module_name)?;

        {
            let mut state = self.shared.state.write().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        tracing::info!("Connecting to {}", server_addr);

        // Connect with timeout
        let stream = match tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ClientState::Disconnected).await;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.shared.set_state(ClientState::Disconnected).await;
                return Err(ClientError::Timeout);
            }
        };

        let (parsed_tx, parsed_rx) = mpsc::unbounded_channel::<(SocketAddr, Message)>();
        let parser = ParserTask::new(server_addr, Arc::new(parsed_tx), self.config.max_frame_size);
        parser.start().await;

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);
        let handle = ConnectionHandle::new(frame_tx);
        *self.shared.connection_handle.write().await = Some(handle.clone());

        self.shared.set_state(ClientState::Connected).await;
        self.shared.emit(ClientEvent::Connected { server_addr });

        let session = Session {
            conn: Connection::new(stream, server_addr),
            parser,
            parsed_rx,
            frame_rx,
            handle,
            shared: self.shared.clone(),
            write_timeout: self.config.write_timeout(),
        };
        *self.session.lock().await = Some(tokio::spawn(session.run()));

        Ok(())
    }

    /// Connect to a connection manager by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Disconnect and wait until the session has shut down
    ///
    /// Commands still waiting for a response fail with `Disconnected`.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let handle = self.connection_handle().await?;
        handle.request_close();

        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.await {
                tracing::error!("Client session failed: {}", e);
            }
        }

        Ok(())
    }

    /// Send a command and wait for its response
    pub async fn execute(
        &self,
        name: &str,
        params: &str,
        timeout: Duration,
    ) -> ClientResult<CommandResponsePair> {
        let handle = self.connection_handle().await?;
        let command = Command::try_new(self.module_name.as_str(), name, params, self.next_id())?;
        let id = command.id();

        let waiter = self
            .shared
            .correlator
            .lock()
            .await
            .track_with_waiter(command.clone());

        let frame = encode_frame(&Message::Command(command));
        if let Err(e) = handle.send(frame).await {
            self.shared.correlator.lock().await.cancel(id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.correlator.lock().await.cancel(id);
                Err(ClientError::ResponseTimeout {
                    name: name.to_string(),
                    id,
                    timeout,
                })
            }
        }
    }

    /// Send a command without waiting for its response
    ///
    /// The response, when it arrives, is consumed by the correlator.
    pub async fn send_command(&self, name: &str, params: &str) -> ClientResult<u32> {
        let handle = self.connection_handle().await?;
        let command = Command::try_new(self.module_name.as_str(), name, params, self.next_id())?;
        let id = command.id();

        self.shared.correlator.lock().await.track(command.clone());
        if let Err(e) = handle.send(encode_frame(&Message::Command(command))).await {
            self.shared.correlator.lock().await.cancel(id);
            return Err(e.into());
        }
        Ok(id)
    }

    /// Answer a command received from the manager
    pub async fn send_response(&self, response: &Response) -> ClientResult<()> {
        let handle = self.connection_handle().await?;
        let message = Message::Response(response.clone());
        message.validate()?;
        handle.send(encode_frame(&message)).await?;
        Ok(())
    }

    /// Number of commands still waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.shared.correlator.lock().await.len()
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.shared.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.state().await == ClientState::Connected
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn connection_handle(&self) -> ClientResult<ConnectionHandle> {
        self.shared
            .connection_handle
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }
}

/// Socket pump for one client connection
struct Session {
    conn: Connection,
    parser: ParserTask,
    parsed_rx: mpsc::UnboundedReceiver<(SocketAddr, Message)>,
    frame_rx: mpsc::Receiver<Bytes>,
    handle: ConnectionHandle,
    shared: Shared,
    write_timeout: Duration,
}

impl Session {
    async fn run(mut self) {
        let disconnect_reason = loop {
            tokio::select! {
                // Raw bytes from the manager
                result = self.conn.read_packet() => {
                    match result {
                        Ok(Some(packet)) => {
                            if let Err(e) = self.parser.enqueue(packet) {
                                break format!("Parser error: {}", e);
                            }
                        }
                        Ok(None) => {
                            break "Connection closed".to_string();
                        }
                        Err(e) => {
                            self.shared.emit(ClientEvent::Error {
                                message: e.to_string(),
                            });
                            break format!("Read error: {}", e);
                        }
                    }
                }

                // Parsed messages
                Some((_, message)) = self.parsed_rx.recv() => {
                    self.shared.handle_message(message).await;
                }

                // Frames to the manager
                Some(frame) = self.frame_rx.recv() => {
                    tokio::select! {
                        result = tokio::time::timeout(self.write_timeout, self.conn.write_frame(&frame)) => {
                            match result {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => break format!("Send error: {}", e),
                                Err(_) => break format!("Write timed out after {:?}", self.write_timeout),
                            }
                        }
                        _ = self.handle.closed() => {
                            break "Client disconnecting".to_string();
                        }
                    }
                }

                _ = self.handle.closed() => {
                    break "Client disconnecting".to_string();
                }
            }
        };

        // Clean up
        self.handle.mark_disconnected();
        *self.shared.connection_handle.write().await = None;

        if let Err(e) = self.conn.close().await {
            tracing::debug!("Error closing connection: {}", e);
        }

        self.parser.stop().await;
        while let Ok((_, message)) = self.parsed_rx.try_recv() {
            self.shared.handle_message(message).await;
        }

        // Waiters observe a closed channel
        self.shared.correlator.lock().await.clear();
        self.shared.set_state(ClientState::Disconnected).await;

        tracing::info!("Disconnected: {}", disconnect_reason);
        self.shared.emit(ClientEvent::Disconnected {
            reason: disconnect_reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionManager, ManagerEvent};
    use tokio::sync::broadcast;

    async fn running_manager() -> (Arc<ConnectionManager>, SocketAddr) {
        let mut manager = ConnectionManager::new(NetworkConfig::new(0).with_bind_address("127.0.0.1"));
        manager.start().await.unwrap();
        let addr = manager.local_addr().unwrap();
        (Arc::new(manager), addr)
    }

    /// Answer every `ping` with `pong`
    fn spawn_responder(manager: Arc<ConnectionManager>) {
        let mut events = manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ManagerEvent::CommandReceived { addr, command }) if command.name() == "ping" => {
                        let reply = Response::for_command(&command, "board", true, "pong");
                        manager.send_response(&reply, addr).await;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn local_client() -> ModuleClient {
        ModuleClient::new(NetworkConfig::default(), "tester")
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = local_client();
        assert!(!client.is_connected().await);
        assert!(matches!(
            client.execute("ping", "", Duration::from_secs(1)).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.disconnect().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_execute_returns_correlated_pair() {
        let (manager, addr) = running_manager().await;
        spawn_responder(manager.clone());

        let client = local_client();
        client.connect(addr).await.unwrap();
        assert!(client.is_connected().await);

        let first = client.execute("ping", "a", Duration::from_secs(5)).await.unwrap();
        let second = client.execute("ping", "b", Duration::from_secs(5)).await.unwrap();

        assert_eq!(first.command().params(), "a");
        assert_eq!(first.response().params(), "pong");
        assert_eq!(first.command().id(), first.response().id());
        assert_ne!(first.command().id(), second.command().id());
        assert_eq!(client.pending_count().await, 0);

        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_execute_times_out_without_responder() {
        let (_manager, addr) = running_manager().await;

        let client = local_client();
        client.connect(addr).await.unwrap();

        let result = client.execute("ping", "", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ClientError::ResponseTimeout { .. })));
        assert_eq!(client.pending_count().await, 0);

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_identifiers_are_refused() {
        let (_manager, addr) = running_manager().await;

        let client = ModuleClient::new(NetworkConfig::default(), "robot arm");
        assert!(matches!(
            client.connect(addr).await,
            Err(ClientError::InvalidMessage(ParseError::InvalidIdentifier(_)))
        ));
        assert_eq!(client.state().await, ClientState::Disconnected);

        let client = local_client();
        client.connect(addr).await.unwrap();
        assert!(matches!(
            client.execute("move to", "", Duration::from_secs(1)).await,
            Err(ClientError::InvalidMessage(_))
        ));
        assert!(matches!(
            client.send_command("", "x").await,
            Err(ClientError::InvalidMessage(_))
        ));
        let bad = Response::new("tester", "two words", "", true, 1);
        assert!(matches!(
            client.send_response(&bad).await,
            Err(ClientError::InvalidMessage(_))
        ));
        assert_eq!(client.pending_count().await, 0);

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_stalled_write() {
        // Accepts the connection but never reads from it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = ModuleClient::new(
            NetworkConfig::default().with_write_timeout(Duration::from_secs(60)),
            "tester",
        );
        client.connect(addr).await.unwrap();
        let _stalled = acceptor.await.unwrap();

        let bulk = "x".repeat(64 * 1024);
        let mut filled = false;
        for _ in 0..10_000 {
            let send = client.send_command("dump", &bulk);
            if tokio::time::timeout(Duration::from_millis(200), send).await.is_err() {
                filled = true;
                break;
            }
        }
        assert!(filled, "write queue never filled");

        tokio::time::timeout(Duration::from_secs(5), client.disconnect())
            .await
            .expect("disconnect blocked on a stalled server")
            .unwrap();
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (_manager, addr) = running_manager().await;

        let client = local_client();
        client.connect(addr).await.unwrap();
        assert!(matches!(
            client.connect(addr).await,
            Err(ClientError::AlreadyConnected)
        ));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_command_reaches_client() {
        let (manager, addr) = running_manager().await;
        let mut events = manager.subscribe();

        let mut client = local_client();
        let mut client_events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();

        let peer = loop {
            if let ManagerEvent::ClientConnected { addr } = events.recv().await.unwrap() {
                break addr;
            }
        };
        let command = Command::new("board", "notify_var", "battery", 7);
        assert!(manager.send_command(&command, peer).await);

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ClientEvent::CommandReceived { command }) = client_events.recv().await {
                    break command;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, command);

        client.disconnect().await.unwrap();
    }
}
