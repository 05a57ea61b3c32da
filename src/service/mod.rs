//! Shared variable service
//!
//! Answers the built-in shared variable commands on behalf of a connection
//! manager and forwards write notifications to subscribed modules.
//!
//! Command parameters:
//! - `alive`
//! - `create_var TYPE NAME [WRITER ...]`, `TYPE[]` or `TYPE[N]` for arrays
//! - `write_var NAME VALUE`
//! - `read_var NAME`
//! - `subscribe_var NAME [write_any|write_others|write_module:MODULE] [notify|content] [=VALUE]`
//! - `unsubscribe_var NAME`
//!
//! Subscribers receive `notify_var NAME WRITER [VALUE]` commands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::network::{Connector, ManagerEvent};
use crate::protocol::{Command, Response};
use crate::shared_var::{
    NotificationSink, ReportKind, SharedVarError, SharedVariableInfo, SharedVariableRegistry,
    SharedVariableSubscriptionInfo, SubscriptionKind, SubscriptionNotification, VariableWrite,
    WriterPolicy,
};

/// Name of the command sent to subscribers after a write
pub const NOTIFY_COMMAND: &str = "notify_var";

/// Errors reported back to the module that issued a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    SharedVar(#[from] SharedVarError),

    #[error("Invalid parameters for {command}: {reason}")]
    InvalidParams {
        command: &'static str,
        reason: String,
    },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

fn invalid(command: &'static str, reason: impl Into<String>) -> ServiceError {
    ServiceError::InvalidParams {
        command,
        reason: reason.into(),
    }
}

/// Shared variable host for the modules connected to one manager
pub struct VariableService {
    module_name: String,
    registry: SharedVariableRegistry,
    values: RwLock<HashMap<String, String>>,
    /// Last endpoint each module sent a command from
    modules: RwLock<HashMap<String, SocketAddr>>,
    next_id: AtomicU32,
}

impl VariableService {
    pub fn new(module_name: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            module_name: module_name.into(),
            registry: SharedVariableRegistry::new(sink),
            values: RwLock::new(HashMap::new()),
            modules: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn registry(&self) -> &SharedVariableRegistry {
        &self.registry
    }

    /// Current content of a variable, if it was ever written
    pub async fn value(&self, name: &str) -> Option<String> {
        self.values.read().await.get(name).cloned()
    }

    /// Endpoint a module was last seen on
    pub async fn endpoint_of(&self, module: &str) -> Option<SocketAddr> {
        self.modules.read().await.get(module).copied()
    }

    /// React to a connection manager event
    pub async fn handle_event(&self, connector: &dyn Connector, event: &ManagerEvent) {
        match event {
            ManagerEvent::CommandReceived { addr, command } => {
                let response = self.handle_command(*addr, command).await;
                if !connector.send_response(&response, *addr).await {
                    tracing::warn!("Could not answer {} from {}", command.name(), addr);
                }
            }
            ManagerEvent::ResponseReceived { addr, response } => {
                if response.name() == NOTIFY_COMMAND && !response.success() {
                    tracing::debug!("{} rejected notification @{}", addr, response.id());
                }
            }
            ManagerEvent::ClientDisconnected { addr, .. } => {
                self.forget_endpoint(*addr).await;
            }
            _ => {}
        }
    }

    /// Execute one command and build its response
    pub async fn handle_command(&self, from: SocketAddr, command: &Command) -> Response {
        self.modules
            .write()
            .await
            .insert(command.source().to_string(), from);

        let result = match command.name() {
            "alive" => Ok(String::new()),
            "create_var" => self.create_var(command.params()).await,
            "write_var" => self.write_var(command.source(), command.params()).await,
            "read_var" => self.read_var(command.params()).await,
            "subscribe_var" => self.subscribe_var(command.source(), command.params()).await,
            "unsubscribe_var" => self.unsubscribe_var(command.source(), command.params()).await,
            other => Err(ServiceError::UnknownCommand(other.to_string())),
        };

        match result {
            Ok(params) => Response::for_command(command, self.module_name.as_str(), true, params),
            Err(e) => {
                tracing::debug!("{} from {} failed: {}", command.name(), command.source(), e);
                Response::for_command(command, self.module_name.as_str(), false, e.to_string())
            }
        }
    }

    /// Drop every module seen on `addr` together with its subscriptions
    pub async fn forget_endpoint(&self, addr: SocketAddr) -> usize {
        let gone: Vec<String> = {
            let mut modules = self.modules.write().await;
            let gone: Vec<String> = modules
                .iter()
                .filter(|(_, endpoint)| **endpoint == addr)
                .map(|(module, _)| module.clone())
                .collect();
            for module in &gone {
                modules.remove(module);
            }
            gone
        };

        let mut removed = 0;
        for module in &gone {
            removed += self.registry.unsubscribe_all(module).await;
        }
        if !gone.is_empty() {
            tracing::info!("Forgot {} ({} subscriptions removed)", gone.join(", "), removed);
        }
        removed
    }

    /// Send a notification to its subscriber; false if the module is not reachable
    pub async fn deliver(&self, connector: &dyn Connector, notification: &SubscriptionNotification) -> bool {
        let Some(endpoint) = self.endpoint_of(&notification.subscriber).await else {
            tracing::debug!(
                "No endpoint for subscriber {} of '{}'",
                notification.subscriber,
                notification.variable
            );
            return false;
        };

        let mut params = format!("{} {}", notification.variable, notification.writer);
        if let Some(content) = &notification.content {
            params.push(' ');
            params.push_str(content);
        }
        let command = Command::new(
            self.module_name.as_str(),
            NOTIFY_COMMAND,
            params,
            self.next_id.fetch_add(1, Ordering::Relaxed),
        );
        connector.send_command(&command, endpoint).await
    }

    async fn create_var(&self, params: &str) -> ServiceResult<String> {
        let mut tokens = params.split_whitespace();
        let (Some(type_token), Some(name)) = (tokens.next(), tokens.next()) else {
            return Err(invalid("create_var", "expected TYPE NAME [WRITER ...]"));
        };

        let writers: Vec<String> = tokens.map(str::to_string).collect();
        let writers = if writers.is_empty() {
            WriterPolicy::Unrestricted
        } else {
            WriterPolicy::restricted_to(writers)?
        };

        let info = parse_declaration(type_token, name)?.with_writers(writers);
        self.registry.create(info).await?;
        Ok(String::new())
    }

    async fn write_var(&self, writer: &str, params: &str) -> ServiceResult<String> {
        let (name, value) = split_first(params);
        if name.is_empty() {
            return Err(invalid("write_var", "expected NAME VALUE"));
        }

        self.registry.authorize_write(name, writer).await?;
        self.values
            .write()
            .await
            .insert(name.to_string(), value.to_string());

        let notified = self
            .registry
            .notify_subscribers(name, &VariableWrite::new(writer, value))
            .await?;
        tracing::debug!("{} wrote '{}' ({} notified)", writer, name, notified);
        Ok(String::new())
    }

    async fn read_var(&self, params: &str) -> ServiceResult<String> {
        let name = params.trim();
        if !self.registry.contains(name).await {
            return Err(SharedVarError::UnknownVariable(name.to_string()).into());
        }
        Ok(self.value(name).await.unwrap_or_default())
    }

    async fn subscribe_var(&self, subscriber: &str, params: &str) -> ServiceResult<String> {
        // Everything after " =" is the value to match, spaces included
        let (head, value_filter) = match params.split_once(" =") {
            Some((head, value)) => (head, Some(value)),
            None => (params, None),
        };

        let mut tokens = head.split_whitespace();
        let Some(name) = tokens.next() else {
            return Err(invalid("subscribe_var", "expected NAME [KIND] [REPORT] [=VALUE]"));
        };
        let kind = match tokens.next() {
            Some(token) => parse_kind(token)?,
            None => SubscriptionKind::WriteAny,
        };
        let report = match tokens.next() {
            Some("notify") | None => ReportKind::Notify,
            Some("content") => ReportKind::SendContent,
            Some(other) => return Err(invalid("subscribe_var", format!("unknown report {:?}", other))),
        };

        let mut subscription = SharedVariableSubscriptionInfo::new(subscriber, kind, report);
        if let Some(value) = value_filter {
            subscription = subscription.with_value_filter(value);
        }
        self.registry.subscribe(name, subscription).await?;
        Ok(String::new())
    }

    async fn unsubscribe_var(&self, subscriber: &str, params: &str) -> ServiceResult<String> {
        let name = params.trim();
        let removed = self.registry.unsubscribe(name, subscriber).await?;
        Ok(removed.to_string())
    }
}

/// Split off the first whitespace-separated token
fn split_first(s: &str) -> (&str, &str) {
    s.trim_start()
        .split_once(char::is_whitespace)
        .unwrap_or((s.trim_start(), ""))
}

/// `int` is a scalar, `int[]` an unbounded array, `int[8]` an array of 8
fn parse_declaration(type_token: &str, name: &str) -> ServiceResult<SharedVariableInfo> {
    let Some((type_name, rest)) = type_token.split_once('[') else {
        return Ok(SharedVariableInfo::scalar(name, type_token));
    };

    let length = rest
        .strip_suffix(']')
        .ok_or_else(|| invalid("create_var", format!("malformed type {:?}", type_token)))?;
    if type_name.is_empty() {
        return Err(invalid("create_var", "missing type name"));
    }

    let length = if length.is_empty() {
        None
    } else {
        Some(
            length
                .parse::<usize>()
                .map_err(|_| invalid("create_var", format!("invalid length {:?}", length)))?,
        )
    };
    Ok(SharedVariableInfo::array(name, type_name, length))
}

fn parse_kind(token: &str) -> ServiceResult<SubscriptionKind> {
    match token {
        "write_any" => Ok(SubscriptionKind::WriteAny),
        "write_others" => Ok(SubscriptionKind::WriteOthers),
        _ => match token.strip_prefix("write_module:") {
            Some(module) if !module.is_empty() => Ok(SubscriptionKind::WriteModule(module.to_string())),
            _ => Err(invalid("subscribe_var", format!("unknown subscription kind {:?}", token))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    #[derive(Default)]
    struct RecordingConnector {
        commands: Mutex<Vec<(SocketAddr, Command)>>,
        responses: Mutex<Vec<(SocketAddr, Response)>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn send_command(&self, command: &Command, endpoint: SocketAddr) -> bool {
            self.commands.lock().await.push((endpoint, command.clone()));
            true
        }

        async fn send_response(&self, response: &Response, endpoint: SocketAddr) -> bool {
            self.responses.lock().await.push((endpoint, response.clone()));
            true
        }

        async fn is_connected(&self, _endpoint: SocketAddr) -> bool {
            true
        }

        async fn disconnect(&self, _endpoint: SocketAddr) -> bool {
            false
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn service() -> (VariableService, mpsc::UnboundedReceiver<SubscriptionNotification>) {
        let (tx, rx) = mpsc::unbounded_channel::<SubscriptionNotification>();
        (VariableService::new("blackboard", Arc::new(tx)), rx)
    }

    async fn run(service: &VariableService, from: u16, source: &str, name: &str, params: &str) -> Response {
        service
            .handle_command(addr(from), &Command::new(source, name, params, 1))
            .await
    }

    #[tokio::test]
    async fn test_alive_and_unknown_command() {
        let (service, _rx) = service();

        let response = run(&service, 1, "arm", "alive", "").await;
        assert!(response.success());
        assert_eq!(response.source(), "blackboard");
        assert_eq!(response.name(), "alive");

        let response = run(&service, 1, "arm", "dance", "").await;
        assert!(!response.success());
        assert_eq!(response.params(), "Unknown command: dance");
        assert_eq!(service.endpoint_of("arm").await, Some(addr(1)));
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let (service, _rx) = service();

        assert!(run(&service, 1, "nav", "create_var", "string pose nav").await.success());
        assert!(run(&service, 1, "nav", "write_var", "pose 1.0 2.5 0.3").await.success());

        let response = run(&service, 2, "ui", "read_var", "pose").await;
        assert!(response.success());
        assert_eq!(response.params(), "1.0 2.5 0.3");

        // Restricted to nav
        let response = run(&service, 2, "ui", "write_var", "pose 0 0 0").await;
        assert!(!response.success());
        assert_eq!(service.value("pose").await.as_deref(), Some("1.0 2.5 0.3"));

        let response = run(&service, 2, "ui", "read_var", "missing").await;
        assert!(!response.success());
    }

    #[tokio::test]
    async fn test_array_declarations() {
        let (service, _rx) = service();

        assert!(run(&service, 1, "laser", "create_var", "double[360] scan").await.success());
        assert!(run(&service, 1, "laser", "create_var", "byte[] image").await.success());

        let scan = service.registry().info("scan").await.unwrap();
        assert!(scan.is_array());
        assert_eq!(scan.length(), Some(360));
        assert_eq!(service.registry().info("image").await.unwrap().length(), None);

        // Same name, different shape
        assert!(!run(&service, 1, "laser", "create_var", "double[720] scan").await.success());
        assert!(!run(&service, 1, "laser", "create_var", "double[x] bad").await.success());
        assert!(!run(&service, 1, "laser", "create_var", "double").await.success());
    }

    #[tokio::test]
    async fn test_write_notifies_subscriber() {
        let (service, mut rx) = service();
        let connector = RecordingConnector::default();

        run(&service, 1, "power", "create_var", "double battery").await;
        assert!(run(&service, 2, "ui", "subscribe_var", "battery write_others content").await.success());
        run(&service, 1, "power", "write_var", "battery 11.8").await;

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.subscriber, "ui");
        assert_eq!(notification.content.as_deref(), Some("11.8"));
        assert!(rx.try_recv().is_err());

        assert!(service.deliver(&connector, &notification).await);
        let commands = connector.commands.lock().await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, addr(2));
        assert_eq!(commands[0].1.name(), NOTIFY_COMMAND);
        assert_eq!(commands[0].1.params(), "battery power 11.8");
    }

    #[tokio::test]
    async fn test_value_filtered_subscription() {
        let (service, mut rx) = service();

        run(&service, 1, "nav", "create_var", "string state").await;
        assert!(run(&service, 2, "ui", "subscribe_var", "state write_any content =goal reached").await.success());

        run(&service, 1, "nav", "write_var", "state moving").await;
        assert!(rx.try_recv().is_err());

        run(&service, 1, "nav", "write_var", "state goal reached").await;
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.subscriber, "ui");
        assert_eq!(notification.content.as_deref(), Some("goal reached"));

        // Filter without kind or report
        run(&service, 1, "nav", "create_var", "int mode").await;
        assert!(run(&service, 2, "ui", "subscribe_var", "mode =3").await.success());
        run(&service, 1, "nav", "write_var", "mode 2").await;
        assert!(rx.try_recv().is_err());
        run(&service, 1, "nav", "write_var", "mode 3").await;
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.variable, "mode");
        assert!(notification.content.is_none());
    }

    #[tokio::test]
    async fn test_invalid_subscription_params() {
        let (service, _rx) = service();
        run(&service, 1, "power", "create_var", "double battery").await;

        assert!(!run(&service, 2, "ui", "subscribe_var", "").await.success());
        assert!(!run(&service, 2, "ui", "subscribe_var", "battery sometimes").await.success());
        assert!(!run(&service, 2, "ui", "subscribe_var", "battery write_any loudly").await.success());
        assert!(!run(&service, 2, "ui", "subscribe_var", "battery write_module:").await.success());
        assert!(run(&service, 2, "ui", "subscribe_var", "battery write_module:power").await.success());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let (service, mut rx) = service();
        run(&service, 1, "power", "create_var", "double battery").await;
        run(&service, 2, "ui", "subscribe_var", "battery").await;

        let response = run(&service, 2, "ui", "unsubscribe_var", "battery").await;
        assert!(response.success());
        assert_eq!(response.params(), "1");

        run(&service, 1, "power", "write_var", "battery 11.8").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let (service, mut rx) = service();
        let connector = RecordingConnector::default();

        run(&service, 1, "power", "create_var", "double battery").await;
        run(&service, 2, "ui", "subscribe_var", "battery").await;

        service
            .handle_event(
                &connector,
                &ManagerEvent::ClientDisconnected {
                    addr: addr(2),
                    reason: "closed".to_string(),
                },
            )
            .await;

        assert_eq!(service.endpoint_of("ui").await, None);
        run(&service, 1, "power", "write_var", "battery 12.0").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_command_event_is_answered() {
        let (service, _rx) = service();
        let connector = RecordingConnector::default();

        service
            .handle_event(
                &connector,
                &ManagerEvent::CommandReceived {
                    addr: addr(5),
                    command: Command::new("arm", "alive", "", 77),
                },
            )
            .await;

        let responses = connector.responses.lock().await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, addr(5));
        assert_eq!(responses[0].1.id(), 77);
        assert!(responses[0].1.success());
    }

    #[tokio::test]
    async fn test_unknown_subscriber_is_not_delivered() {
        let (service, _rx) = service();
        let connector = RecordingConnector::default();

        let notification = SubscriptionNotification {
            subscriber: "ghost".to_string(),
            variable: "battery".to_string(),
            writer: "power".to_string(),
            report: ReportKind::Notify,
            content: None,
            time: std::time::SystemTime::now(),
        };
        assert!(!service.deliver(&connector, &notification).await);
        assert!(connector.commands.lock().await.is_empty());
    }

    #[test]
    fn test_split_first() {
        assert_eq!(split_first("pose 1 2 3"), ("pose", "1 2 3"));
        assert_eq!(split_first("  pose"), ("pose", ""));
        assert_eq!(split_first(""), ("", ""));
    }
}
