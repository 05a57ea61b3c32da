//! Shared variable registry
//!
//! Process-wide table of variable descriptors. Each variable has its own lock:
//! permission checks, subscription changes and notification fan-out on one
//! variable are serialized, while different variables never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, Mutex, RwLock};

use super::info::{ReportKind, SharedVariableInfo, SharedVariableSubscriptionInfo, VariableWrite};
use super::{SharedVarError, SharedVarResult};

/// Notice sent to a subscriber after a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionNotification {
    pub subscriber: String,
    pub variable: String,
    pub writer: String,
    pub report: ReportKind,
    /// Written value, for `ReportKind::SendContent` subscriptions
    pub content: Option<String>,
    pub time: SystemTime,
}

/// Delivers notifications to subscribers
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, notification: SubscriptionNotification);
}

impl NotificationSink for mpsc::UnboundedSender<SubscriptionNotification> {
    fn deliver(&self, notification: SubscriptionNotification) {
        if let Err(e) = self.send(notification) {
            tracing::debug!(
                "Notification for {} dropped: receiver closed",
                e.0.subscriber
            );
        }
    }
}

type Entry = Arc<Mutex<SharedVariableInfo>>;

/// Registry of shared variable descriptors
pub struct SharedVariableRegistry {
    variables: RwLock<HashMap<String, Entry>>,
    sink: Arc<dyn NotificationSink>,
}

impl SharedVariableRegistry {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            variables: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Register a variable
    ///
    /// Declaring an existing variable again with the same type and shape
    /// returns the existing descriptor untouched; a different type or shape
    /// is rejected.
    pub async fn create(&self, info: SharedVariableInfo) -> SharedVarResult<SharedVariableInfo> {
        if info.name().is_empty() || info.name().chars().any(char::is_whitespace) {
            return Err(SharedVarError::InvalidName(info.name().to_string()));
        }

        let existing = {
            let mut variables = self.variables.write().await;
            match variables.get(info.name()) {
                Some(existing) => existing.clone(),
                None => {
                    tracing::debug!(
                        "Created shared variable '{}' ({}{})",
                        info.name(),
                        info.type_name(),
                        if info.is_array() { "[]" } else { "" }
                    );
                    variables.insert(info.name().to_string(), Arc::new(Mutex::new(info.clone())));
                    return Ok(info);
                }
            }
        };

        // The map lock is released before waiting on a busy variable
        let existing = existing.lock().await;
        existing.check_fixed_fields(&info)?;
        Ok(existing.clone())
    }

    /// Snapshot of a variable's descriptor
    pub async fn info(&self, name: &str) -> SharedVarResult<SharedVariableInfo> {
        let entry = self.entry(name).await?;
        let info = entry.lock().await;
        Ok(info.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.variables.read().await.contains_key(name)
    }

    /// Names of all registered variables, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.variables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.variables.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.variables.read().await.is_empty()
    }

    /// Whether `module` may write `name`
    pub async fn can_write(&self, name: &str, module: &str) -> SharedVarResult<bool> {
        let entry = self.entry(name).await?;
        let info = entry.lock().await;
        Ok(info.allowed_writers().allows(module))
    }

    /// Like [`can_write`](Self::can_write), but a denial is an error
    pub async fn authorize_write(&self, name: &str, module: &str) -> SharedVarResult<()> {
        if self.can_write(name, module).await? {
            Ok(())
        } else {
            Err(SharedVarError::WriteDenied {
                variable: name.to_string(),
                module: module.to_string(),
            })
        }
    }

    /// Register interest in a variable, replacing an identical registration
    pub async fn subscribe(
        &self,
        name: &str,
        subscription: SharedVariableSubscriptionInfo,
    ) -> SharedVarResult<()> {
        let entry = self.entry(name).await?;
        let mut info = entry.lock().await;

        let subscriber = subscription.subscriber().to_string();
        let kind = subscription.kind().clone();
        let replaced = info.upsert_subscription(subscription);

        tracing::debug!(
            "{} subscription of '{}' to '{}' ({})",
            if replaced { "Replaced" } else { "Added" },
            subscriber,
            name,
            kind
        );
        Ok(())
    }

    /// Remove a module's subscriptions to a variable; returns how many were removed
    pub async fn unsubscribe(&self, name: &str, subscriber: &str) -> SharedVarResult<usize> {
        let entry = self.entry(name).await?;
        let removed = entry.lock().await.remove_subscriber(subscriber);
        if removed > 0 {
            tracing::debug!("Removed {} subscriptions of '{}' to '{}'", removed, subscriber, name);
        }
        Ok(removed)
    }

    /// Remove a module's subscriptions from every variable
    pub async fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let entries: Vec<Entry> = self.variables.read().await.values().cloned().collect();

        let mut removed = 0;
        for entry in entries {
            removed += entry.lock().await.remove_subscriber(subscriber);
        }
        if removed > 0 {
            tracing::debug!("Removed all {} subscriptions of '{}'", removed, subscriber);
        }
        removed
    }

    /// Tell every interested subscriber about a completed write
    ///
    /// Each subscriber gets at most one notification per write. If several of
    /// its subscriptions match, the content is included when any of them asks
    /// for it. Returns the number of notifications delivered.
    pub async fn notify_subscribers(&self, name: &str, write: &VariableWrite) -> SharedVarResult<usize> {
        let entry = self.entry(name).await?;
        let info = entry.lock().await;

        let mut recipients: Vec<(&str, ReportKind)> = Vec::new();
        for subscription in info.subscriptions().iter().filter(|s| s.matches(write)) {
            match recipients
                .iter_mut()
                .find(|(subscriber, _)| *subscriber == subscription.subscriber())
            {
                Some((_, report)) => {
                    if subscription.report() == ReportKind::SendContent {
                        *report = ReportKind::SendContent;
                    }
                }
                None => recipients.push((subscription.subscriber(), subscription.report())),
            }
        }

        for (subscriber, report) in &recipients {
            self.sink.deliver(SubscriptionNotification {
                subscriber: subscriber.to_string(),
                variable: name.to_string(),
                writer: write.writer.clone(),
                report: *report,
                content: match report {
                    ReportKind::SendContent => Some(write.value.clone()),
                    ReportKind::Notify => None,
                },
                time: write.time,
            });
        }

        Ok(recipients.len())
    }

    async fn entry(&self, name: &str) -> SharedVarResult<Entry> {
        self.variables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SharedVarError::UnknownVariable(name.to_string()))
    }
}
