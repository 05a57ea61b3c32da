//! Command/response correlation
//!
//! Keeps the commands that are still waiting for an answer and pairs each
//! incoming response with its command by correlation id.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::{Command, CommandResponsePair, Response};

struct Pending {
    command: Command,
    waiter: Option<oneshot::Sender<CommandResponsePair>>,
}

/// Table of commands awaiting their response
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<u32, Pending>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a sent command. A command already pending under the same id
    /// is replaced.
    pub fn track(&mut self, command: Command) {
        self.insert(command, None);
    }

    /// Remember a sent command and get notified when its response arrives
    pub fn track_with_waiter(&mut self, command: Command) -> oneshot::Receiver<CommandResponsePair> {
        let (tx, rx) = oneshot::channel();
        self.insert(command, Some(tx));
        rx
    }

    fn insert(&mut self, command: Command, waiter: Option<oneshot::Sender<CommandResponsePair>>) {
        if let Some(previous) = self.pending.insert(command.id(), Pending { command, waiter }) {
            tracing::warn!(
                "Correlation id {} reused; dropping pending '{}'",
                previous.command.id(),
                previous.command.name()
            );
        }
    }

    /// Pair a response with its pending command
    ///
    /// Returns None when no command with the response's id is pending.
    pub fn resolve(&mut self, response: &Response) -> Option<CommandResponsePair> {
        let pending = self.pending.remove(&response.id())?;

        if pending.command.name() != response.name() {
            tracing::debug!(
                "Response '{}' @{} answers command '{}'",
                response.name(),
                response.id(),
                pending.command.name()
            );
        }

        let pair = CommandResponsePair::new(pending.command, response.clone());
        if let Some(waiter) = pending.waiter {
            // The waiter may have given up already
            let _ = waiter.send(pair.clone());
        }
        Some(pair)
    }

    /// Forget a pending command, e.g. after a timeout
    pub fn cancel(&mut self, id: u32) -> Option<Command> {
        self.pending.remove(&id).map(|p| p.command)
    }

    /// Drop every pending command; waiters observe a closed channel
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
