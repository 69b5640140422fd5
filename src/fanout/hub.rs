//! In-process real-time channels, one bounded mpsc queue per connected user.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::PushChannel;
use crate::errors::PushError;

/// One item handed to a connected user.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub topic: String,
    pub payload: Value,
}

/// Registry of connected users. Pushing never waits: a full or missing
/// channel is reported immediately.
pub struct SessionHub {
    capacity: usize,
    channels: RwLock<HashMap<String, mpsc::Sender<Push>>>,
}

impl SessionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open a channel for `user_id`, replacing any previous one.
    pub fn connect(&self, user_id: &str) -> mpsc::Receiver<Push> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id.to_string(), tx);
        rx
    }

    pub fn disconnect(&self, user_id: &str) {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(user_id);
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    #[cfg(test)]
    fn connected_users(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl PushChannel for SessionHub {
    fn push_to_user(&self, user_id: &str, topic: &str, payload: &Value) -> Result<(), PushError> {
        let sender = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .cloned();
        let Some(sender) = sender else {
            return Err(PushError::Offline(user_id.to_string()));
        };
        let push = Push {
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        match sender.try_send(push) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PushError::Backlogged(user_id.to_string())),
            Err(TrySendError::Closed(_)) => {
                // Receiver went away without disconnecting; forget it.
                self.disconnect(user_id);
                Err(PushError::Closed(user_id.to_string()))
            }
        }
    }
}
