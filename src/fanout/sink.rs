//! Observability sink injected into the orchestrator and broadcaster.
//!
//! Absorbed failures never reach the caller of a send; this is where they go
//! instead. [`LogSink`] is the production sink, [`RecordingSink`] keeps every
//! event in memory for tests.

use std::sync::Mutex;

use log::{debug, trace, warn};

use crate::errors::{PersistenceError, PushError};
use crate::metrics;

/// Progress of one send. `Persisted` is the point of no return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendState {
    Received,
    Persisted,
    MailboxesResolved,
    CountersUpdated,
    Broadcast,
    Complete,
}

/// Fan-out step whose failure is absorbed per member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanoutStep {
    ResolveMailbox,
    Link,
    TouchRoom,
    CreditClaim,
    IncrementUnread,
    UpdateReadPosition,
    Notify,
}

impl FanoutStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutStep::ResolveMailbox => "resolve_mailbox",
            FanoutStep::Link => "link",
            FanoutStep::TouchRoom => "touch_room",
            FanoutStep::CreditClaim => "credit_claim",
            FanoutStep::IncrementUnread => "increment_unread",
            FanoutStep::UpdateReadPosition => "update_read_position",
            FanoutStep::Notify => "notify",
        }
    }
}

pub trait FanoutSink: Send + Sync {
    /// `message_id` is `None` until the message has been persisted.
    fn state_changed(&self, room_id: &str, message_id: Option<&str>, state: SendState);

    /// A per-member (or room-level when `user_id` is `None`) failure that was
    /// absorbed so the send could continue.
    fn degraded(&self, step: FanoutStep, user_id: Option<&str>, message_id: &str, error: &PersistenceError);

    /// Outcome of one real-time push.
    fn push_attempted(&self, user_id: &str, message_id: &str, outcome: &Result<(), PushError>);

    /// The message could not be persisted; nothing was fanned out.
    fn aborted(&self, room_id: &str, error: &PersistenceError);
}

/// Writes through the `log` facade and bumps [`crate::metrics`] counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl FanoutSink for LogSink {
    fn state_changed(&self, room_id: &str, message_id: Option<&str>, state: SendState) {
        if state == SendState::Persisted {
            metrics::inc_messages_persisted();
        }
        trace!(
            "send room={} message={} state={:?}",
            room_id,
            message_id.unwrap_or("-"),
            state
        );
    }

    fn degraded(&self, step: FanoutStep, user_id: Option<&str>, message_id: &str, error: &PersistenceError) {
        metrics::record_degraded(step.as_str());
        warn!(
            "fan-out degraded step={} user={} message={}: {}",
            step.as_str(),
            user_id.unwrap_or("*"),
            message_id,
            error
        );
    }

    fn push_attempted(&self, user_id: &str, message_id: &str, outcome: &Result<(), PushError>) {
        match outcome {
            Ok(()) => {
                metrics::inc_push_delivered();
                trace!("pushed message id={} to userId={}", message_id, user_id);
            }
            Err(e) => {
                // Offline members are the normal case, not an error.
                metrics::inc_push_missed();
                debug!("push skipped message id={} userId={}: {}", message_id, user_id, e);
            }
        }
    }

    fn aborted(&self, room_id: &str, error: &PersistenceError) {
        metrics::inc_sends_aborted();
        warn!("send aborted room={}: {}", room_id, error);
    }
}

/// One captured sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    State {
        room_id: String,
        message_id: Option<String>,
        state: SendState,
    },
    Degraded {
        step: FanoutStep,
        user_id: Option<String>,
        message_id: String,
        error: String,
    },
    Push {
        user_id: String,
        message_id: String,
        delivered: bool,
    },
    Aborted {
        room_id: String,
        error: String,
    },
}

/// In-memory sink used to assert on fault isolation.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: SinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// States reported for a persisted message, in order.
    pub fn states_for(&self, message_id: &str) -> Vec<SendState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::State {
                    message_id: Some(id),
                    state,
                    ..
                } if id == message_id => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Users a push was attempted for, in attempt order.
    pub fn push_targets(&self, message_id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Push {
                    user_id,
                    message_id: id,
                    ..
                } if id == message_id => Some(user_id),
                _ => None,
            })
            .collect()
    }

    pub fn degraded_steps(&self) -> Vec<(FanoutStep, Option<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Degraded { step, user_id, .. } => Some((step, user_id)),
                _ => None,
            })
            .collect()
    }
}

impl FanoutSink for RecordingSink {
    fn state_changed(&self, room_id: &str, message_id: Option<&str>, state: SendState) {
        self.record(SinkEvent::State {
            room_id: room_id.to_string(),
            message_id: message_id.map(|s| s.to_string()),
            state,
        });
    }

    fn degraded(&self, step: FanoutStep, user_id: Option<&str>, message_id: &str, error: &PersistenceError) {
        self.record(SinkEvent::Degraded {
            step,
            user_id: user_id.map(|s| s.to_string()),
            message_id: message_id.to_string(),
            error: error.to_string(),
        });
    }

    fn push_attempted(&self, user_id: &str, message_id: &str, outcome: &Result<(), PushError>) {
        self.record(SinkEvent::Push {
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            delivered: outcome.is_ok(),
        });
    }

    fn aborted(&self, room_id: &str, error: &PersistenceError) {
        self.record(SinkEvent::Aborted {
            room_id: room_id.to_string(),
            error: error.to_string(),
        });
    }
}
