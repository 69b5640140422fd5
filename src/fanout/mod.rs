//! Message fan-out: the send state machine and everything it talks to.
//!
//! A send persists the message, then replicates its effects into every
//! member's mailbox, link rows and unread counter, and finally pushes it to
//! connected members. Only the first step can fail the send.

pub mod broadcaster;
pub mod hub;
pub mod orchestrator;
pub mod sink;

pub use broadcaster::Broadcaster;
pub use hub::{Push, SessionHub};
pub use orchestrator::{FanoutOutcome, InboxEntry, Orchestrator, OrchestratorBuilder};
pub use sink::{FanoutSink, FanoutStep, LogSink, RecordingSink, SendState, SinkEvent};

use serde_json::Value;

use crate::errors::PushError;

/// Default per-user topic new messages are pushed on.
pub const MESSAGES_TOPIC: &str = "/queue/messages";

/// Addressing for a member's private real-time channel. Implementations must
/// return promptly; a member that cannot take the push right now is an `Err`,
/// not a wait.
pub trait PushChannel: Send + Sync {
    fn push_to_user(&self, user_id: &str, topic: &str, payload: &Value) -> Result<(), PushError>;
}
