//! The send state machine and the conversation commands built on the same
//! collections.
//!
//! `Received → Persisted → MailboxesResolved → CountersUpdated → Broadcast →
//! Complete`. Only the append to the message log can fail a send. After that
//! every step runs to the end for every member; per-member failures are
//! reported to the [`FanoutSink`] and absorbed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};

use super::{Broadcaster, FanoutSink, FanoutStep, LogSink, PushChannel, SendState, MESSAGES_TOPIC};
use crate::errors::{ConversationError, PersistenceError};
use crate::logutil::preview_body;
use crate::storage::{
    ChatStore, CreditGuard, MailboxDirectory, MailboxLinks, MessageLog, ReadLedger, RoomDirectory,
};
use crate::tasks::{Notifier, TaskHandle};
use crate::types::{Mailbox, Message, MessageDraft, Room};
use crate::validation::{validate_body, validate_id};

/// Default cap on message bodies in bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4096;

/// What one fan-out pass touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutOutcome {
    /// Members whose mailbox was resolved.
    pub mailboxes: usize,
    /// Members whose unread counter was credited in this pass.
    pub credited: usize,
    /// Absorbed per-member or room-level failures.
    pub degraded: usize,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxEntry {
    pub mailbox: Mailbox,
    pub unread_count: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// First delivery right after persisting.
    Initial,
    /// Reconciliation of an already delivered message.
    Repair,
}

pub struct OrchestratorBuilder {
    messages: Arc<dyn MessageLog>,
    mailboxes: Arc<dyn MailboxDirectory>,
    links: Arc<dyn MailboxLinks>,
    ledger: Arc<dyn ReadLedger>,
    rooms: Arc<dyn RoomDirectory>,
    credits: Arc<dyn CreditGuard>,
    push: Arc<dyn PushChannel>,
    sink: Arc<dyn FanoutSink>,
    topic: String,
    max_body_bytes: usize,
    notifications: Option<(TaskHandle, Arc<dyn Notifier>)>,
}

impl OrchestratorBuilder {
    /// Start from the sled collections of `store`; any of them can be
    /// replaced before `build`.
    pub fn new(store: &ChatStore, push: Arc<dyn PushChannel>) -> Self {
        Self {
            messages: Arc::new(store.messages()),
            mailboxes: Arc::new(store.mailboxes()),
            links: Arc::new(store.links()),
            ledger: Arc::new(store.read_tracking()),
            rooms: Arc::new(store.rooms()),
            credits: Arc::new(store.credits()),
            push,
            sink: Arc::new(LogSink),
            topic: MESSAGES_TOPIC.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            notifications: None,
        }
    }

    pub fn sink(mut self, sink: Arc<dyn FanoutSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn message_log(mut self, messages: Arc<dyn MessageLog>) -> Self {
        self.messages = messages;
        self
    }

    pub fn mailboxes(mut self, mailboxes: Arc<dyn MailboxDirectory>) -> Self {
        self.mailboxes = mailboxes;
        self
    }

    pub fn links(mut self, links: Arc<dyn MailboxLinks>) -> Self {
        self.links = links;
        self
    }

    pub fn read_ledger(mut self, ledger: Arc<dyn ReadLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn rooms(mut self, rooms: Arc<dyn RoomDirectory>) -> Self {
        self.rooms = rooms;
        self
    }

    pub fn credits(mut self, credits: Arc<dyn CreditGuard>) -> Self {
        self.credits = credits;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Hand one notification task per completed send to `tasks`.
    pub fn notifier(mut self, tasks: TaskHandle, notifier: Arc<dyn Notifier>) -> Self {
        self.notifications = Some((tasks, notifier));
        self
    }

    pub fn build(self) -> Orchestrator {
        let broadcaster = Broadcaster::new(self.push, Arc::clone(&self.sink)).with_topic(self.topic);
        Orchestrator {
            messages: self.messages,
            mailboxes: self.mailboxes,
            links: self.links,
            ledger: self.ledger,
            rooms: self.rooms,
            credits: self.credits,
            sink: self.sink,
            broadcaster,
            max_body_bytes: self.max_body_bytes,
            notifications: self.notifications,
        }
    }
}

pub struct Orchestrator {
    messages: Arc<dyn MessageLog>,
    mailboxes: Arc<dyn MailboxDirectory>,
    links: Arc<dyn MailboxLinks>,
    ledger: Arc<dyn ReadLedger>,
    rooms: Arc<dyn RoomDirectory>,
    credits: Arc<dyn CreditGuard>,
    sink: Arc<dyn FanoutSink>,
    broadcaster: Broadcaster,
    max_body_bytes: usize,
    notifications: Option<(TaskHandle, Arc<dyn Notifier>)>,
}

impl Orchestrator {
    pub fn builder(store: &ChatStore, push: Arc<dyn PushChannel>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, push)
    }

    /// Send on behalf of `sender_id` to the members of the `room` snapshot.
    /// Fails only when the message could not be persisted.
    pub fn send_message(
        &self,
        draft: &MessageDraft,
        room: &Room,
        sender_id: &str,
    ) -> Result<Message, PersistenceError> {
        self.send(draft, room, Some(sender_id))
    }

    /// Same path as [`Self::send_message`] with no sender: every member is
    /// credited and nobody's read position moves.
    pub fn send_system_message(&self, draft: &MessageDraft, room: &Room) -> Result<Message, PersistenceError> {
        self.send(draft, room, None)
    }

    /// Take the membership snapshot from the room directory, then send.
    pub fn send_to_room(
        &self,
        draft: &MessageDraft,
        room_id: &str,
        sender_id: &str,
    ) -> Result<Message, PersistenceError> {
        let room = match self.rooms.snapshot(room_id) {
            Ok(room) => room,
            Err(e) => {
                self.sink.aborted(room_id, &e);
                return Err(e);
            }
        };
        self.send_message(draft, &room, sender_id)
    }

    /// Re-run mailbox resolution, linkage and unread crediting for a stored
    /// message. Only the members the message was sent to are considered, minus
    /// anyone who has left the room since. Members already credited for the
    /// message are not credited again, and members who cleared the
    /// conversation after the message was sent are left alone.
    pub fn redeliver(&self, message_id: &str) -> Result<FanoutOutcome, PersistenceError> {
        let message = self.messages.get(message_id)?;
        let room = self.rooms.snapshot(&message.room_id)?;
        let recipients: Vec<String> = message
            .recipients
            .iter()
            .filter(|user_id| room.is_member(user_id))
            .cloned()
            .collect();
        let outcome = self.fan_out(&message, &recipients, Pass::Repair);
        info!(
            "redelivered message id={} room={}: recipients={} mailboxes={} credited={} degraded={}",
            message.id,
            room.id,
            recipients.len(),
            outcome.mailboxes,
            outcome.credited,
            outcome.degraded
        );
        Ok(outcome)
    }

    fn send(
        &self,
        draft: &MessageDraft,
        room: &Room,
        sender_id: Option<&str>,
    ) -> Result<Message, PersistenceError> {
        self.sink.state_changed(&room.id, None, SendState::Received);
        if let Err(e) = self.check_send(draft, room, sender_id) {
            self.sink.aborted(&room.id, &e);
            return Err(e);
        }
        let message = match self.messages.append(&room.id, sender_id, &room.member_ids(), draft) {
            Ok(message) => message,
            Err(e) => {
                self.sink.aborted(&room.id, &e);
                return Err(e);
            }
        };
        self.sink
            .state_changed(&room.id, Some(message.id.as_str()), SendState::Persisted);
        debug!(
            "persisted message id={} room={} sender={} body=\"{}\"",
            message.id,
            room.id,
            sender_id.unwrap_or("<system>"),
            preview_body(&message.body)
        );

        let outcome = self.fan_out(&message, &message.recipients, Pass::Initial);
        if outcome.degraded > 0 {
            info!(
                "message id={} delivered with {} degraded step(s)",
                message.id, outcome.degraded
            );
        }
        Ok(message)
    }

    fn check_send(
        &self,
        draft: &MessageDraft,
        room: &Room,
        sender_id: Option<&str>,
    ) -> Result<(), PersistenceError> {
        validate_id("room_id", &room.id)?;
        for member in &room.members {
            validate_id("member_id", &member.user_id)?;
        }
        validate_body(&draft.body, self.max_body_bytes)?;
        if let Some(sender_id) = sender_id {
            validate_id("sender_id", sender_id)?;
            if !room.is_member(sender_id) {
                return Err(PersistenceError::Invalid(format!(
                    "{} is not a member of room {}",
                    sender_id, room.id
                )));
            }
        }
        Ok(())
    }

    fn fan_out(&self, message: &Message, members: &[String], pass: Pass) -> FanoutOutcome {
        let room_id = message.room_id.as_str();
        let sender_id = message.sender_id.as_deref();
        let mut outcome = FanoutOutcome::default();

        // Mailbox before link, per member; members are independent.
        let mut counted = Vec::with_capacity(members.len());
        for user_id in members {
            match self.resolve_mailbox(user_id, message, pass) {
                Ok(Some(mailbox)) => {
                    outcome.mailboxes += 1;
                    if let Err(e) = self.links.link(&mailbox.id, &message.id, message.created_at) {
                        outcome.degraded += 1;
                        self.sink
                            .degraded(FanoutStep::Link, Some(user_id.as_str()), &message.id, &e);
                    }
                    counted.push(user_id.clone());
                }
                Ok(None) => {
                    trace!(
                        "skip cleared mailbox user={} room={} message={}",
                        user_id,
                        room_id,
                        message.id
                    );
                }
                Err(e) => {
                    outcome.degraded += 1;
                    self.sink
                        .degraded(FanoutStep::ResolveMailbox, Some(user_id.as_str()), &message.id, &e);
                    // A repair cannot tell whether the member cleared since.
                    if pass == Pass::Initial {
                        counted.push(user_id.clone());
                    }
                }
            }
        }
        self.report(pass, message, SendState::MailboxesResolved);

        if pass == Pass::Initial {
            if let Err(e) = self.rooms.touch_last_activity(room_id, message.created_at) {
                outcome.degraded += 1;
                self.sink
                    .degraded(FanoutStep::TouchRoom, None, &message.id, &e);
            }
        }

        let credited = self.claim_credits(message, &counted, &mut outcome);
        let failures = self
            .ledger
            .increment_unread_excluding(room_id, &message.id, &credited, sender_id);
        outcome.credited = credited.len().saturating_sub(failures.len());
        for (user_id, e) in failures {
            outcome.degraded += 1;
            if let Err(release) = self.credits.release(room_id, &user_id, &message.id) {
                warn!(
                    "credit release failed room={} user={} message={}: {}",
                    room_id, user_id, message.id, release
                );
            }
            self.sink
                .degraded(FanoutStep::IncrementUnread, Some(user_id.as_str()), &message.id, &e);
        }
        // The sender ends at zero even when an earlier step touched their entry.
        if pass == Pass::Initial {
            if let Some(sender_id) = sender_id {
                if let Err(e) = self
                    .ledger
                    .update_read_position(sender_id, room_id, &message.id)
                {
                    outcome.degraded += 1;
                    self.sink
                        .degraded(FanoutStep::UpdateReadPosition, Some(sender_id), &message.id, &e);
                }
            }
        }
        self.report(pass, message, SendState::CountersUpdated);

        if pass == Pass::Initial {
            self.broadcaster.deliver(message, members);
            self.report(pass, message, SendState::Broadcast);
            self.submit_notification(message, members);
        }
        self.report(pass, message, SendState::Complete);
        outcome
    }

    fn report(&self, pass: Pass, message: &Message, state: SendState) {
        if pass == Pass::Initial {
            self.sink
                .state_changed(&message.room_id, Some(message.id.as_str()), state);
        }
    }

    /// `None` when a repair must leave the member alone: their mailbox was
    /// cleared after `message` was sent.
    fn resolve_mailbox(
        &self,
        user_id: &str,
        message: &Message,
        pass: Pass,
    ) -> Result<Option<Mailbox>, PersistenceError> {
        let room_id = message.room_id.as_str();
        if pass == Pass::Repair {
            if let Some(mailbox) = self.mailboxes.find(user_id, room_id)? {
                if message.cleared_by(mailbox.cleared_at) {
                    return Ok(None);
                }
            }
        }
        self.mailboxes.ensure_mailbox(user_id, room_id).map(Some)
    }

    /// Members whose unread counter should move for `message`. A member is
    /// credited at most once per message across sends and redeliveries; a
    /// member whose claim cannot be recorded is not credited and waits for a
    /// redelivery.
    fn claim_credits(&self, message: &Message, members: &[String], outcome: &mut FanoutOutcome) -> Vec<String> {
        let sender_id = message.sender_id.as_deref();
        let mut credited = Vec::with_capacity(members.len());
        for user_id in members {
            if Some(user_id.as_str()) == sender_id {
                continue;
            }
            match self.credits.claim(&message.room_id, user_id, &message.id) {
                Ok(true) => credited.push(user_id.clone()),
                Ok(false) => trace!(
                    "unread already credited user={} message={}",
                    user_id,
                    message.id
                ),
                Err(e) => {
                    outcome.degraded += 1;
                    self.sink
                        .degraded(FanoutStep::CreditClaim, Some(user_id.as_str()), &message.id, &e);
                }
            }
        }
        credited
    }

    fn submit_notification(&self, message: &Message, members: &[String]) {
        let Some((tasks, notifier)) = &self.notifications else {
            return;
        };
        let recipients: Vec<String> = members
            .iter()
            .filter(|user_id| Some(user_id.as_str()) != message.sender_id.as_deref())
            .cloned()
            .collect();
        if recipients.is_empty() {
            return;
        }
        let notifier = Arc::clone(notifier);
        let payload = message.clone();
        if !tasks.submit("notify", move || notifier.notify(&payload, &recipients)) {
            let e = PersistenceError::Unavailable("task queue stopped".to_string());
            self.sink
                .degraded(FanoutStep::Notify, None, &message.id, &e);
        }
    }

    // Conversation queries and commands.

    /// Non-empty mailboxes of a user, most recent room activity first.
    pub fn mailboxes_for_user(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<InboxEntry>, PersistenceError> {
        validate_id("user_id", user_id)?;
        let mut entries = Vec::new();
        for mailbox in self.mailboxes.list_for_user(user_id)? {
            if mailbox.empty {
                continue;
            }
            let last_activity = match self.rooms.snapshot(&mailbox.room_id) {
                Ok(room) => room.last_activity,
                Err(PersistenceError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            let unread_count = self
                .ledger
                .get(&mailbox.room_id, user_id)?
                .map(|entry| entry.unread_count)
                .unwrap_or(0);
            entries.push(InboxEntry {
                mailbox,
                unread_count,
                last_activity,
            });
        }
        entries.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.mailbox.room_id.cmp(&b.mailbox.room_id))
        });
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    /// Messages linked to the caller's mailbox, newest first. A cleared
    /// mailbox has no history, whatever link rows are left over.
    pub fn history(
        &self,
        mailbox_id: &str,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, ConversationError> {
        let mailbox = self.owned_mailbox(mailbox_id, user_id)?;
        if mailbox.empty {
            return Ok(Vec::new());
        }
        let links = self.links.list_for_mailbox(mailbox_id, offset, limit)?;
        let mut messages = Vec::with_capacity(links.len());
        for link in links {
            match self.messages.get(&link.message_id) {
                Ok(message) => messages.push(message),
                Err(PersistenceError::NotFound(_)) => {
                    warn!(
                        "mailbox {} links missing message {}",
                        mailbox_id, link.message_id
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(messages)
    }

    /// Clear a conversation for its owner: flag the mailbox, drop its link
    /// rows, zero the counter. The three writes are independent; readers treat
    /// the flagged mailbox as empty from the first one on. Returns the number
    /// of links removed.
    pub fn clear_mailbox(&self, mailbox_id: &str, user_id: &str) -> Result<usize, ConversationError> {
        let mailbox = self.owned_mailbox(mailbox_id, user_id)?;
        self.mailboxes.mark_deleted(mailbox_id)?;
        let removed = self.links.delete_all_for_mailbox(mailbox_id)?;
        self.ledger.reset_to_zero(&mailbox.room_id, user_id)?;
        if let Some(cleared_at) = self.mailboxes.get(mailbox_id)?.cleared_at {
            let dropped = self.credits.forget_member(&mailbox.room_id, user_id, cleared_at)?;
            trace!("dropped {} credit keys for {} in {}", dropped, user_id, mailbox.room_id);
        }
        info!(
            "mailbox {} of {} cleared in room {} ({} links removed)",
            mailbox_id, user_id, mailbox.room_id, removed
        );
        Ok(removed)
    }

    /// Move a member's read pointer to `message_id` and zero their counter.
    pub fn mark_read(&self, user_id: &str, room_id: &str, message_id: &str) -> Result<(), ConversationError> {
        let message = self.messages.get(message_id)?;
        if message.room_id != room_id {
            return Err(ConversationError::Room {
                room_id: room_id.to_string(),
                reason: format!("message {} belongs to another room", message_id),
            });
        }
        let room = self.rooms.snapshot(room_id)?;
        if !room.is_member(user_id) {
            return Err(ConversationError::Room {
                room_id: room_id.to_string(),
                reason: format!("{} is not a member", user_id),
            });
        }
        self.ledger.update_read_position(user_id, room_id, message_id)?;
        Ok(())
    }

    pub fn unread_count(&self, room_id: &str, user_id: &str) -> Result<u32, PersistenceError> {
        Ok(self
            .ledger
            .get(room_id, user_id)?
            .map(|entry| entry.unread_count)
            .unwrap_or(0))
    }

    pub fn last_message(&self, room_id: &str) -> Result<Option<Message>, PersistenceError> {
        self.messages.last_in_room(room_id)
    }

    /// Messages in the room after the member's read pointer. Unlike the unread
    /// counter this is derived from the log and includes the member's own
    /// messages sent after the pointer.
    pub fn count_new_messages(&self, room_id: &str, user_id: &str) -> Result<usize, PersistenceError> {
        let pointer = self
            .ledger
            .get(room_id, user_id)?
            .and_then(|entry| entry.last_read_message_id);
        self.messages.count_after(room_id, pointer.as_deref())
    }

    /// Room-level history for a current member, newest first. Independent of
    /// the member's mailbox, so it still shows messages whose link is missing.
    pub fn room_messages(
        &self,
        room_id: &str,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, ConversationError> {
        let room = self.rooms.snapshot(room_id)?;
        if !room.is_member(user_id) {
            return Err(ConversationError::Room {
                room_id: room_id.to_string(),
                reason: format!("{} is not a member", user_id),
            });
        }
        Ok(self.messages.list_room(room_id, offset, limit)?)
    }

    fn owned_mailbox(&self, mailbox_id: &str, user_id: &str) -> Result<Mailbox, ConversationError> {
        let mailbox = self.mailboxes.get(mailbox_id)?;
        if mailbox.user_id != user_id {
            return Err(ConversationError::NotOwner {
                mailbox_id: mailbox_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(mailbox)
    }
}
