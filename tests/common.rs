//! Test utilities & fixtures.
//! A throwaway store per test plus wrappers that make one collection fail on demand.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use roomcast::errors::PersistenceError;
use roomcast::fanout::{Orchestrator, OrchestratorBuilder, RecordingSink, SessionHub};
use roomcast::storage::{
    ChatStore, ChatStoreBuilder, CreditGuard, MailboxDirectory, MailboxLinks, MessageLog,
    ReadLedger, SledCreditGuard, SledMailboxDirectory, SledMailboxLinks, SledReadLedger,
};
use roomcast::types::{Mailbox, MailboxLink, Message, MessageDraft, ReadTracking, Room};
use tempfile::TempDir;

pub struct Harness {
    _dir: TempDir,
    pub store: ChatStore,
    pub sink: Arc<RecordingSink>,
    pub hub: Arc<SessionHub>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path())
            .flush_on_write(false)
            .open()
            .expect("store");
        Self {
            _dir: dir,
            store,
            sink: Arc::new(RecordingSink::new()),
            hub: Arc::new(SessionHub::new(16)),
        }
    }

    pub fn builder(&self) -> OrchestratorBuilder {
        Orchestrator::builder(&self.store, self.hub.clone()).sink(self.sink.clone())
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.builder().build()
    }

    /// Group room created by the first user with everyone else as members.
    pub fn room(&self, users: &[&str]) -> Room {
        let (creator, rest) = users.split_first().expect("at least one user");
        let rest: Vec<String> = rest.iter().map(|u| u.to_string()).collect();
        self.store.rooms().create_group(creator, &rest).expect("room")
    }

    pub fn mailbox(&self, user_id: &str, room_id: &str) -> Mailbox {
        self.store
            .mailboxes()
            .find(user_id, room_id)
            .expect("find")
            .expect("mailbox exists")
    }

    /// Message ids linked to a user's mailbox, newest first.
    pub fn linked(&self, user_id: &str, room_id: &str) -> Vec<String> {
        let mailbox = self.mailbox(user_id, room_id);
        self.store
            .links()
            .list_for_mailbox(&mailbox.id, 0, 10_000)
            .expect("links")
            .into_iter()
            .map(|link| link.message_id)
            .collect()
    }

    pub fn unread(&self, user_id: &str, room_id: &str) -> u32 {
        self.store
            .read_tracking()
            .get(room_id, user_id)
            .expect("ledger")
            .map(|entry| entry.unread_count)
            .unwrap_or(0)
    }
}

pub fn draft(body: &str) -> MessageDraft {
    MessageDraft::new(body)
}

pub fn sorted(mut users: Vec<String>) -> Vec<String> {
    users.sort();
    users
}

fn outage(what: &str, key: &str) -> PersistenceError {
    PersistenceError::Unavailable(format!("injected {} failure for {}", what, key))
}

fn contains(set: &Mutex<HashSet<String>>, key: &str) -> bool {
    set.lock().unwrap().contains(key)
}

/// Link store that refuses writes for selected mailboxes.
pub struct FlakyLinks {
    inner: SledMailboxLinks,
    failing: Mutex<HashSet<String>>,
}

impl FlakyLinks {
    pub fn new(inner: SledMailboxLinks) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, mailbox_id: &str) {
        self.failing.lock().unwrap().insert(mailbox_id.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

impl MailboxLinks for FlakyLinks {
    fn link(&self, mailbox_id: &str, message_id: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        if contains(&self.failing, mailbox_id) {
            return Err(outage("link", mailbox_id));
        }
        self.inner.link(mailbox_id, message_id, at)
    }

    fn delete_all_for_mailbox(&self, mailbox_id: &str) -> Result<usize, PersistenceError> {
        self.inner.delete_all_for_mailbox(mailbox_id)
    }

    fn list_for_mailbox(&self, mailbox_id: &str, offset: usize, limit: usize) -> Result<Vec<MailboxLink>, PersistenceError> {
        self.inner.list_for_mailbox(mailbox_id, offset, limit)
    }
}

/// Ledger whose increments fail for selected users.
pub struct FlakyLedger {
    inner: SledReadLedger,
    failing: Mutex<HashSet<String>>,
}

impl FlakyLedger {
    pub fn new(inner: SledReadLedger) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, user_id: &str) {
        self.failing.lock().unwrap().insert(user_id.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

impl ReadLedger for FlakyLedger {
    fn increment_unread(&self, room_id: &str, user_id: &str) -> Result<u32, PersistenceError> {
        if contains(&self.failing, user_id) {
            return Err(outage("increment", user_id));
        }
        self.inner.increment_unread(room_id, user_id)
    }

    fn update_read_position(&self, user_id: &str, room_id: &str, message_id: &str) -> Result<(), PersistenceError> {
        self.inner.update_read_position(user_id, room_id, message_id)
    }

    fn reset_to_zero(&self, room_id: &str, user_id: &str) -> Result<(), PersistenceError> {
        self.inner.reset_to_zero(room_id, user_id)
    }

    fn get(&self, room_id: &str, user_id: &str) -> Result<Option<ReadTracking>, PersistenceError> {
        self.inner.get(room_id, user_id)
    }
}

/// Mailbox directory that cannot resolve mailboxes for selected users.
pub struct FlakyMailboxes {
    inner: SledMailboxDirectory,
    failing: Mutex<HashSet<String>>,
}

impl FlakyMailboxes {
    pub fn new(inner: SledMailboxDirectory) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, user_id: &str) {
        self.failing.lock().unwrap().insert(user_id.to_string());
    }
}

impl MailboxDirectory for FlakyMailboxes {
    fn ensure_mailbox(&self, user_id: &str, room_id: &str) -> Result<Mailbox, PersistenceError> {
        if contains(&self.failing, user_id) {
            return Err(outage("mailbox", user_id));
        }
        self.inner.ensure_mailbox(user_id, room_id)
    }

    fn mark_deleted(&self, mailbox_id: &str) -> Result<(), PersistenceError> {
        self.inner.mark_deleted(mailbox_id)
    }

    fn get(&self, mailbox_id: &str) -> Result<Mailbox, PersistenceError> {
        self.inner.get(mailbox_id)
    }

    fn find(&self, user_id: &str, room_id: &str) -> Result<Option<Mailbox>, PersistenceError> {
        self.inner.find(user_id, room_id)
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Mailbox>, PersistenceError> {
        self.inner.list_for_user(user_id)
    }
}

/// Message log that is down.
pub struct DownMessageLog;

impl MessageLog for DownMessageLog {
    fn append(
        &self,
        room_id: &str,
        _sender_id: Option<&str>,
        _recipients: &[String],
        _draft: &MessageDraft,
    ) -> Result<Message, PersistenceError> {
        Err(outage("append", room_id))
    }

    fn get(&self, message_id: &str) -> Result<Message, PersistenceError> {
        Err(PersistenceError::NotFound(format!("message: {}", message_id)))
    }

    fn last_in_room(&self, _room_id: &str) -> Result<Option<Message>, PersistenceError> {
        Ok(None)
    }

    fn list_room(&self, _room_id: &str, _offset: usize, _limit: usize) -> Result<Vec<Message>, PersistenceError> {
        Ok(Vec::new())
    }

    fn count_after(&self, _room_id: &str, _message_id: Option<&str>) -> Result<usize, PersistenceError> {
        Ok(0)
    }
}

/// Credit guard whose claims fail for selected users.
pub struct FlakyCredits {
    inner: SledCreditGuard,
    failing: Mutex<HashSet<String>>,
}

impl FlakyCredits {
    pub fn new(inner: SledCreditGuard) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, user_id: &str) {
        self.failing.lock().unwrap().insert(user_id.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

impl CreditGuard for FlakyCredits {
    fn claim(&self, room_id: &str, user_id: &str, message_id: &str) -> Result<bool, PersistenceError> {
        if contains(&self.failing, user_id) {
            return Err(outage("credit claim", user_id));
        }
        self.inner.claim(room_id, user_id, message_id)
    }

    fn release(&self, room_id: &str, user_id: &str, message_id: &str) -> Result<(), PersistenceError> {
        self.inner.release(room_id, user_id, message_id)
    }

    fn forget_member(&self, room_id: &str, user_id: &str, up_to: DateTime<Utc>) -> Result<usize, PersistenceError> {
        self.inner.forget_member(room_id, user_id, up_to)
    }
}
