//! # Storage Module - Collection Stores
//!
//! Each collection of the chat core lives in its own sled tree and is owned by
//! exactly one component:
//!
//! ```text
//! messages / room_messages   ← Message Log (append only)
//! mailboxes / mailbox_index  ← Mailbox Directory, unique per (user, room)
//! mailbox_links              ← Mailbox-Message Linkage
//! read_tracking              ← Read-Position Ledger
//! rooms                      ← Room directory (membership snapshots)
//! fanout_credits             ← (room, user, message) dedupe keys for counters
//! ```
//!
//! There are no multi-tree transactions. Every cross-collection update is
//! either an idempotent insert-if-absent (`compare_and_swap`) or an atomic
//! counter update (`update_and_fetch`).
//!
//! The traits below are the seams the fan-out orchestrator is written
//! against, so a single collection can be swapped or wrapped (for example to
//! inject a failure) without touching the others.
//!
//! ```rust,no_run
//! use roomcast::storage::ChatStoreBuilder;
//!
//! # fn main() -> Result<(), roomcast::errors::PersistenceError> {
//! let store = ChatStoreBuilder::new("./data/roomcast").open()?;
//! let room = store.rooms().create_one_to_one("alice", "bob")?;
//! println!("room {} has {} members", room.id, room.members.len());
//! # Ok(())
//! # }
//! ```

pub mod credits;
pub mod links;
pub mod mailboxes;
pub mod messages;
pub mod read_tracking;
pub mod rooms;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use sled::IVec;

use crate::errors::PersistenceError;
use crate::types::{Mailbox, MailboxLink, Message, MessageDraft, ReadTracking, Room};

pub use credits::SledCreditGuard;
pub use links::SledMailboxLinks;
pub use mailboxes::SledMailboxDirectory;
pub use messages::SledMessageLog;
pub use read_tracking::SledReadLedger;
pub use rooms::SledRoomDirectory;

const TREE_MESSAGES: &str = "messages";
const TREE_ROOM_MESSAGES: &str = "room_messages";
const TREE_MAILBOXES: &str = "mailboxes";
const TREE_MAILBOX_INDEX: &str = "mailbox_index";
const TREE_LINKS: &str = "mailbox_links";
const TREE_READ_TRACKING: &str = "read_tracking";
const TREE_ROOMS: &str = "rooms";
const TREE_CREDITS: &str = "fanout_credits";

/// Append-only store of message records.
pub trait MessageLog: Send + Sync {
    /// Persist a new message, assigning id and creation time. `recipients`
    /// is the membership snapshot the message is delivered to.
    fn append(
        &self,
        room_id: &str,
        sender_id: Option<&str>,
        recipients: &[String],
        draft: &MessageDraft,
    ) -> Result<Message, PersistenceError>;

    fn get(&self, message_id: &str) -> Result<Message, PersistenceError>;

    /// Most recent message of a room, if any.
    fn last_in_room(&self, room_id: &str) -> Result<Option<Message>, PersistenceError>;

    /// Messages of a room, newest first.
    fn list_room(&self, room_id: &str, offset: usize, limit: usize) -> Result<Vec<Message>, PersistenceError>;

    /// Number of messages in a room created after `message_id`. With no
    /// pointer every message of the room counts.
    fn count_after(&self, room_id: &str, message_id: Option<&str>) -> Result<usize, PersistenceError>;
}

/// One mailbox per (user, room).
pub trait MailboxDirectory: Send + Sync {
    /// Look up or lazily create the mailbox for a pair, clearing `empty` on a
    /// previously cleared one. Never creates a second mailbox for a pair.
    fn ensure_mailbox(&self, user_id: &str, room_id: &str) -> Result<Mailbox, PersistenceError>;

    /// Flag a mailbox as cleared.
    fn mark_deleted(&self, mailbox_id: &str) -> Result<(), PersistenceError>;

    fn get(&self, mailbox_id: &str) -> Result<Mailbox, PersistenceError>;

    fn find(&self, user_id: &str, room_id: &str) -> Result<Option<Mailbox>, PersistenceError>;

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Mailbox>, PersistenceError>;
}

/// Join rows between mailboxes and messages.
pub trait MailboxLinks: Send + Sync {
    fn link(
        &self,
        mailbox_id: &str,
        message_id: &str,
        message_created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    /// Remove every link row of a mailbox; returns how many were removed.
    fn delete_all_for_mailbox(&self, mailbox_id: &str) -> Result<usize, PersistenceError>;

    /// Links of a mailbox, newest message first.
    fn list_for_mailbox(
        &self,
        mailbox_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MailboxLink>, PersistenceError>;
}

/// Per (room, user) read pointer and unread counter.
pub trait ReadLedger: Send + Sync {
    /// Atomically add one to a member's unread counter without moving their
    /// read pointer. Returns the new count.
    fn increment_unread(&self, room_id: &str, user_id: &str) -> Result<u32, PersistenceError>;

    /// Point the user at `message_id` and zero their counter.
    fn update_read_position(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<(), PersistenceError>;

    fn reset_to_zero(&self, room_id: &str, user_id: &str) -> Result<(), PersistenceError>;

    fn get(&self, room_id: &str, user_id: &str) -> Result<Option<ReadTracking>, PersistenceError>;

    /// Increment every listed member except `excluded_user_id`. Each member is
    /// an independent write; failures are returned per user and do not stop
    /// the remaining increments.
    fn increment_unread_excluding(
        &self,
        room_id: &str,
        message_id: &str,
        members: &[String],
        excluded_user_id: Option<&str>,
    ) -> Vec<(String, PersistenceError)> {
        let mut failures = Vec::new();
        for user_id in members {
            if Some(user_id.as_str()) == excluded_user_id {
                continue;
            }
            if let Err(e) = self.increment_unread(room_id, user_id) {
                debug!(
                    "unread increment failed room={} user={} message={}: {}",
                    room_id, user_id, message_id, e
                );
                failures.push((user_id.clone(), e));
            }
        }
        failures
    }
}

/// Room membership lookup and the room-level activity marker.
pub trait RoomDirectory: Send + Sync {
    /// Value copy of the room as it is right now.
    fn snapshot(&self, room_id: &str) -> Result<Room, PersistenceError>;

    fn touch_last_activity(&self, room_id: &str, at: DateTime<Utc>) -> Result<(), PersistenceError>;
}

/// Dedupe keys held at the orchestrator boundary so that re-delivering a
/// message never credits the same member twice.
pub trait CreditGuard: Send + Sync {
    /// Returns true when the key was not present and is now claimed.
    fn claim(&self, room_id: &str, user_id: &str, message_id: &str) -> Result<bool, PersistenceError>;

    fn release(&self, room_id: &str, user_id: &str, message_id: &str) -> Result<(), PersistenceError>;

    /// Drop a member's keys claimed at or before `up_to`. Called when the
    /// member clears the room; repairs never credit messages older than the
    /// clear, so those keys have no further use. Returns how many were dropped.
    fn forget_member(&self, room_id: &str, user_id: &str, up_to: DateTime<Utc>) -> Result<usize, PersistenceError>;
}

/// Helper builder so tests can easily create throwaway stores with custom paths.
pub struct ChatStoreBuilder {
    path: PathBuf,
    flush_on_write: bool,
    temporary: bool,
}

impl ChatStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_on_write: true,
            temporary: false,
        }
    }

    /// Skip the per-write fsync. Writes still land in sled's log and are
    /// flushed on sled's own schedule.
    pub fn flush_on_write(mut self, flush: bool) -> Self {
        self.flush_on_write = flush;
        self
    }

    /// Delete the database when the last handle is dropped.
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn open(self) -> Result<ChatStore, PersistenceError> {
        ChatStore::open_with_options(&self.path, self.flush_on_write, self.temporary)
    }
}

/// Sled-backed persistence for every collection of the chat core.
#[derive(Clone)]
pub struct ChatStore {
    db: sled::Db,
    flush_on_write: bool,
    messages: sled::Tree,
    room_messages: sled::Tree,
    mailboxes: sled::Tree,
    mailbox_index: sled::Tree,
    links: sled::Tree,
    read_tracking: sled::Tree,
    rooms: sled::Tree,
    credits: sled::Tree,
}

impl ChatStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        Self::open_with_options(path.as_ref(), true, false)
    }

    fn open_with_options(path: &Path, flush_on_write: bool, temporary: bool) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(path)?;
        let db = sled::Config::new().path(path).temporary(temporary).open()?;
        Ok(Self {
            messages: db.open_tree(TREE_MESSAGES)?,
            room_messages: db.open_tree(TREE_ROOM_MESSAGES)?,
            mailboxes: db.open_tree(TREE_MAILBOXES)?,
            mailbox_index: db.open_tree(TREE_MAILBOX_INDEX)?,
            links: db.open_tree(TREE_LINKS)?,
            read_tracking: db.open_tree(TREE_READ_TRACKING)?,
            rooms: db.open_tree(TREE_ROOMS)?,
            credits: db.open_tree(TREE_CREDITS)?,
            db,
            flush_on_write,
        })
    }

    pub fn messages(&self) -> SledMessageLog {
        SledMessageLog::new(self.messages.clone(), self.room_messages.clone(), self.flush_on_write)
    }

    pub fn mailboxes(&self) -> SledMailboxDirectory {
        SledMailboxDirectory::new(self.mailboxes.clone(), self.mailbox_index.clone(), self.flush_on_write)
    }

    pub fn links(&self) -> SledMailboxLinks {
        SledMailboxLinks::new(self.links.clone(), self.flush_on_write)
    }

    pub fn read_tracking(&self) -> SledReadLedger {
        SledReadLedger::new(self.read_tracking.clone(), self.flush_on_write)
    }

    pub fn rooms(&self) -> SledRoomDirectory {
        SledRoomDirectory::new(self.rooms.clone(), self.flush_on_write)
    }

    pub fn credits(&self) -> SledCreditGuard {
        SledCreditGuard::new(self.credits.clone(), self.flush_on_write)
    }

    /// Record counts per collection, for status output.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            messages: self.messages.len(),
            rooms: self.rooms.len(),
            mailboxes: self.mailboxes.len(),
            links: self.links.len(),
            read_tracking: self.read_tracking.len(),
        }
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub messages: usize,
    pub rooms: usize,
    pub mailboxes: usize,
    pub links: usize,
    pub read_tracking: usize,
}

static LAST_TIMESTAMP_NANOS: AtomicI64 = AtomicI64::new(0);

/// Wall clock that never hands out the same nanosecond twice in this process,
/// so timestamp-ordered keys stay unique and ordered.
pub(crate) fn next_timestamp() -> DateTime<Utc> {
    let now = Utc::now();
    let candidate = nanos_of(&now);
    let mut last = LAST_TIMESTAMP_NANOS.load(Ordering::Relaxed);
    loop {
        let next = if candidate > last { candidate } else { last + 1 };
        match LAST_TIMESTAMP_NANOS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Utc.timestamp_nanos(next),
            Err(actual) => last = actual,
        }
    }
}

pub(crate) fn nanos_of(at: &DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros() * 1000)
}

pub(crate) fn pair_key(first: &str, second: &str) -> Vec<u8> {
    format!("{}:{}", first, second).into_bytes()
}

/// `<prefix>:<zero padded nanos>:<id>` so a prefix scan yields time order.
pub(crate) fn ordered_key(prefix: &str, at: &DateTime<Utc>, id: &str) -> Vec<u8> {
    format!("{}:{:020}:{}", prefix, nanos_of(at), id).into_bytes()
}

pub(crate) fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, PersistenceError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(bytes: &IVec) -> Result<T, PersistenceError> {
    Ok(bincode::deserialize::<T>(bytes)?)
}

/// Atomic read-modify-write of one record through sled's CAS loop.
///
/// `f` sees the current decoded value and returns the replacement, or `None`
/// to leave the record as it is. It may run more than once under contention.
/// Returns the record as stored after the update.
pub(crate) fn update_record<T, F>(tree: &sled::Tree, key: &[u8], mut f: F) -> Result<Option<T>, PersistenceError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
    F: FnMut(Option<T>) -> Option<T>,
{
    let mut failure: Option<PersistenceError> = None;
    let mut stored: Option<T> = None;
    tree.update_and_fetch(key, |old: Option<&[u8]>| {
        failure = None;
        stored = None;
        let current = match old.map(|bytes| bincode::deserialize::<T>(bytes)).transpose() {
            Ok(current) => current,
            Err(e) => {
                failure = Some(e.into());
                return old.map(|bytes| bytes.to_vec());
            }
        };
        let unchanged = old.map(|bytes| bytes.to_vec());
        let Some(next) = f(current) else {
            stored = old.and_then(|bytes| bincode::deserialize::<T>(bytes).ok());
            return unchanged;
        };
        match bincode::serialize(&next) {
            Ok(bytes) => {
                stored = Some(next);
                Some(bytes)
            }
            Err(e) => {
                failure = Some(e.into());
                unchanged
            }
        }
    })?;
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(stored)
}

pub(crate) fn check_schema(entity: &'static str, expected: u8, found: u8) -> Result<(), PersistenceError> {
    if expected != found {
        return Err(PersistenceError::SchemaMismatch {
            entity,
            expected,
            found,
        });
    }
    Ok(())
}

pub(crate) fn maybe_flush(tree: &sled::Tree, flush: bool) -> Result<(), PersistenceError> {
    if flush {
        tree.flush()?;
    }
    Ok(())
}
