use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MESSAGE_SCHEMA_VERSION: u8 = 2;
pub const MAILBOX_SCHEMA_VERSION: u8 = 2;
pub const LINK_SCHEMA_VERSION: u8 = 1;
pub const READ_TRACKING_SCHEMA_VERSION: u8 = 1;
pub const ROOM_SCHEMA_VERSION: u8 = 1;

/// A message as stored in the message log. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    /// `None` for system messages.
    pub sender_id: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Room members at the time of the send. Repairs never reach anyone else.
    pub recipients: Vec<String>,
    pub schema_version: u8,
}

impl Message {
    pub fn is_system(&self) -> bool {
        self.sender_id.is_none()
    }

    /// Whether a mailbox cleared at `cleared_at` has already dropped this message.
    pub fn cleared_by(&self, cleared_at: Option<DateTime<Utc>>) -> bool {
        cleared_at.is_some_and(|at| self.created_at <= at)
    }
}

/// Caller-supplied content for a send. The log assigns id, room, sender and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub body: String,
}

impl MessageDraft {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    OneToOne,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub user_id: String,
    /// Who added this member; `None` for the creator and one-to-one participants.
    #[serde(default)]
    pub added_by: Option<String>,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            added_by: None,
            added_at: None,
        }
    }

    pub fn added(user_id: &str, added_by: &str, added_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            added_by: Some(added_by.to_string()),
            added_at: Some(added_at),
        }
    }
}

/// Room aggregate. Values handed to the orchestrator are snapshots; later
/// membership edits never reach a send that is already in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub room_type: RoomType,
    pub created_by: String,
    /// Unique by `user_id`.
    pub members: Vec<Member>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl Room {
    pub fn new(id: &str, room_type: RoomType, created_by: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            room_type,
            created_by: created_by.to_string(),
            members: Vec::new(),
            last_activity: None,
            created_at,
            schema_version: ROOM_SCHEMA_VERSION,
        }
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    /// Add a member unless one with the same user id is already present.
    /// Returns true when the member was inserted.
    pub fn push_member(&mut self, member: Member) -> bool {
        if self.is_member(&member.user_id) {
            return false;
        }
        self.members.push(member);
        true
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.user_id.clone()).collect()
    }
}

/// Per-user view into a room. `empty` marks a cleared conversation whose
/// history must be hidden even if link rows still exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mailbox {
    pub id: String,
    pub user_id: String,
    pub room_id: String,
    pub empty: bool,
    /// When the conversation was last cleared. Survives resurrection, so
    /// messages created before it never return to this mailbox.
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl Mailbox {
    pub fn new(id: &str, user_id: &str, room_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            empty: false,
            cleared_at: None,
            created_at,
            schema_version: MAILBOX_SCHEMA_VERSION,
        }
    }
}

/// Join row between a mailbox and a message. Written once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxLink {
    pub mailbox_id: String,
    pub message_id: String,
    pub message_created_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl MailboxLink {
    pub fn new(mailbox_id: &str, message_id: &str, message_created_at: DateTime<Utc>) -> Self {
        Self {
            mailbox_id: mailbox_id.to_string(),
            message_id: message_id.to_string(),
            message_created_at,
            schema_version: LINK_SCHEMA_VERSION,
        }
    }
}

/// Last-read pointer and unread counter for one (room, user) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadTracking {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub last_read_message_id: Option<String>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl ReadTracking {
    pub fn new(room_id: &str, user_id: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            last_read_message_id: None,
            unread_count: 0,
            updated_at,
            schema_version: READ_TRACKING_SCHEMA_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_member_keeps_user_ids_unique() {
        let mut room = Room::new("r1", RoomType::Group, "alice", Utc::now());
        assert!(room.push_member(Member::new("alice")));
        assert!(room.push_member(Member::added("bob", "alice", Utc::now())));
        assert!(!room.push_member(Member::new("bob")));
        assert_eq!(room.member_ids(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn system_message_has_no_sender() {
        let msg = Message {
            id: "m1".into(),
            room_id: "r1".into(),
            sender_id: None,
            body: "alice joined".into(),
            created_at: Utc::now(),
            recipients: vec!["bob".into()],
            schema_version: MESSAGE_SCHEMA_VERSION,
        };
        assert!(msg.is_system());
        assert!(!msg.cleared_by(None));
        assert!(msg.cleared_by(Some(msg.created_at)));
        assert!(!msg.cleared_by(Some(msg.created_at - chrono::Duration::seconds(1))));
    }
}
