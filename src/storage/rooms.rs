use chrono::{DateTime, Utc};
use log::info;
use uuid::Uuid;

use super::{check_schema, deserialize, maybe_flush, next_timestamp, serialize, update_record, RoomDirectory};
use crate::errors::{ConversationError, PersistenceError};
use crate::types::{Member, Room, RoomType, ROOM_SCHEMA_VERSION};
use crate::validation::validate_id;

/// Room aggregates keyed by room id.
#[derive(Clone)]
pub struct SledRoomDirectory {
    rooms: sled::Tree,
    flush: bool,
}

impl SledRoomDirectory {
    pub(crate) fn new(rooms: sled::Tree, flush: bool) -> Self {
        Self { rooms, flush }
    }

    fn insert_new(&self, room: &Room) -> Result<(), PersistenceError> {
        match self
            .rooms
            .compare_and_swap(room.id.as_bytes(), None as Option<&[u8]>, Some(serialize(room)?))?
        {
            Ok(()) => maybe_flush(&self.rooms, self.flush),
            Err(_) => Err(PersistenceError::Invalid(format!("room {} already exists", room.id))),
        }
    }

    /// Create a one-to-one room between two distinct users.
    pub fn create_one_to_one(&self, first: &str, second: &str) -> Result<Room, PersistenceError> {
        validate_id("user_id", first)?;
        validate_id("user_id", second)?;
        if first == second {
            return Err(PersistenceError::Invalid(
                "a one-to-one room needs two different users".to_string(),
            ));
        }
        let mut room = Room::new(&Uuid::new_v4().to_string(), RoomType::OneToOne, first, next_timestamp());
        room.push_member(Member::new(first));
        room.push_member(Member::new(second));
        self.insert_new(&room)?;
        info!("created one-to-one room {} for {} and {}", room.id, first, second);
        Ok(room)
    }

    /// Create a group room. The creator becomes a member; everyone else is
    /// recorded as added by the creator.
    pub fn create_group(&self, creator: &str, members: &[String]) -> Result<Room, ConversationError> {
        validate_id("user_id", creator).map_err(PersistenceError::from)?;
        for member in members {
            validate_id("user_id", member).map_err(PersistenceError::from)?;
        }
        let now = next_timestamp();
        let mut room = Room::new(&Uuid::new_v4().to_string(), RoomType::Group, creator, now);
        for member in members.iter().filter(|m| m.as_str() != creator) {
            room.push_member(Member::added(member, creator, now));
        }
        if room.members.is_empty() {
            return Err(ConversationError::Room {
                room_id: room.id,
                reason: "a group needs at least one member besides its creator".to_string(),
            });
        }
        room.push_member(Member::new(creator));
        self.insert_new(&room)?;
        info!("created group room {} by {} with {} members", room.id, creator, room.members.len());
        Ok(room)
    }

    /// Add members to a group room. Users already in the room are skipped.
    pub fn add_members(&self, room_id: &str, actor: &str, members: &[String]) -> Result<Room, ConversationError> {
        for member in members {
            validate_id("user_id", member).map_err(PersistenceError::from)?;
        }
        let existing = self.snapshot(room_id)?;
        if existing.room_type == RoomType::OneToOne {
            return Err(ConversationError::Room {
                room_id: room_id.to_string(),
                reason: "members cannot be added to a one-to-one room".to_string(),
            });
        }
        let now = Utc::now();
        let updated = update_record::<Room, _>(&self.rooms, room_id.as_bytes(), |current| {
            let mut room = current?;
            for member in members {
                if member == actor {
                    room.push_member(Member::new(member));
                } else {
                    room.push_member(Member::added(member, actor, now));
                }
            }
            Some(room)
        })?;
        maybe_flush(&self.rooms, self.flush)?;
        updated.ok_or_else(|| PersistenceError::NotFound(format!("room: {}", room_id)).into())
    }
}

impl RoomDirectory for SledRoomDirectory {
    fn snapshot(&self, room_id: &str) -> Result<Room, PersistenceError> {
        let Some(bytes) = self.rooms.get(room_id.as_bytes())? else {
            return Err(PersistenceError::NotFound(format!("room: {}", room_id)));
        };
        let record: Room = deserialize(&bytes)?;
        check_schema("room", ROOM_SCHEMA_VERSION, record.schema_version)?;
        Ok(record)
    }

    fn touch_last_activity(&self, room_id: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        let updated = update_record::<Room, _>(&self.rooms, room_id.as_bytes(), |current| {
            let mut room = current?;
            room.last_activity = Some(at);
            Some(room)
        })?;
        if updated.is_none() {
            return Err(PersistenceError::NotFound(format!("room: {}", room_id)));
        }
        maybe_flush(&self.rooms, self.flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChatStoreBuilder;
    use tempfile::TempDir;

    #[test]
    fn group_creation_records_who_added_whom() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let rooms = store.rooms();

        let room = rooms
            .create_group("alice", &["bob".to_string(), "carol".to_string(), "alice".to_string()])
            .expect("group");
        assert_eq!(room.room_type, RoomType::Group);
        assert_eq!(room.members.len(), 3);
        let bob = room.members.iter().find(|m| m.user_id == "bob").expect("bob");
        assert_eq!(bob.added_by.as_deref(), Some("alice"));
        let alice = room.members.iter().find(|m| m.user_id == "alice").expect("alice");
        assert!(alice.added_by.is_none());
        assert_eq!(rooms.snapshot(&room.id).expect("snapshot"), room);
    }

    #[test]
    fn group_without_other_members_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let result = store.rooms().create_group("alice", &["alice".to_string()]);
        assert!(matches!(result, Err(ConversationError::Room { .. })));
        assert_eq!(store.stats().rooms, 0);
    }

    #[test]
    fn one_to_one_rooms_refuse_new_members() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let rooms = store.rooms();
        let room = rooms.create_one_to_one("alice", "bob").expect("room");

        let result = rooms.add_members(&room.id, "alice", &["carol".to_string()]);
        assert!(matches!(result, Err(ConversationError::Room { .. })));
        assert_eq!(rooms.snapshot(&room.id).expect("snapshot").members.len(), 2);
    }

    #[test]
    fn add_members_skips_existing_users() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let rooms = store.rooms();
        let room = rooms.create_group("alice", &["bob".to_string()]).expect("group");

        let updated = rooms
            .add_members(&room.id, "bob", &["bob".to_string(), "dave".to_string()])
            .expect("add");
        assert_eq!(updated.members.len(), 3);
        let dave = updated.members.iter().find(|m| m.user_id == "dave").expect("dave");
        assert_eq!(dave.added_by.as_deref(), Some("bob"));
    }

    #[test]
    fn snapshot_is_a_value_copy() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let rooms = store.rooms();
        let room = rooms.create_group("alice", &["bob".to_string()]).expect("group");

        let snapshot = rooms.snapshot(&room.id).expect("snapshot");
        rooms.add_members(&room.id, "alice", &["erin".to_string()]).expect("add");
        assert_eq!(snapshot.members.len(), 2);

        let at = Utc::now();
        rooms.touch_last_activity(&room.id, at).expect("touch");
        assert_eq!(rooms.snapshot(&room.id).expect("snapshot").last_activity, Some(at));
        assert!(matches!(
            rooms.touch_last_activity("missing", at),
            Err(PersistenceError::NotFound(_))
        ));
    }
}
