use log::trace;
use uuid::Uuid;

use super::{
    check_schema, deserialize, maybe_flush, next_timestamp, ordered_key, serialize, MessageLog,
};
use crate::errors::PersistenceError;
use crate::types::{Message, MessageDraft, MESSAGE_SCHEMA_VERSION};

/// Message log backed by two trees: records by id, and a
/// `room:<nanos>:<id>` index giving per-room creation order.
#[derive(Clone)]
pub struct SledMessageLog {
    messages: sled::Tree,
    by_room: sled::Tree,
    flush: bool,
}

impl SledMessageLog {
    pub(crate) fn new(messages: sled::Tree, by_room: sled::Tree, flush: bool) -> Self {
        Self {
            messages,
            by_room,
            flush,
        }
    }
}

impl MessageLog for SledMessageLog {
    fn append(
        &self,
        room_id: &str,
        sender_id: Option<&str>,
        recipients: &[String],
        draft: &MessageDraft,
    ) -> Result<Message, PersistenceError> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            sender_id: sender_id.map(|s| s.to_string()),
            body: draft.body.clone(),
            created_at: next_timestamp(),
            recipients: recipients.to_vec(),
            schema_version: MESSAGE_SCHEMA_VERSION,
        };
        let bytes = serialize(&message)?;
        // Record first, index second: an index entry never points at nothing.
        self.messages.insert(message.id.as_bytes(), bytes)?;
        self.by_room.insert(
            ordered_key(room_id, &message.created_at, &message.id),
            message.id.as_bytes(),
        )?;
        maybe_flush(&self.messages, self.flush)?;
        maybe_flush(&self.by_room, self.flush)?;
        trace!("appended message id={} room={}", message.id, room_id);
        Ok(message)
    }

    fn get(&self, message_id: &str) -> Result<Message, PersistenceError> {
        let Some(bytes) = self.messages.get(message_id.as_bytes())? else {
            return Err(PersistenceError::NotFound(format!("message: {}", message_id)));
        };
        let record: Message = deserialize(&bytes)?;
        check_schema("message", MESSAGE_SCHEMA_VERSION, record.schema_version)?;
        Ok(record)
    }

    fn last_in_room(&self, room_id: &str) -> Result<Option<Message>, PersistenceError> {
        let prefix = format!("{}:", room_id);
        match self.by_room.scan_prefix(prefix.as_bytes()).next_back() {
            Some(entry) => {
                let (_key, id) = entry?;
                Ok(Some(self.get(&String::from_utf8_lossy(&id))?))
            }
            None => Ok(None),
        }
    }

    fn list_room(&self, room_id: &str, offset: usize, limit: usize) -> Result<Vec<Message>, PersistenceError> {
        let prefix = format!("{}:", room_id);
        self.by_room
            .scan_prefix(prefix.as_bytes())
            .rev()
            .skip(offset)
            .take(limit)
            .map(|entry| {
                let (_key, id) = entry?;
                self.get(&String::from_utf8_lossy(&id))
            })
            .collect()
    }

    fn count_after(&self, room_id: &str, message_id: Option<&str>) -> Result<usize, PersistenceError> {
        let prefix = format!("{}:", room_id);
        let Some(message_id) = message_id else {
            return Ok(self.by_room.scan_prefix(prefix.as_bytes()).count());
        };
        let pivot = self.get(message_id)?;
        let start = ordered_key(room_id, &pivot.created_at, &pivot.id);
        let mut count = 0usize;
        for entry in self.by_room.range(start..) {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            count += 1;
        }
        // The pivot itself is the first key of the range.
        Ok(count.saturating_sub(1))
    }
}
