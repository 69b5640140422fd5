use log::{debug, trace};
use uuid::Uuid;

use super::{check_schema, deserialize, maybe_flush, next_timestamp, pair_key, serialize, update_record, MailboxDirectory};
use crate::errors::PersistenceError;
use crate::types::{Mailbox, MAILBOX_SCHEMA_VERSION};

/// How many times `ensure_mailbox` re-reads the index after losing an insert race.
const ENSURE_ATTEMPTS: usize = 3;

/// Mailbox records by id plus a unique `user:room -> mailbox id` index.
#[derive(Clone)]
pub struct SledMailboxDirectory {
    mailboxes: sled::Tree,
    index: sled::Tree,
    flush: bool,
}

impl SledMailboxDirectory {
    pub(crate) fn new(mailboxes: sled::Tree, index: sled::Tree, flush: bool) -> Self {
        Self { mailboxes, index, flush }
    }

    fn resurrect(&self, mailbox_id: &str) -> Result<Mailbox, PersistenceError> {
        let updated = update_record::<Mailbox, _>(&self.mailboxes, mailbox_id.as_bytes(), |current| {
            let mut mailbox = current?;
            if !mailbox.empty {
                return None;
            }
            mailbox.empty = false;
            Some(mailbox)
        })?;
        let Some(mailbox) = updated else {
            return Err(PersistenceError::NotFound(format!("mailbox: {}", mailbox_id)));
        };
        check_schema("mailbox", MAILBOX_SCHEMA_VERSION, mailbox.schema_version)?;
        maybe_flush(&self.mailboxes, self.flush)?;
        Ok(mailbox)
    }
}

impl MailboxDirectory for SledMailboxDirectory {
    fn ensure_mailbox(&self, user_id: &str, room_id: &str) -> Result<Mailbox, PersistenceError> {
        let key = pair_key(user_id, room_id);
        for attempt in 0..ENSURE_ATTEMPTS {
            if let Some(id) = self.index.get(&key)? {
                let id = String::from_utf8_lossy(&id).into_owned();
                let mailbox = self.get(&id)?;
                if mailbox.empty {
                    debug!("resurrecting mailbox id={} user={} room={}", id, user_id, room_id);
                    return self.resurrect(&id);
                }
                return Ok(mailbox);
            }

            let mailbox = Mailbox::new(&Uuid::new_v4().to_string(), user_id, room_id, next_timestamp());
            // Record before index, so the index never points at a missing record.
            self.mailboxes.insert(mailbox.id.as_bytes(), serialize(&mailbox)?)?;
            match self
                .index
                .compare_and_swap(&key, None as Option<&[u8]>, Some(mailbox.id.as_bytes()))?
            {
                Ok(()) => {
                    maybe_flush(&self.mailboxes, self.flush)?;
                    maybe_flush(&self.index, self.flush)?;
                    trace!("created mailbox id={} user={} room={}", mailbox.id, user_id, room_id);
                    return Ok(mailbox);
                }
                Err(_) => {
                    // Somebody else won the insert; drop ours and re-read theirs.
                    self.mailboxes.remove(mailbox.id.as_bytes())?;
                    debug!(
                        "mailbox insert race user={} room={} attempt={}",
                        user_id,
                        room_id,
                        attempt + 1
                    );
                }
            }
        }
        Err(PersistenceError::Unavailable(format!(
            "mailbox index for {}:{} kept changing",
            user_id, room_id
        )))
    }

    fn mark_deleted(&self, mailbox_id: &str) -> Result<(), PersistenceError> {
        let cleared_at = next_timestamp();
        let updated = update_record::<Mailbox, _>(&self.mailboxes, mailbox_id.as_bytes(), |current| {
            let mut mailbox = current?;
            mailbox.empty = true;
            mailbox.cleared_at = Some(cleared_at);
            Some(mailbox)
        })?;
        if updated.is_none() {
            return Err(PersistenceError::NotFound(format!("mailbox: {}", mailbox_id)));
        }
        maybe_flush(&self.mailboxes, self.flush)
    }

    fn get(&self, mailbox_id: &str) -> Result<Mailbox, PersistenceError> {
        let Some(bytes) = self.mailboxes.get(mailbox_id.as_bytes())? else {
            return Err(PersistenceError::NotFound(format!("mailbox: {}", mailbox_id)));
        };
        let record: Mailbox = deserialize(&bytes)?;
        check_schema("mailbox", MAILBOX_SCHEMA_VERSION, record.schema_version)?;
        Ok(record)
    }

    fn find(&self, user_id: &str, room_id: &str) -> Result<Option<Mailbox>, PersistenceError> {
        match self.index.get(pair_key(user_id, room_id))? {
            Some(id) => self.get(&String::from_utf8_lossy(&id)).map(Some),
            None => Ok(None),
        }
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Mailbox>, PersistenceError> {
        let prefix = format!("{}:", user_id);
        self.index
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_key, id) = entry?;
                self.get(&String::from_utf8_lossy(&id))
            })
            .collect()
    }
}
