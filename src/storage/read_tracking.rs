use chrono::Utc;

use super::{check_schema, deserialize, maybe_flush, pair_key, update_record, ReadLedger};
use crate::errors::PersistenceError;
use crate::types::{ReadTracking, READ_TRACKING_SCHEMA_VERSION};

/// Read tracking entries keyed `room:user`. Every mutation goes through
/// sled's compare-and-swap loop, so concurrent increments never lose an update.
#[derive(Clone)]
pub struct SledReadLedger {
    entries: sled::Tree,
    flush: bool,
}

impl SledReadLedger {
    pub(crate) fn new(entries: sled::Tree, flush: bool) -> Self {
        Self { entries, flush }
    }

    /// All entries of a room, for diagnostics and status output.
    pub fn list_room(&self, room_id: &str) -> Result<Vec<ReadTracking>, PersistenceError> {
        let prefix = format!("{}:", room_id);
        self.entries
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_key, value) = entry?;
                let record: ReadTracking = deserialize(&value)?;
                check_schema("read tracking", READ_TRACKING_SCHEMA_VERSION, record.schema_version)?;
                Ok(record)
            })
            .collect()
    }
}

impl ReadLedger for SledReadLedger {
    fn increment_unread(&self, room_id: &str, user_id: &str) -> Result<u32, PersistenceError> {
        let key = pair_key(room_id, user_id);
        let updated = update_record::<ReadTracking, _>(&self.entries, &key, |current| {
            let mut entry = current.unwrap_or_else(|| ReadTracking::new(room_id, user_id, Utc::now()));
            entry.unread_count = entry.unread_count.saturating_add(1);
            entry.updated_at = Utc::now();
            Some(entry)
        })?;
        maybe_flush(&self.entries, self.flush)?;
        Ok(updated.map(|e| e.unread_count).unwrap_or_default())
    }

    fn update_read_position(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<(), PersistenceError> {
        let key = pair_key(room_id, user_id);
        update_record::<ReadTracking, _>(&self.entries, &key, |current| {
            let mut entry = current.unwrap_or_else(|| ReadTracking::new(room_id, user_id, Utc::now()));
            entry.last_read_message_id = Some(message_id.to_string());
            entry.unread_count = 0;
            entry.updated_at = Utc::now();
            Some(entry)
        })?;
        maybe_flush(&self.entries, self.flush)
    }

    fn reset_to_zero(&self, room_id: &str, user_id: &str) -> Result<(), PersistenceError> {
        let key = pair_key(room_id, user_id);
        // Only an existing entry is reset; clearing never creates tracking state.
        update_record::<ReadTracking, _>(&self.entries, &key, |current| {
            let mut entry = current?;
            if entry.unread_count == 0 {
                return None;
            }
            entry.unread_count = 0;
            entry.updated_at = Utc::now();
            Some(entry)
        })?;
        maybe_flush(&self.entries, self.flush)
    }

    fn get(&self, room_id: &str, user_id: &str) -> Result<Option<ReadTracking>, PersistenceError> {
        let Some(bytes) = self.entries.get(pair_key(room_id, user_id))? else {
            return Ok(None);
        };
        let record: ReadTracking = deserialize(&bytes)?;
        check_schema("read tracking", READ_TRACKING_SCHEMA_VERSION, record.schema_version)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChatStoreBuilder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn unread(ledger: &SledReadLedger, room: &str, user: &str) -> u32 {
        ledger
            .get(room, user)
            .expect("get")
            .map(|e| e.unread_count)
            .unwrap_or_default()
    }

    #[test]
    fn increment_keeps_read_pointer() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let ledger = store.read_tracking();

        ledger.update_read_position("bob", "r1", "m1").expect("read");
        assert_eq!(ledger.increment_unread("r1", "bob").expect("inc"), 1);
        assert_eq!(ledger.increment_unread("r1", "bob").expect("inc"), 2);

        let entry = ledger.get("r1", "bob").expect("get").expect("entry");
        assert_eq!(entry.last_read_message_id.as_deref(), Some("m1"));
        assert_eq!(entry.unread_count, 2);
    }

    #[test]
    fn excluding_skips_only_the_excluded_user() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let ledger = store.read_tracking();
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let failures = ledger.increment_unread_excluding("r1", "m1", &members, Some("a"));
        assert!(failures.is_empty());
        assert_eq!(unread(&ledger, "r1", "a"), 0);
        assert_eq!(unread(&ledger, "r1", "b"), 1);
        assert_eq!(unread(&ledger, "r1", "c"), 1);

        ledger.increment_unread_excluding("r1", "m2", &members, None);
        assert_eq!(unread(&ledger, "r1", "a"), 1);
        assert_eq!(ledger.list_room("r1").expect("list").len(), 3);
    }

    #[test]
    fn reset_does_not_create_entries() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).open().expect("store");
        let ledger = store.read_tracking();

        ledger.reset_to_zero("r1", "ghost").expect("reset");
        assert!(ledger.get("r1", "ghost").expect("get").is_none());

        ledger.increment_unread("r1", "bob").expect("inc");
        ledger.reset_to_zero("r1", "bob").expect("reset");
        assert_eq!(unread(&ledger, "r1", "bob"), 0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let dir = TempDir::new().expect("tempdir");
        let store = ChatStoreBuilder::new(dir.path()).flush_on_write(false).open().expect("store");
        let ledger = Arc::new(store.read_tracking());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        ledger.increment_unread("r1", "bob").expect("inc");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(unread(&ledger, "r1", "bob"), 400);
    }
}
