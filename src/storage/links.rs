use chrono::{DateTime, Utc};
use log::trace;

use super::{check_schema, deserialize, maybe_flush, ordered_key, serialize, MailboxLinks};
use crate::errors::PersistenceError;
use crate::types::{MailboxLink, LINK_SCHEMA_VERSION};

/// Link rows keyed `mailbox:<message nanos>:<message id>`. Writing the same
/// (mailbox, message) pair twice lands on the same key.
#[derive(Clone)]
pub struct SledMailboxLinks {
    links: sled::Tree,
    flush: bool,
}

impl SledMailboxLinks {
    pub(crate) fn new(links: sled::Tree, flush: bool) -> Self {
        Self { links, flush }
    }

    #[cfg(test)]
    fn count_for_mailbox(&self, mailbox_id: &str) -> usize {
        let prefix = format!("{}:", mailbox_id);
        self.links.scan_prefix(prefix.as_bytes()).count()
    }
}

impl MailboxLinks for SledMailboxLinks {
    fn link(
        &self,
        mailbox_id: &str,
        message_id: &str,
        message_created_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let record = MailboxLink::new(mailbox_id, message_id, message_created_at);
        let key = ordered_key(mailbox_id, &message_created_at, message_id);
        self.links.insert(key, serialize(&record)?)?;
        maybe_flush(&self.links, self.flush)?;
        Ok(())
    }

    fn delete_all_for_mailbox(&self, mailbox_id: &str) -> Result<usize, PersistenceError> {
        let prefix = format!("{}:", mailbox_id);
        let keys: Result<Vec<_>, _> = self
            .links
            .scan_prefix(prefix.as_bytes())
            .map(|entry| entry.map(|(key, _value)| key))
            .collect();

        let mut removed = 0;
        for key in keys? {
            if self.links.remove(key)?.is_some() {
                removed += 1;
            }
        }
        maybe_flush(&self.links, self.flush)?;
        trace!("removed {} links of mailbox {}", removed, mailbox_id);
        Ok(removed)
    }

    fn list_for_mailbox(
        &self,
        mailbox_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MailboxLink>, PersistenceError> {
        let prefix = format!("{}:", mailbox_id);
        self.links
            .scan_prefix(prefix.as_bytes())
            .rev()
            .skip(offset)
            .take(limit)
            .map(|entry| {
                let (_key, value) = entry?;
                let record: MailboxLink = deserialize(&value)?;
                check_schema("mailbox link", LINK_SCHEMA_VERSION, record.schema_version)?;
                Ok(record)
            })
            .collect()
    }
}
