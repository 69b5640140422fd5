use chrono::{DateTime, SecondsFormat, Utc};
use log::trace;

use super::{maybe_flush, next_timestamp, CreditGuard};
use crate::errors::PersistenceError;

/// `room:user:message` keys recording that a member's unread counter was
/// already credited for a message. The value is the claim time in RFC 3339.
///
/// Keys live until the member clears the room. Clearing drops every key
/// claimed up to the clear; anything older than the clear is never repaired
/// again, so nothing can be credited twice after that.
#[derive(Clone)]
pub struct SledCreditGuard {
    credits: sled::Tree,
    flush: bool,
}

impl SledCreditGuard {
    pub(crate) fn new(credits: sled::Tree, flush: bool) -> Self {
        Self { credits, flush }
    }

    fn key(room_id: &str, user_id: &str, message_id: &str) -> Vec<u8> {
        format!("{}:{}:{}", room_id, user_id, message_id).into_bytes()
    }

    fn claimed_at(value: &[u8]) -> Option<DateTime<Utc>> {
        let text = std::str::from_utf8(value).ok()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }
}

impl CreditGuard for SledCreditGuard {
    fn claim(&self, room_id: &str, user_id: &str, message_id: &str) -> Result<bool, PersistenceError> {
        let key = Self::key(room_id, user_id, message_id);
        let stamp = next_timestamp().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let claimed = self
            .credits
            .compare_and_swap(key, None as Option<&[u8]>, Some(stamp.as_bytes()))?
            .is_ok();
        if claimed {
            maybe_flush(&self.credits, self.flush)?;
        }
        Ok(claimed)
    }

    fn release(&self, room_id: &str, user_id: &str, message_id: &str) -> Result<(), PersistenceError> {
        self.credits.remove(Self::key(room_id, user_id, message_id))?;
        maybe_flush(&self.credits, self.flush)
    }

    fn forget_member(&self, room_id: &str, user_id: &str, up_to: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let prefix = format!("{}:{}:", room_id, user_id);
        let mut dropped = 0;
        for entry in self.credits.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            // Unreadable stamps are kept; a stale key only blocks a repair.
            if Self::claimed_at(&value).is_some_and(|at| at <= up_to) && self.credits.remove(key)?.is_some() {
                dropped += 1;
            }
        }
        maybe_flush(&self.credits, self.flush)?;
        trace!("dropped {} credit keys room={} user={}", dropped, room_id, user_id);
        Ok(dropped)
    }
}
