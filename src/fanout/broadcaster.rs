use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use super::{FanoutSink, PushChannel, MESSAGES_TOPIC};
use crate::errors::PushError;
use crate::types::Message;

/// Wire view of a message on the push topic.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    id: &'a str,
    room_id: &'a str,
    sender_id: Option<&'a str>,
    body: &'a str,
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a Message> for OutboundMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            id: &message.id,
            room_id: &message.room_id,
            sender_id: message.sender_id.as_deref(),
            body: &message.body,
            created_at: message.created_at,
        }
    }
}

/// Best-effort real-time delivery. One attempt per member, no retries; the
/// outcome goes to the sink and never back to the caller.
pub struct Broadcaster {
    channel: Arc<dyn PushChannel>,
    sink: Arc<dyn FanoutSink>,
    topic: String,
}

impl Broadcaster {
    pub fn new(channel: Arc<dyn PushChannel>, sink: Arc<dyn FanoutSink>) -> Self {
        Self {
            channel,
            sink,
            topic: MESSAGES_TOPIC.to_string(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn deliver(&self, message: &Message, members: &[String]) {
        let payload = match serde_json::to_value(OutboundMessage::from(message)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cannot encode message id={} for push: {}", message.id, e);
                let outcome = Err(PushError::Encoding(e.to_string()));
                for user_id in members {
                    self.sink.push_attempted(user_id, &message.id, &outcome);
                }
                return;
            }
        };
        for user_id in members {
            let outcome = self.channel.push_to_user(user_id, &self.topic, &payload);
            self.sink.push_attempted(user_id, &message.id, &outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{RecordingSink, SessionHub};
    use crate::types::MESSAGE_SCHEMA_VERSION;

    fn message() -> Message {
        Message {
            id: "m1".into(),
            room_id: "r1".into(),
            sender_id: Some("alice".into()),
            body: "hi".into(),
            created_at: Utc::now(),
            recipients: vec!["alice".into(), "bob".into(), "carol".into()],
            schema_version: MESSAGE_SCHEMA_VERSION,
        }
    }

    #[tokio::test]
    async fn offline_members_do_not_stop_delivery() {
        let hub = Arc::new(SessionHub::new(8));
        let sink = Arc::new(RecordingSink::new());
        let mut carol = hub.connect("carol");
        let broadcaster = Broadcaster::new(hub.clone(), sink.clone());

        let members = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
        broadcaster.deliver(&message(), &members);

        assert_eq!(sink.push_targets("m1"), members);
        let push = carol.recv().await.expect("carol receives");
        assert_eq!(push.topic, MESSAGES_TOPIC);
        assert_eq!(push.payload["roomId"], "r1");
        assert_eq!(push.payload["senderId"], "alice");
        assert!(sink.degraded_steps().is_empty());
    }
}
