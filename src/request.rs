use crate::notification::{Notification, Priority};
use bytes::Bytes;
use uuid::Uuid;

pub const METHOD: &str = "POST";

pub const HEADER_ID: &str = "apns-id";
pub const HEADER_EXPIRATION: &str = "apns-expiration";
pub const HEADER_PRIORITY: &str = "apns-priority";
pub const HEADER_TOPIC: &str = "apns-topic";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";

/// Typed header set of a request. Optional fields are emitted only when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeaders {
    pub id: Option<Uuid>,
    /// Seconds since the Unix epoch.
    pub expiration: Option<i64>,
    pub priority: Option<Priority>,
    pub topic: Option<String>,
    pub content_length: usize,
}

impl WireHeaders {
    /// Serializes the headers into ordered name/value pairs, skipping absent
    /// fields.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(5);
        if let Some(id) = self.id {
            pairs.push((HEADER_ID, id.hyphenated().to_string()));
        }
        if let Some(expiration) = self.expiration {
            pairs.push((HEADER_EXPIRATION, expiration.to_string()));
        }
        if let Some(priority) = self.priority {
            pairs.push((HEADER_PRIORITY, priority.wire_value().to_string()));
        }
        if let Some(topic) = &self.topic {
            pairs.push((HEADER_TOPIC, topic.clone()));
        }
        pairs.push((HEADER_CONTENT_LENGTH, self.content_length.to_string()));
        pairs
    }
}

/// A notification in the shape the gateway expects on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub path: String,
    pub headers: WireHeaders,
    pub payload: Bytes,
}

/// Maps a notification to its wire request. Total and pure: the same
/// notification always yields the same request, and no default is ever
/// synthesized for an absent field.
#[must_use]
pub fn to_wire_request(notification: &Notification) -> WireRequest {
    WireRequest {
        path: format!("/3/device/{}", notification.device_token()),
        headers: WireHeaders {
            id: notification.id(),
            expiration: notification.expiration().map(time::OffsetDateTime::unix_timestamp),
            priority: notification.priority(),
            topic: notification.topic().map(str::to_string),
            content_length: notification.payload().len(),
        },
        payload: notification.payload().clone(),
    }
}

impl From<&Notification> for WireRequest {
    fn from(notification: &Notification) -> Self {
        to_wire_request(notification)
    }
}
