use crate::error::ValidationError;
use bytes::Bytes;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Largest payload the gateway accepts, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Delivery priority of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Send immediately. Must trigger an alert, sound, or badge on the device.
    Immediate = 10,
    /// Send at a time that takes the device's power state into account.
    /// Such notifications may be grouped, throttled, or dropped.
    PowerConsiderate = 5,
}

impl Priority {
    #[must_use]
    pub const fn wire_value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Self::Immediate),
            5 => Ok(Self::PowerConsiderate),
            _ => Err(()),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" | "10" => Ok(Self::Immediate),
            "power-considerate" | "5" => Ok(Self::PowerConsiderate),
            other => Err(format!("unknown priority '{other}', expected 'immediate' or 'power-considerate'")),
        }
    }
}

/// A push notification to be sent to one device. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    device_token: String,
    id: Option<Uuid>,
    expiration: Option<OffsetDateTime>,
    priority: Option<Priority>,
    topic: Option<String>,
    payload: Bytes,
}

impl Notification {
    pub fn builder(device_token: impl Into<String>, payload: impl Into<Bytes>) -> NotificationBuilder {
        NotificationBuilder {
            device_token: device_token.into(),
            id: None,
            expiration: None,
            priority: None,
            topic: None,
            payload: payload.into(),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    #[must_use]
    pub fn device_token(&self) -> &str {
        &self.device_token
    }

    /// Client-supplied identifier. When absent the gateway assigns one and
    /// returns it in the response.
    #[must_use]
    pub const fn id(&self) -> Option<Uuid> {
        self.id
    }

    /// When absent the gateway attempts delivery once and does not store the
    /// notification. When present it retries until this time.
    #[must_use]
    pub const fn expiration(&self) -> Option<OffsetDateTime> {
        self.expiration
    }

    #[must_use]
    pub const fn priority(&self) -> Option<Priority> {
        self.priority
    }

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Checks the notification against the gateway's client-side limits.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self, max_payload_size: usize) -> Result<(), ValidationError> {
        if self.device_token.is_empty() || !self.device_token.chars().all(|c| c.is_ascii_graphic() && c != '/') {
            return Err(ValidationError::InvalidDeviceToken);
        }
        if self.payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if self.payload.len() > max_payload_size {
            return Err(ValidationError::PayloadTooLarge { size: self.payload.len(), max: max_payload_size });
        }
        if self.topic.as_deref().is_some_and(str::is_empty) {
            return Err(ValidationError::InvalidTopic);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    device_token: String,
    id: Option<Uuid>,
    expiration: Option<OffsetDateTime>,
    priority: Option<Priority>,
    topic: Option<String>,
    payload: Bytes,
    max_payload_size: usize,
}

impl NotificationBuilder {
    #[must_use]
    pub const fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub const fn expiration(mut self, expiration: OffsetDateTime) -> Self {
        self.expiration = Some(expiration);
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub const fn max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    /// # Errors
    /// Returns a [`ValidationError`] if the notification could never be sent.
    pub fn build(self) -> Result<Notification, ValidationError> {
        let notification = Notification {
            device_token: self.device_token,
            id: self.id,
            expiration: self.expiration,
            priority: self.priority,
            topic: self.topic,
            payload: self.payload,
        };
        notification.validate(self.max_payload_size)?;
        Ok(notification)
    }
}
