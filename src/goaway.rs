use serde::Deserialize;
use std::fmt;
use time::OffsetDateTime;

/// Machine-readable cause reported by the gateway, either in a per-request
/// error body or in the debug data of a GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reason {
    /// The message payload was empty.
    PayloadEmpty,
    /// The message payload was too large.
    PayloadTooLarge,
    /// The `apns-topic` was invalid.
    BadTopic,
    /// Pushing to this topic is not allowed.
    TopicDisallowed,
    /// The `apns-id` value is bad.
    BadMessageId,
    /// The `apns-expiration` value is bad.
    BadExpirationDate,
    /// The `apns-priority` value is bad.
    BadPriority,
    /// The device token is not specified in the request path.
    MissingDeviceToken,
    /// The device token is malformed or belongs to the other environment.
    BadDeviceToken,
    /// The device token does not match the specified topic.
    DeviceTokenNotForTopic,
    /// The device token is inactive for the specified topic.
    Unregistered,
    /// One or more headers were repeated.
    DuplicateHeaders,
    /// The client certificate was for the wrong environment.
    BadCertificateEnvironment,
    /// The certificate was bad.
    BadCertificate,
    /// The specified action is not allowed.
    Forbidden,
    /// The request contained a bad path.
    BadPath,
    /// The specified method was not `POST`.
    MethodNotAllowed,
    /// Too many requests were made consecutively to the same device token.
    TooManyRequests,
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
    InternalServerError,
    ServiceUnavailable,
    /// The `apns-topic` header was required but not specified.
    MissingTopic,
    /// A reason this client does not know. The raw string is kept for diagnostics.
    Unclassified(String),
}

impl Reason {
    /// Classifies a raw reason string. Never fails: unknown strings become
    /// [`Reason::Unclassified`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PayloadEmpty" => Self::PayloadEmpty,
            "PayloadTooLarge" => Self::PayloadTooLarge,
            "BadTopic" => Self::BadTopic,
            "TopicDisallowed" => Self::TopicDisallowed,
            "BadMessageId" => Self::BadMessageId,
            "BadExpirationDate" => Self::BadExpirationDate,
            "BadPriority" => Self::BadPriority,
            "MissingDeviceToken" => Self::MissingDeviceToken,
            "BadDeviceToken" => Self::BadDeviceToken,
            "DeviceTokenNotForTopic" => Self::DeviceTokenNotForTopic,
            "Unregistered" => Self::Unregistered,
            "DuplicateHeaders" => Self::DuplicateHeaders,
            "BadCertificateEnvironment" => Self::BadCertificateEnvironment,
            "BadCertificate" => Self::BadCertificate,
            "Forbidden" => Self::Forbidden,
            "BadPath" => Self::BadPath,
            "MethodNotAllowed" => Self::MethodNotAllowed,
            "TooManyRequests" => Self::TooManyRequests,
            "IdleTimeout" => Self::IdleTimeout,
            "Shutdown" => Self::Shutdown,
            "InternalServerError" => Self::InternalServerError,
            "ServiceUnavailable" => Self::ServiceUnavailable,
            "MissingTopic" => Self::MissingTopic,
            other => Self::Unclassified(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PayloadEmpty => "PayloadEmpty",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::BadTopic => "BadTopic",
            Self::TopicDisallowed => "TopicDisallowed",
            Self::BadMessageId => "BadMessageId",
            Self::BadExpirationDate => "BadExpirationDate",
            Self::BadPriority => "BadPriority",
            Self::MissingDeviceToken => "MissingDeviceToken",
            Self::BadDeviceToken => "BadDeviceToken",
            Self::DeviceTokenNotForTopic => "DeviceTokenNotForTopic",
            Self::Unregistered => "Unregistered",
            Self::DuplicateHeaders => "DuplicateHeaders",
            Self::BadCertificateEnvironment => "BadCertificateEnvironment",
            Self::BadCertificate => "BadCertificate",
            Self::Forbidden => "Forbidden",
            Self::BadPath => "BadPath",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::TooManyRequests => "TooManyRequests",
            Self::IdleTimeout => "IdleTimeout",
            Self::Shutdown => "Shutdown",
            Self::InternalServerError => "InternalServerError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::MissingTopic => "MissingTopic",
            Self::Unclassified(raw) => raw,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct DebugData {
    reason: Option<String>,
}

/// Indicates the gateway has initiated a termination of the connection.
///
/// A `GoAway` applies to the whole connection; it carries no per-request
/// correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub reason: Reason,
    /// When the termination was observed.
    pub timestamp: OffsetDateTime,
}

impl GoAway {
    #[must_use]
    pub const fn new(reason: Reason, timestamp: OffsetDateTime) -> Self {
        Self { reason, timestamp }
    }

    /// Decodes the debug data attached to a GOAWAY frame (`{"reason": "..."}`).
    ///
    /// Empty or malformed debug data yields [`Reason::Unclassified`] carrying
    /// `fallback`, so the caller still gets a terminal signal to act on.
    #[must_use]
    pub fn decode(debug_data: &[u8], fallback: &str, received_at: OffsetDateTime) -> Self {
        let reason = serde_json::from_slice::<DebugData>(debug_data)
            .ok()
            .and_then(|data| data.reason)
            .map_or_else(|| Reason::Unclassified(fallback.to_string()), |raw| Reason::parse(&raw));

        Self::new(reason, received_at)
    }
}

impl fmt::Display for GoAway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.reason, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_roundtrip_for_known_names() {
        for name in ["IdleTimeout", "Shutdown", "BadDeviceToken", "MissingTopic", "Unregistered"] {
            let reason = Reason::parse(name);
            assert!(!matches!(reason, Reason::Unclassified(_)), "{name} should be classified");
            assert_eq!(reason.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_reason_is_preserved() {
        let reason = Reason::parse("SomethingNew");
        assert_eq!(reason, Reason::Unclassified("SomethingNew".to_string()));
        assert_eq!(reason.to_string(), "SomethingNew");
    }

    #[test]
    fn test_decode_goaway_debug_data() {
        let now = OffsetDateTime::now_utc();
        let goaway = GoAway::decode(br#"{"reason":"IdleTimeout"}"#, "NO_ERROR", now);
        assert_eq!(goaway.reason, Reason::IdleTimeout);
        assert_eq!(goaway.timestamp, now);
    }

    #[test]
    fn test_decode_goaway_without_debug_data() {
        let now = OffsetDateTime::now_utc();
        let goaway = GoAway::decode(b"", "NO_ERROR", now);
        assert_eq!(goaway.reason, Reason::Unclassified("NO_ERROR".to_string()));

        let goaway = GoAway::decode(b"not json", "PROTOCOL_ERROR", now);
        assert_eq!(goaway.reason, Reason::Unclassified("PROTOCOL_ERROR".to_string()));
    }
}
