use crate::goaway::Reason;
use crate::request::HEADER_ID;
use http::HeaderMap;
use serde::Deserialize;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Per-request status reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    BadRequest,
    /// There was an error with the certificate or provider token.
    CertificateError,
    /// Only `POST` requests are supported.
    MethodNotAllowed,
    /// The device token is no longer active for the topic.
    Unregistered,
    PayloadTooLarge,
    /// Too many requests for the same device token.
    TooManyRequests,
    InternalServerError,
    /// The server is shutting down and unavailable.
    ServiceUnavailable,
    /// A code outside the documented taxonomy.
    Unclassified(u16),
}

impl Status {
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            200 => Self::Success,
            400 => Self::BadRequest,
            403 => Self::CertificateError,
            405 => Self::MethodNotAllowed,
            410 => Self::Unregistered,
            413 => Self::PayloadTooLarge,
            429 => Self::TooManyRequests,
            500 => Self::InternalServerError,
            503 => Self::ServiceUnavailable,
            other => Self::Unclassified(other),
        }
    }

    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::CertificateError => 403,
            Self::MethodNotAllowed => 405,
            Self::Unregistered => 410,
            Self::PayloadTooLarge => 413,
            Self::TooManyRequests => 429,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::Unclassified(code) => code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A notification the gateway refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: Status,
    pub reason: Reason,
    /// For [`Status::Unregistered`]: the last time the gateway confirmed the
    /// token was no longer valid for the topic.
    pub timestamp: Option<OffsetDateTime>,
    pub id: Option<Uuid>,
}

impl Rejection {
    /// Only throttling and server-side availability failures are worth a retry;
    /// everything else describes the notification itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.status, Status::TooManyRequests | Status::InternalServerError | Status::ServiceUnavailable)
    }
}

/// The gateway's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The gateway accepted the notification. Carries the client-supplied or
    /// server-assigned id.
    Accepted { id: Option<Uuid> },
    Rejected(Rejection),
}

impl Response {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Accepted { .. } => false,
            Self::Rejected(rejection) => rejection.is_retryable(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Option<Uuid> {
        match self {
            Self::Accepted { id } => *id,
            Self::Rejected(rejection) => rejection.id,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    reason: Option<String>,
    /// Milliseconds since the Unix epoch.
    timestamp: Option<i64>,
}

/// Decodes a per-request reply. Total: unknown codes and unreadable bodies
/// produce an unclassified rejection and never a success.
#[must_use]
pub fn decode(status: u16, headers: &HeaderMap, body: &[u8]) -> Response {
    let id = headers.get(HEADER_ID).and_then(|v| v.to_str().ok()).and_then(|s| Uuid::parse_str(s).ok());

    let status = Status::from_code(status);
    if status == Status::Success {
        return Response::Accepted { id };
    }

    let parsed = serde_json::from_slice::<ErrorBody>(body).ok();
    let reason = match parsed.as_ref().and_then(|b| b.reason.as_deref()) {
        Some(raw) => Reason::parse(raw),
        None => Reason::Unclassified(String::from_utf8_lossy(body).into_owned()),
    };
    let timestamp = if status == Status::Unregistered {
        parsed
            .and_then(|b| b.timestamp)
            .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok())
    } else {
        None
    };

    Response::Rejected(Rejection { status, reason, timestamp, id })
}
