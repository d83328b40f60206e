use crate::goaway::GoAway;
use thiserror::Error;

/// A notification rejected before any wire interaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Device token is empty or not usable in a request path")]
    InvalidDeviceToken,
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Payload is {size} bytes, maximum is {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Topic must not be empty")]
    InvalidTopic,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to read PEM data: {0}")]
    Pem(#[from] std::io::Error),
    #[error("No certificate found in PEM data")]
    MissingCertificate,
    #[error("No private key found in PEM data")]
    MissingKey,
    #[error("Certificate and key do not form a usable identity: {0}")]
    InvalidIdentity(String),
    #[error("Failed to sign provider token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Failure to establish a session with the gateway.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Gateway rejected the credential: {0}")]
    AuthRejected(String),
    #[error("Gateway unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Timed out opening connection")]
    Timeout,
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl ConnectionError {
    /// Whether another attempt to open the session may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Handshake(_) | Self::Timeout)
    }
}

/// Failure of a live session or of a single stream on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Session write failed: {0}")]
    Write(String),
    #[error("Stream failed: {0}")]
    Stream(String),
    #[error("Session closed: {0}")]
    Closed(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The session refused a new stream because the peer sent GOAWAY. The
    /// GOAWAY itself arrives as an inbound event.
    #[error("Session going away: {0}")]
    GoingAway(String),
}

/// Why a connection stopped accepting work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    #[error("gateway sent GOAWAY ({0})")]
    GoAway(GoAway),
    #[error("{0}")]
    Transport(TransportError),
    #[error("connection closed")]
    Closed,
}

/// The caller-facing error of a send. Per-request server errors are not
/// represented here; they arrive as [`crate::response::Response::Rejected`].
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Connect(#[from] ConnectionError),
    #[error("Connection terminated: {0}")]
    Terminated(Termination),
    #[error("Stream reset: {0}")]
    StreamReset(TransportError),
    #[error("Send cancelled")]
    Cancelled,
}

impl SendError {
    /// Whether the caller may safely resend the same notification on a new
    /// connection.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Terminated(_) => true,
            Self::StreamReset(e) => !matches!(e, TransportError::InvalidRequest(_)),
            Self::Connect(e) => e.is_transient(),
            Self::Validation(_) | Self::Cancelled => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SendError>;
