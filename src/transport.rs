//! The secured, stream-multiplexed transport that a [`crate::connection::Connection`]
//! runs on. The connection core only needs to open a session, write requests
//! tagged with a correlation id, and receive tagged replies or connection-level
//! signals; the production implementation lives in [`crate::adapters::push::Http2Transport`].

use crate::credential::Credential;
use crate::error::{ConnectionError, TransportError};
use crate::request::WireRequest;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Correlation id tying an inbound reply to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Network address of a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in '{s}'"));
        }
        let port = port.parse().map_err(|e| format!("invalid port in '{s}': {e}"))?;
        Ok(Self::new(host, port))
    }
}

/// Something the session delivers back to the connection.
#[derive(Debug)]
pub enum InboundEvent {
    /// A complete reply to the request written under `stream`.
    Reply { stream: StreamId, status: u16, headers: HeaderMap, body: Bytes },
    /// The stream was reset without a reply. Other streams are unaffected.
    StreamFailed { stream: StreamId, error: TransportError },
    /// The gateway is terminating the session. `code` is the transport's
    /// error code name, used when the debug data carries no reason.
    GoAway { debug_data: Bytes, code: String },
    /// The session ended. `None` means an orderly close.
    Closed { error: Option<TransportError> },
}

/// Write half of a session. Owned by a single writer task, so implementations
/// never see concurrent calls.
#[async_trait]
pub trait SessionWriter: Send + fmt::Debug {
    /// Writes a request onto the session under the given correlation id. The
    /// reply arrives later as an [`InboundEvent`].
    ///
    /// # Errors
    /// Returns an error if the session can no longer accept requests.
    async fn write(&mut self, stream: StreamId, request: WireRequest) -> Result<(), TransportError>;

    /// Abandons a written request. No reply is expected afterwards.
    fn cancel(&mut self, stream: StreamId);

    /// Tears the session down.
    async fn close(&mut self);
}

/// An established session: the write half plus the inbound event stream.
#[derive(Debug)]
pub struct Session {
    pub writer: Box<dyn SessionWriter>,
    pub inbound: mpsc::Receiver<InboundEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Establishes an authenticated session with the gateway.
    ///
    /// # Errors
    /// Returns a [`ConnectionError`] if the session cannot be established.
    async fn open(&self, endpoint: &Endpoint, credential: &Credential) -> Result<Session, ConnectionError>;
}
