use crate::connection::{Connection, Outcome, PendingResponse};
use crate::credential::Credential;
use crate::error::{ConnectionError, Result, SendError};
use crate::notification::{MAX_PAYLOAD_SIZE, Notification};
use crate::request::to_wire_request;
use crate::response::Response;
use crate::transport::{Endpoint, Transport};
use backon::{ExponentialBuilder, Retryable};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEVELOPMENT_HOST: &str = "api.development.push.apple.com";
pub const PRODUCTION_HOST: &str = "api.push.apple.com";
pub const GATEWAY_PORT: u16 = 443;

/// Which gateway environment a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Server {
    Development,
    Production,
}

impl Server {
    #[must_use]
    pub fn endpoint(self) -> Endpoint {
        match self {
            Self::Development => Endpoint::new(DEVELOPMENT_HOST, GATEWAY_PORT),
            Self::Production => Endpoint::new(PRODUCTION_HOST, GATEWAY_PORT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Replaces the environment's gateway address, e.g. for a local test
    /// gateway. Still fixed for the life of the provider.
    pub endpoint_override: Option<Endpoint>,
    /// Total attempts for a transient open failure before giving up.
    pub connect_attempts: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    pub max_payload_size: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            endpoint_override: None,
            connect_attempts: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
struct Metrics {
    sends_total: Counter<u64>,
    connections_opened: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("apns-dispatch");
        Self {
            sends_total: meter
                .u64_counter("apns_sends_total")
                .with_description("Notification sends by outcome")
                .build(),
            connections_opened: meter
                .u64_counter("apns_connections_opened_total")
                .with_description("Gateway connections opened")
                .build(),
        }
    }

    fn record(&self, outcome: &Outcome) {
        let label = match outcome {
            Ok(Response::Accepted { .. }) => "accepted",
            Ok(Response::Rejected(_)) => "rejected",
            Err(SendError::Validation(_)) => "invalid",
            Err(SendError::Connect(_)) => "connect_failed",
            Err(SendError::Terminated(_) | SendError::StreamReset(_)) => "terminated",
            Err(SendError::Cancelled) => "cancelled",
        };
        self.sends_total.add(1, &[KeyValue::new("outcome", label)]);
    }
}

/// Sends notifications to one gateway environment, keeping at most one live
/// connection open.
///
/// The connection is opened on first use. When it terminates (GOAWAY or
/// transport failure) it is discarded and the next send opens a fresh one;
/// nothing reconnects in the background. Sends that failed with a
/// terminated connection are never resubmitted here, since the gateway may
/// already have delivered them; see [`SendError::is_retryable`].
#[derive(Debug)]
pub struct Provider {
    server: Server,
    endpoint: Endpoint,
    credential: Credential,
    transport: Arc<dyn Transport>,
    options: ProviderOptions,
    connection: Mutex<Option<Arc<Connection>>>,
    metrics: Metrics,
}

impl Provider {
    pub fn new(server: Server, credential: Credential, transport: Arc<dyn Transport>) -> Self {
        Self::with_options(server, credential, transport, ProviderOptions::default())
    }

    pub fn with_options(
        server: Server,
        credential: Credential,
        transport: Arc<dyn Transport>,
        options: ProviderOptions,
    ) -> Self {
        let endpoint = options.endpoint_override.clone().unwrap_or_else(|| server.endpoint());
        Self {
            server,
            endpoint,
            credential,
            transport,
            options,
            connection: Mutex::new(None),
            metrics: Metrics::new(),
        }
    }

    #[must_use]
    pub const fn server(&self) -> Server {
        self.server
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends a notification and waits for the gateway's answer.
    ///
    /// A server-side refusal is an `Ok(Response::Rejected(_))`; `Err` is
    /// reserved for validation, connection and cancellation failures.
    ///
    /// # Errors
    /// See [`SendError`].
    #[tracing::instrument(skip(self, notification), fields(device_token = %notification.device_token()))]
    pub async fn send(&self, notification: &Notification) -> Result<Response> {
        let outcome = match self.dispatch(notification).await {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(response) => tracing::debug!(?response, "Send completed"),
            Err(e) => tracing::debug!(error = %e, retryable = e.is_retryable(), "Send failed"),
        }
        self.metrics.record(&outcome);
        outcome
    }

    /// Validates and admits a notification without waiting for the reply,
    /// opening a connection first if none is live. Dropping the returned
    /// handle cancels the send.
    ///
    /// # Errors
    /// Returns [`SendError::Validation`] or [`SendError::Connect`]; nothing
    /// reaches the wire in either case.
    pub async fn dispatch(&self, notification: &Notification) -> Result<PendingResponse> {
        if let Err(e) = notification.validate(self.options.max_payload_size) {
            tracing::debug!(error = %e, "Notification rejected before dispatch");
            return Err(e.into());
        }

        let request = to_wire_request(notification);
        let connection = self.connection().await?;
        Ok(connection.submit(request))
    }

    /// Opens the connection ahead of the first send. A live connection is
    /// reused and a draining one is replaced, so at most one is ever held.
    ///
    /// # Errors
    /// Returns a [`ConnectionError`] if the session cannot be established.
    pub async fn connect(&self) -> std::result::Result<(), ConnectionError> {
        self.connection().await.map(|_| ())
    }

    /// Closes the live connection, if any. Pending sends fail as terminated.
    /// A later send opens a new connection.
    pub async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close();
            tracing::info!(endpoint = %self.endpoint, "Provider connection closed");
        }
    }

    /// Whether a live, non-draining connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.as_ref().is_some_and(|c| !c.is_draining())
    }

    async fn connection(&self) -> std::result::Result<Arc<Connection>, ConnectionError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if !connection.is_draining() {
                return Ok(Arc::clone(connection));
            }
            tracing::debug!(cause = ?connection.termination(), "Discarding terminated connection");
        }
        *slot = None;

        let connection = Arc::new(self.open().await?);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn open(&self) -> std::result::Result<Connection, ConnectionError> {
        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(self.options.min_backoff)
            .with_max_delay(self.options.max_backoff)
            .with_max_times(self.options.connect_attempts.saturating_sub(1));

        let connection = (|| async move {
            tokio::time::timeout(
                self.options.connect_timeout,
                Connection::open(self.transport.as_ref(), &self.endpoint, &self.credential),
            )
            .await
            .map_err(|_| ConnectionError::Timeout)?
        })
        .retry(retry_strategy)
        .when(ConnectionError::is_transient)
        .notify(|e, delay| {
            tracing::warn!(error = %e, ?delay, "Failed to open connection, retrying");
        })
        .await?;

        self.metrics.connections_opened.add(1, &[]);
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Session;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct RefusingTransport {
        attempts: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn open(&self, _endpoint: &Endpoint, _credential: &Credential) -> std::result::Result<Session, ConnectionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.transient {
                Err(ConnectionError::Handshake("connection reset".to_string()))
            } else {
                Err(ConnectionError::AuthRejected("bad certificate".to_string()))
            }
        }
    }

    fn provider(transport: Arc<RefusingTransport>) -> Provider {
        let options = ProviderOptions {
            connect_attempts: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..ProviderOptions::default()
        };
        let credential =
            Credential::token("TEAM123456", "KEY1234567", include_bytes!("../tests/fixtures/signing_key.p8")).unwrap();
        Provider::with_options(Server::Development, credential, transport, options)
    }

    #[test]
    fn test_server_endpoints_are_fixed() {
        assert_eq!(Server::Development.endpoint(), Endpoint::new("api.development.push.apple.com", 443));
        assert_eq!(Server::Production.endpoint(), Endpoint::new("api.push.apple.com", 443));
    }

    #[tokio::test]
    async fn test_invalid_notification_never_opens_connection() {
        let transport = Arc::new(RefusingTransport { attempts: AtomicUsize::new(0), transient: false });
        let provider = provider(Arc::clone(&transport));
        let notification = Notification::builder("abc", vec![b'a'; MAX_PAYLOAD_SIZE + 1])
            .max_payload_size(usize::MAX)
            .build()
            .unwrap();

        let result = provider.send(&notification).await;
        assert!(matches!(result, Err(SendError::Validation(_))));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_not_retried() {
        let transport = Arc::new(RefusingTransport { attempts: AtomicUsize::new(0), transient: false });
        let provider = provider(Arc::clone(&transport));
        let notification = Notification::builder("abc", &b"{}"[..]).build().unwrap();

        let err = provider.send(&notification).await.unwrap_err();
        assert!(matches!(err, SendError::Connect(ConnectionError::AuthRejected(_))));
        assert!(!err.is_retryable());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert!(!provider.is_connected().await);
    }

    #[tokio::test]
    async fn test_transient_open_failure_is_retried() {
        let transport = Arc::new(RefusingTransport { attempts: AtomicUsize::new(0), transient: true });
        let provider = provider(Arc::clone(&transport));
        let notification = Notification::builder("abc", &b"{}"[..]).build().unwrap();

        let err = provider.send(&notification).await.unwrap_err();
        assert!(matches!(err, SendError::Connect(ConnectionError::Handshake(_))));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }
}
