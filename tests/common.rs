#![allow(dead_code)]

use apns_dispatch::credential::Credential;
use apns_dispatch::error::{ConnectionError, TransportError};
use apns_dispatch::provider::{Provider, ProviderOptions, Server};
use apns_dispatch::request::{HEADER_ID, WireRequest};
use apns_dispatch::transport::{Endpoint, InboundEvent, Session, SessionWriter, StreamId, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;

static INIT: Once = Once::new();

const WAIT: Duration = Duration::from_secs(5);

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("apns_dispatch=debug".parse().unwrap())
            .add_directive("h2=warn".parse().unwrap())
            .add_directive("rustls=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().init();
    });
}

pub fn token_credential() -> Credential {
    Credential::token("TEAM123456", "KEY1234567", include_bytes!("fixtures/signing_key.p8")).unwrap()
}

/// What the connection did to a mock session's write half.
#[derive(Debug)]
pub enum Written {
    Request(StreamId, WireRequest),
    Cancel(StreamId),
    Close,
}

#[derive(Debug)]
struct MockWriter {
    written: mpsc::UnboundedSender<Written>,
}

#[async_trait]
impl SessionWriter for MockWriter {
    async fn write(&mut self, stream: StreamId, request: WireRequest) -> Result<(), TransportError> {
        self.written
            .send(Written::Request(stream, request))
            .map_err(|_| TransportError::Write("gateway gone".to_string()))
    }

    fn cancel(&mut self, stream: StreamId) {
        let _ = self.written.send(Written::Cancel(stream));
    }

    async fn close(&mut self) {
        let _ = self.written.send(Written::Close);
    }
}

/// In-memory gateway transport. Every successful open hands the test a
/// [`MockSession`] through the paired [`MockGateway`].
#[derive(Debug)]
pub struct MockTransport {
    opens: AtomicUsize,
    failures: Mutex<VecDeque<ConnectionError>>,
    sessions: mpsc::UnboundedSender<MockSession>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, MockGateway) {
        let (sessions, session_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self { opens: AtomicUsize::new(0), failures: Mutex::new(VecDeque::new()), sessions });
        (Arc::clone(&transport), MockGateway { transport, sessions: session_rx })
    }

    /// Number of open attempts, successful or not.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Makes the next open attempt fail with `error`.
    pub fn fail_next_open(&self, error: ConnectionError) {
        self.failures.lock().push_back(error);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, endpoint: &Endpoint, _credential: &Credential) -> Result<Session, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (written, written_rx) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::channel(64);
        let _ = self.sessions.send(MockSession { endpoint: endpoint.clone(), written: written_rx, events });
        Ok(Session { writer: Box::new(MockWriter { written }), inbound })
    }
}

#[derive(Debug)]
pub struct MockGateway {
    pub transport: Arc<MockTransport>,
    sessions: mpsc::UnboundedReceiver<MockSession>,
}

impl MockGateway {
    pub async fn next_session(&mut self) -> MockSession {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }

    pub fn provider(&self) -> Provider {
        self.provider_with(ProviderOptions::default())
    }

    pub fn provider_with(&self, options: ProviderOptions) -> Provider {
        let transport: Arc<dyn Transport> = Arc::clone(&self.transport) as Arc<dyn Transport>;
        Provider::with_options(Server::Development, token_credential(), transport, options)
    }
}

/// The gateway side of one open session.
#[derive(Debug)]
pub struct MockSession {
    pub endpoint: Endpoint,
    written: mpsc::UnboundedReceiver<Written>,
    events: mpsc::Sender<InboundEvent>,
}

impl MockSession {
    pub async fn next_written(&mut self) -> Written {
        tokio::time::timeout(WAIT, self.written.recv())
            .await
            .expect("timed out waiting for the connection to write")
            .expect("connection writer gone")
    }

    pub async fn next_request(&mut self) -> (StreamId, WireRequest) {
        match self.next_written().await {
            Written::Request(stream, request) => (stream, request),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    pub async fn reply(&self, stream: StreamId, status: u16, apns_id: Option<&str>, body: &str) {
        let mut headers = HeaderMap::new();
        if let Some(id) = apns_id {
            headers.insert(HEADER_ID, HeaderValue::from_str(id).unwrap());
        }
        self.send(InboundEvent::Reply { stream, status, headers, body: Bytes::copy_from_slice(body.as_bytes()) })
            .await;
    }

    pub async fn accept(&self, stream: StreamId) {
        self.reply(stream, 200, None, "").await;
    }

    pub async fn goaway(&self, debug_data: &str) {
        self.send(InboundEvent::GoAway {
            debug_data: Bytes::copy_from_slice(debug_data.as_bytes()),
            code: "NO_ERROR".to_string(),
        })
        .await;
    }

    pub async fn fail_stream(&self, stream: StreamId, error: TransportError) {
        self.send(InboundEvent::StreamFailed { stream, error }).await;
    }

    pub async fn drop_session(&self, error: Option<TransportError>) {
        self.send(InboundEvent::Closed { error }).await;
    }

    async fn send(&self, event: InboundEvent) {
        self.events.send(event).await.expect("connection reader gone");
    }
}
