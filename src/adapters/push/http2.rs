use crate::credential::Credential;
use crate::error::{ConnectionError, CredentialError, TransportError};
use crate::request::{METHOD, WireRequest};
use crate::transport::{Endpoint, InboundEvent, Session, SessionWriter, StreamId, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use http::HeaderMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, pki_types::ServerName};
use tracing::Instrument;

const ALPN_H2: &[u8] = b"h2";

/// Gateway transport over TLS with HTTP/2 multiplexing.
#[derive(Debug, Clone)]
pub struct Http2Transport {
    event_capacity: usize,
}

impl Default for Http2Transport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Http2Transport {
    #[must_use]
    pub const fn new(event_capacity: usize) -> Self {
        Self { event_capacity }
    }
}

fn tls_config(credential: &Credential) -> Result<ClientConfig, ConnectionError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?
        .with_root_certificates(roots);

    let mut config = match credential {
        Credential::Certificate(identity) => builder
            .with_client_auth_cert(identity.chain(), identity.key())
            .map_err(|e| CredentialError::InvalidIdentity(e.to_string()))?,
        Credential::Token(_) => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}

/// An alert from the gateway during the handshake means it refused our identity.
fn classify_tls_error(e: std::io::Error) -> ConnectionError {
    if let Some(rustls::Error::AlertReceived(alert)) =
        e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return ConnectionError::AuthRejected(format!("{alert:?}"));
    }
    ConnectionError::Handshake(e.to_string())
}

fn reason_name(e: &h2::Error) -> String {
    e.reason().map_or_else(|| "UNKNOWN".to_string(), |reason| format!("{reason:?}"))
}

#[async_trait]
impl Transport for Http2Transport {
    #[tracing::instrument(skip(self, endpoint, credential), fields(endpoint = %endpoint))]
    async fn open(&self, endpoint: &Endpoint, credential: &Credential) -> Result<Session, ConnectionError> {
        let config = tls_config(credential)?;
        let server_name =
            ServerName::try_from(endpoint.host.clone()).map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        let tcp =
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await.map_err(ConnectionError::Unreachable)?;
        let tls = TlsConnector::from(Arc::new(config)).connect(server_name, tcp).await.map_err(classify_tls_error)?;
        if tls.get_ref().1.alpn_protocol() != Some(ALPN_H2) {
            return Err(ConnectionError::Handshake("gateway did not negotiate HTTP/2".to_string()));
        }

        let (send_request, connection) =
            h2::client::handshake(tls).await.map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        tracing::debug!("HTTP/2 session established");

        let (events, inbound) = mpsc::channel(self.event_capacity);
        let closing = Arc::new(AtomicBool::new(false));

        let driver_events = events.clone();
        let driver_closing = Arc::clone(&closing);
        let driver = tokio::spawn(
            async move {
                let event = match connection.await {
                    // The peer finished a graceful GOAWAY without us asking to close.
                    Ok(()) if !driver_closing.load(Ordering::Acquire) => {
                        InboundEvent::GoAway { debug_data: Bytes::new(), code: "NO_ERROR".to_string() }
                    }
                    Ok(()) => InboundEvent::Closed { error: None },
                    // h2 does not surface GOAWAY debug data, only the error code.
                    Err(e) if e.is_go_away() => InboundEvent::GoAway { debug_data: Bytes::new(), code: reason_name(&e) },
                    Err(e) => InboundEvent::Closed { error: Some(TransportError::Closed(e.to_string())) },
                };
                let _ = driver_events.send(event).await;
            }
            .instrument(tracing::debug_span!("http2_driver")),
        );

        let writer = Http2Writer {
            send_request,
            authority: endpoint.authority(),
            credential: credential.clone(),
            events,
            streams: Arc::new(DashMap::new()),
            driver: driver.abort_handle(),
            closing,
        };

        Ok(Session { writer: Box::new(writer), inbound })
    }
}

#[derive(Debug)]
struct Http2Writer {
    send_request: h2::client::SendRequest<Bytes>,
    authority: String,
    credential: Credential,
    events: mpsc::Sender<InboundEvent>,
    // Reply readers for streams still awaiting a response.
    streams: Arc<DashMap<StreamId, AbortHandle>>,
    driver: AbortHandle,
    closing: Arc<AtomicBool>,
}

fn build_request(authority: &str, request: &WireRequest, bearer: Option<&str>) -> Result<http::Request<()>, TransportError> {
    let mut builder = http::Request::builder().method(METHOD).uri(format!("https://{authority}{}", request.path));
    for (name, value) in request.headers.to_pairs() {
        builder = builder.header(name, value);
    }
    if let Some(token) = bearer {
        builder = builder.header(http::header::AUTHORIZATION, format!("bearer {token}"));
    }
    builder.body(()).map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

async fn collect_reply(response: h2::client::ResponseFuture) -> Result<(u16, HeaderMap, Bytes), h2::Error> {
    let (parts, mut body) = response.await?.into_parts();
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        buf.extend_from_slice(&chunk);
    }
    Ok((parts.status.as_u16(), parts.headers, buf.freeze()))
}

async fn read_reply(stream: StreamId, response: h2::client::ResponseFuture) -> InboundEvent {
    match collect_reply(response).await {
        Ok((status, headers, body)) => InboundEvent::Reply { stream, status, headers, body },
        Err(e) if e.is_go_away() => InboundEvent::GoAway { debug_data: Bytes::new(), code: reason_name(&e) },
        Err(e) => InboundEvent::StreamFailed { stream, error: TransportError::Stream(e.to_string()) },
    }
}

impl Http2Writer {
    /// Classifies a failure to open a stream. After a GOAWAY the session
    /// refuses new streams; the GOAWAY is reported so the connection drains
    /// with it as the cause.
    fn write_error(&self, e: &h2::Error) -> TransportError {
        if !e.is_go_away() {
            return TransportError::Write(e.to_string());
        }
        let code = reason_name(e);
        let _ = self.events.try_send(InboundEvent::GoAway { debug_data: Bytes::new(), code: code.clone() });
        TransportError::GoingAway(code)
    }
}

/// Runs a reply reader for `stream`, keeping its abort handle in `streams`
/// until the reader has its event.
fn spawn_reader<F>(
    streams: &Arc<DashMap<StreamId, AbortHandle>>,
    events: mpsc::Sender<InboundEvent>,
    stream: StreamId,
    reader: F,
) where
    F: Future<Output = InboundEvent> + Send + 'static,
{
    let (registered, gate) = oneshot::channel::<()>();
    let tracked = Arc::clone(streams);
    let task = tokio::spawn(
        async move {
            let event = reader.await;
            // Removal must not overtake the insertion below.
            let _ = gate.await;
            tracked.remove(&stream);
            let _ = events.send(event).await;
        }
        .instrument(tracing::trace_span!("http2_stream", %stream)),
    );
    streams.insert(stream, task.abort_handle());
    let _ = registered.send(());
}

#[async_trait]
impl SessionWriter for Http2Writer {
    async fn write(&mut self, stream: StreamId, request: WireRequest) -> Result<(), TransportError> {
        let bearer = self.credential.bearer().map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let http_request = build_request(&self.authority, &request, bearer.as_deref())?;

        let mut ready = self.send_request.clone().ready().await.map_err(|e| self.write_error(&e))?;
        let (response, mut body) = ready.send_request(http_request, false).map_err(|e| self.write_error(&e))?;
        body.send_data(request.payload, true).map_err(|e| self.write_error(&e))?;

        spawn_reader(&self.streams, self.events.clone(), stream, read_reply(stream, response));
        Ok(())
    }

    fn cancel(&mut self, stream: StreamId) {
        // Dropping the response future resets the stream.
        if let Some((_, reader)) = self.streams.remove(&stream) {
            reader.abort();
        }
    }

    async fn close(&mut self) {
        self.closing.store(true, Ordering::Release);
        for entry in self.streams.iter() {
            entry.value().abort();
        }
        self.streams.clear();
        self.driver.abort();
        tracing::debug!(authority = %self.authority, "HTTP/2 session closed");
    }
}
