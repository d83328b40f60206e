use crate::credential::Credential;
use crate::error::{ConnectionError, SendError, Termination, TransportError};
use crate::goaway::GoAway;
use crate::request::WireRequest;
use crate::response::{self, Response};
use crate::transport::{Endpoint, InboundEvent, Session, SessionWriter, StreamId, Transport};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, UpDownCounter},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

/// What a pending request eventually resolves to.
pub type Outcome = Result<Response, SendError>;

#[derive(Clone, Debug)]
struct Metrics {
    inflight: UpDownCounter<i64>,
    goaways: Counter<u64>,
    orphan_replies: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("apns-dispatch");
        Self {
            inflight: meter
                .i64_up_down_counter("apns_inflight_requests")
                .with_description("Requests written to a connection and awaiting a reply")
                .build(),
            goaways: meter
                .u64_counter("apns_goaway_total")
                .with_description("GOAWAY signals received from the gateway")
                .build(),
            orphan_replies: meter
                .u64_counter("apns_orphan_replies_total")
                .with_description("Replies discarded because no request was waiting for them")
                .build(),
        }
    }
}

#[derive(Debug)]
enum State {
    Open,
    Draining(Termination),
}

/// The correlation map and the state that gates it. Insert, remove and
/// bulk-clear all happen under the same lock.
#[derive(Debug)]
struct Inflight {
    state: State,
    next_stream: u64,
    pending: HashMap<StreamId, oneshot::Sender<Outcome>>,
}

#[derive(Debug)]
struct Shared {
    endpoint: Endpoint,
    inflight: Mutex<Inflight>,
    metrics: Metrics,
}

impl Shared {
    fn resolve(&self, stream: StreamId, outcome: Outcome) {
        let sender = self.inflight.lock().pending.remove(&stream);
        if let Some(tx) = sender {
            self.metrics.inflight.add(-1, &[]);
            let _ = tx.send(outcome);
        } else {
            tracing::warn!(stream = %stream, "Discarding reply with no pending request");
            self.metrics.orphan_replies.add(1, &[]);
        }
    }

    /// Moves the connection to draining and fails everything still pending.
    /// Returns how many requests were failed; zero if already draining.
    fn drain(&self, cause: Termination) -> usize {
        let drained = {
            let mut inflight = self.inflight.lock();
            if matches!(inflight.state, State::Draining(_)) {
                return 0;
            }
            inflight.state = State::Draining(cause.clone());
            std::mem::take(&mut inflight.pending)
        };

        let count = drained.len();
        self.metrics.inflight.add(-i64::try_from(count).unwrap_or(i64::MAX), &[]);
        for tx in drained.into_values() {
            let _ = tx.send(Err(SendError::Terminated(cause.clone())));
        }

        tracing::info!(endpoint = %self.endpoint, pending = count, cause = %cause, "Connection draining");
        count
    }

    fn cancel(&self, stream: StreamId) -> bool {
        let removed = self.inflight.lock().pending.remove(&stream).is_some();
        if removed {
            self.metrics.inflight.add(-1, &[]);
        }
        removed
    }

    fn is_pending(&self, stream: StreamId) -> bool {
        self.inflight.lock().pending.contains_key(&stream)
    }
}

#[derive(Debug)]
enum Command {
    Submit(StreamId, WireRequest),
    Cancel(StreamId),
    Close,
}

/// One multiplexed session with the gateway.
///
/// Requests are admitted synchronously by [`Connection::submit`] and written
/// in admission order by a writer task that owns the session's write half.
/// Replies are dispatched by a separate reader task, so a slow write never
/// holds up delivery of another request's reply.
///
/// Draining is terminal: once a GOAWAY, transport failure, or [`Connection::close`]
/// is observed, every pending request fails with [`SendError::Terminated`] and
/// later submits fail immediately.
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Opens a session through `transport` and starts serving it.
    ///
    /// # Errors
    /// Returns a [`ConnectionError`] if the session cannot be established.
    #[tracing::instrument(skip(transport, credential), fields(endpoint = %endpoint))]
    pub async fn open(
        transport: &dyn Transport,
        endpoint: &Endpoint,
        credential: &Credential,
    ) -> Result<Self, ConnectionError> {
        let session = transport.open(endpoint, credential).await?;
        tracing::info!("Connection established");
        Ok(Self::from_session(endpoint.clone(), session))
    }

    /// Serves an already established session. Must be called from within a
    /// Tokio runtime.
    #[must_use]
    pub fn from_session(endpoint: Endpoint, session: Session) -> Self {
        let span = tracing::info_span!("apns_connection", endpoint = %endpoint);
        let shared = Arc::new(Shared {
            endpoint,
            inflight: Mutex::new(Inflight { state: State::Open, next_stream: 1, pending: HashMap::new() }),
            metrics: Metrics::new(),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_outbound(Arc::clone(&shared), session.writer, command_rx).instrument(span.clone()));
        tokio::spawn(Self::run_inbound(Arc::clone(&shared), session.inbound, commands.clone()).instrument(span));

        Self { shared, commands }
    }

    /// Admits a request and returns a handle to await its outcome. Never
    /// blocks; on a draining connection the handle is already resolved with
    /// [`SendError::Terminated`].
    pub fn submit(&self, request: WireRequest) -> PendingResponse {
        let (tx, rx) = oneshot::channel();

        let mut inflight = self.shared.inflight.lock();
        if let State::Draining(cause) = &inflight.state {
            let _ = tx.send(Err(SendError::Terminated(cause.clone())));
            return PendingResponse::resolved(rx);
        }

        // Client-initiated streams use odd ids.
        let stream = StreamId::new(inflight.next_stream);
        inflight.next_stream += 2;
        inflight.pending.insert(stream, tx);

        // Enqueued under the lock so the writer sees ids in allocation order.
        if self.commands.send(Command::Submit(stream, request)).is_err() {
            let tx = inflight.pending.remove(&stream);
            drop(inflight);
            if let Some(tx) = tx {
                let cause = Termination::Transport(TransportError::Closed("writer stopped".to_string()));
                let _ = tx.send(Err(SendError::Terminated(cause)));
            }
            return PendingResponse::resolved(rx);
        }
        drop(inflight);

        self.shared.metrics.inflight.add(1, &[]);
        tracing::trace!(stream = %stream, "Request admitted");

        PendingResponse {
            stream: Some(stream),
            rx,
            shared: Arc::downgrade(&self.shared),
            commands: Some(self.commands.clone()),
            cancelled: false,
        }
    }

    /// Closes the connection. Pending requests fail with
    /// [`Termination::Closed`]; the session is torn down in the background.
    pub fn close(&self) {
        self.shared.drain(Termination::Closed);
        let _ = self.commands.send(Command::Close);
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(self.shared.inflight.lock().state, State::Draining(_))
    }

    /// Why the connection stopped, if it has.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        match &self.shared.inflight.lock().state {
            State::Open => None,
            State::Draining(cause) => Some(cause.clone()),
        }
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.inflight.lock().pending.len()
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    async fn run_outbound(
        shared: Arc<Shared>,
        mut writer: Box<dyn SessionWriter>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Submit(stream, request) => {
                    // Cancelled or drained before it reached the wire.
                    if !shared.is_pending(stream) {
                        continue;
                    }
                    match writer.write(stream, request).await {
                        Ok(()) => {}
                        // Left pending; the inbound GOAWAY drains it with the real cause.
                        Err(e @ TransportError::GoingAway(_)) => {
                            tracing::debug!(stream = %stream, error = %e, "Request not written, session going away");
                        }
                        Err(e @ TransportError::InvalidRequest(_)) => {
                            tracing::warn!(stream = %stream, error = %e, "Request refused by transport");
                            shared.resolve(stream, Err(SendError::StreamReset(e)));
                        }
                        Err(e) => {
                            tracing::error!(stream = %stream, error = %e, "Failed to write request");
                            shared.drain(Termination::Transport(e));
                            break;
                        }
                    }
                }
                Command::Cancel(stream) => writer.cancel(stream),
                Command::Close => break,
            }
        }

        writer.close().await;
        tracing::debug!("Connection writer stopped");
    }

    async fn run_inbound(
        shared: Arc<Shared>,
        mut inbound: mpsc::Receiver<InboundEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) {
        let cause = loop {
            let Some(event) = inbound.recv().await else {
                break Termination::Transport(TransportError::Closed("session ended".to_string()));
            };

            match event {
                InboundEvent::Reply { stream, status, headers, body } => {
                    tracing::debug!(stream = %stream, status, "Received reply");
                    shared.resolve(stream, Ok(response::decode(status, &headers, &body)));
                }
                InboundEvent::StreamFailed { stream, error } => {
                    tracing::debug!(stream = %stream, error = %error, "Stream failed");
                    shared.resolve(stream, Err(SendError::StreamReset(error)));
                }
                InboundEvent::GoAway { debug_data, code } => {
                    let goaway = GoAway::decode(&debug_data, &code, OffsetDateTime::now_utc());
                    tracing::warn!(reason = %goaway.reason, "Gateway sent GOAWAY");
                    shared.metrics.goaways.add(1, &[KeyValue::new("reason", goaway.reason.as_str().to_string())]);
                    break Termination::GoAway(goaway);
                }
                InboundEvent::Closed { error } => {
                    break Termination::Transport(
                        error.unwrap_or_else(|| TransportError::Closed("closed by peer".to_string())),
                    );
                }
            }
        };

        shared.drain(cause);
        let _ = commands.send(Command::Close);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to one submitted request. Resolves exactly once.
///
/// Dropping an unresolved handle cancels the request: its entry leaves the
/// correlation map and the transport is told to abandon the stream. Other
/// requests on the connection are unaffected.
#[derive(Debug)]
pub struct PendingResponse {
    stream: Option<StreamId>,
    rx: oneshot::Receiver<Outcome>,
    shared: Weak<Shared>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    cancelled: bool,
}

impl PendingResponse {
    fn resolved(rx: oneshot::Receiver<Outcome>) -> Self {
        Self { stream: None, rx, shared: Weak::new(), commands: None, cancelled: false }
    }

    /// The correlation id, while the request is still outstanding.
    #[must_use]
    pub const fn stream_id(&self) -> Option<StreamId> {
        self.stream
    }

    /// Cancels the request if it has not resolved yet. Returns `true` if it
    /// was cancelled, in which case awaiting the handle yields
    /// [`SendError::Cancelled`]. Returns `false` if an outcome is already
    /// waiting to be read.
    pub fn cancel(&mut self) -> bool {
        let Some(stream) = self.stream.take() else {
            return self.cancelled;
        };
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        if !shared.cancel(stream) {
            return false;
        }
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Cancel(stream));
        }
        tracing::debug!(stream = %stream, "Request cancelled");
        self.cancelled = true;
        true
    }
}

impl Future for PendingResponse {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancelled {
            return Poll::Ready(Err(SendError::Cancelled));
        }
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            // Every removal path sends before dropping the sender.
            Poll::Ready(Err(_)) => Err(SendError::Terminated(Termination::Closed)),
        };
        self.stream = None;
        Poll::Ready(outcome)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goaway::Reason;
    use crate::notification::Notification;
    use crate::request::{HEADER_ID, to_wire_request};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug)]
    enum Written {
        Request(StreamId, WireRequest),
        Cancel(StreamId),
        Close,
    }

    #[derive(Debug)]
    struct TestWriter {
        written: mpsc::UnboundedSender<Written>,
        fail_with: Option<TransportError>,
    }

    #[async_trait]
    impl SessionWriter for TestWriter {
        async fn write(&mut self, stream: StreamId, request: WireRequest) -> Result<(), TransportError> {
            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            let _ = self.written.send(Written::Request(stream, request));
            Ok(())
        }

        fn cancel(&mut self, stream: StreamId) {
            let _ = self.written.send(Written::Cancel(stream));
        }

        async fn close(&mut self) {
            let _ = self.written.send(Written::Close);
        }
    }

    struct Harness {
        connection: Connection,
        events: mpsc::Sender<InboundEvent>,
        written: mpsc::UnboundedReceiver<Written>,
    }

    impl Harness {
        fn new(fail_with: Option<TransportError>) -> Self {
            let (events, inbound) = mpsc::channel(64);
            let (written_tx, written) = mpsc::unbounded_channel();
            let session = Session { writer: Box::new(TestWriter { written: written_tx, fail_with }), inbound };
            let connection = Connection::from_session(Endpoint::new("gateway.test", 443), session);
            Self { connection, events, written }
        }

        async fn next_written(&mut self) -> Written {
            tokio::time::timeout(Duration::from_secs(5), self.written.recv()).await.unwrap().unwrap()
        }

        async fn next_request(&mut self) -> StreamId {
            match self.next_written().await {
                Written::Request(stream, _) => stream,
                other => panic!("expected request, got {other:?}"),
            }
        }

        async fn reply(&self, stream: StreamId, status: u16, id: Uuid) {
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_ID, HeaderValue::from_str(&id.to_string()).unwrap());
            self.events.send(InboundEvent::Reply { stream, status, headers, body: Bytes::new() }).await.unwrap();
        }
    }

    fn request() -> WireRequest {
        to_wire_request(&Notification::builder("abc", &b"{}"[..]).build().unwrap())
    }

    async fn resolve(pending: PendingResponse) -> Outcome {
        tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap()
    }

    #[tokio::test]
    async fn test_replies_resolve_their_own_requests_in_any_order() {
        let mut harness = Harness::new(None);

        let handles: Vec<_> = (0..3).map(|_| harness.connection.submit(request())).collect();
        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(harness.next_request().await);
        }
        assert_eq!(harness.connection.in_flight(), 3);

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (stream, id) in streams.iter().zip(&ids).rev() {
            harness.reply(*stream, 200, *id).await;
        }

        for (handle, id) in handles.into_iter().zip(ids) {
            let response = resolve(handle).await.unwrap();
            assert_eq!(response, Response::Accepted { id: Some(id) });
        }
        assert_eq!(harness.connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_orphan_reply_is_discarded() {
        let mut harness = Harness::new(None);
        let handle = harness.connection.submit(request());
        let stream = harness.next_request().await;

        harness.reply(StreamId::new(999), 200, Uuid::new_v4()).await;
        let id = Uuid::new_v4();
        harness.reply(stream, 200, id).await;

        assert_eq!(resolve(handle).await.unwrap().id(), Some(id));
        assert!(!harness.connection.is_draining());
    }

    #[tokio::test]
    async fn test_cancel_only_affects_own_request() {
        let mut harness = Harness::new(None);
        let mut first = harness.connection.submit(request());
        let second = harness.connection.submit(request());
        let first_stream = harness.next_request().await;
        let second_stream = harness.next_request().await;

        assert!(first.cancel());
        assert!(matches!(resolve(first).await, Err(SendError::Cancelled)));
        assert!(matches!(harness.next_written().await, Written::Cancel(s) if s == first_stream));
        assert_eq!(harness.connection.in_flight(), 1);

        // A late reply for the cancelled stream is an orphan.
        harness.reply(first_stream, 200, Uuid::new_v4()).await;
        let id = Uuid::new_v4();
        harness.reply(second_stream, 200, id).await;
        assert_eq!(resolve(second).await.unwrap().id(), Some(id));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let mut harness = Harness::new(None);
        let handle = harness.connection.submit(request());
        let stream = harness.next_request().await;
        drop(handle);

        assert_eq!(harness.connection.in_flight(), 0);
        assert!(matches!(harness.next_written().await, Written::Cancel(s) if s == stream));
    }

    #[tokio::test]
    async fn test_goaway_drains_all_pending() {
        let mut harness = Harness::new(None);
        let handles: Vec<_> = (0..3).map(|_| harness.connection.submit(request())).collect();
        for _ in 0..3 {
            harness.next_request().await;
        }

        harness
            .events
            .send(InboundEvent::GoAway { debug_data: Bytes::from_static(br#"{"reason":"IdleTimeout"}"#), code: "NO_ERROR".into() })
            .await
            .unwrap();

        for handle in handles {
            let err = resolve(handle).await.unwrap_err();
            assert!(err.is_retryable());
            let SendError::Terminated(Termination::GoAway(goaway)) = &err else {
                panic!("expected GOAWAY termination, got {err:?}");
            };
            assert_eq!(goaway.reason, Reason::IdleTimeout);
        }

        assert!(harness.connection.is_draining());
        assert_eq!(harness.connection.in_flight(), 0);
        assert!(matches!(harness.next_written().await, Written::Close));

        let late = harness.connection.submit(request());
        assert!(late.stream_id().is_none());
        assert!(matches!(resolve(late).await, Err(SendError::Terminated(Termination::GoAway(_)))));
    }

    #[tokio::test]
    async fn test_close_drains_and_tears_down() {
        let mut harness = Harness::new(None);
        let handle = harness.connection.submit(request());
        harness.next_request().await;

        harness.connection.close();
        assert!(matches!(resolve(handle).await, Err(SendError::Terminated(Termination::Closed))));
        assert_eq!(harness.connection.termination(), Some(Termination::Closed));
        assert!(matches!(harness.next_written().await, Written::Close));
    }

    #[tokio::test]
    async fn test_write_failure_drains_connection() {
        let harness = Harness::new(Some(TransportError::Write("broken pipe".to_string())));
        let handle = harness.connection.submit(request());

        assert!(matches!(
            resolve(handle).await,
            Err(SendError::Terminated(Termination::Transport(TransportError::Write(_))))
        ));
        assert!(harness.connection.is_draining());
    }

    #[tokio::test]
    async fn test_refused_write_fails_with_goaway_cause() {
        let harness = Harness::new(Some(TransportError::GoingAway("GOAWAY received".to_string())));
        let handle = harness.connection.submit(request());

        // The refused write alone does not drain the connection.
        tokio::task::yield_now().await;
        assert!(!harness.connection.is_draining());
        assert_eq!(harness.connection.in_flight(), 1);

        harness
            .events
            .send(InboundEvent::GoAway { debug_data: Bytes::from_static(br#"{"reason":"Shutdown"}"#), code: "NO_ERROR".into() })
            .await
            .unwrap();

        let err = resolve(handle).await.unwrap_err();
        let SendError::Terminated(Termination::GoAway(goaway)) = &err else {
            panic!("expected GOAWAY termination, got {err:?}");
        };
        assert_eq!(goaway.reason, Reason::Shutdown);
    }

    #[tokio::test]
    async fn test_stream_failure_is_local() {
        let mut harness = Harness::new(None);
        let failing = harness.connection.submit(request());
        let healthy = harness.connection.submit(request());
        let failing_stream = harness.next_request().await;
        let healthy_stream = harness.next_request().await;

        harness
            .events
            .send(InboundEvent::StreamFailed { stream: failing_stream, error: TransportError::Stream("RST_STREAM".into()) })
            .await
            .unwrap();
        assert!(matches!(resolve(failing).await, Err(SendError::StreamReset(_))));

        harness.reply(healthy_stream, 200, Uuid::new_v4()).await;
        assert!(resolve(healthy).await.unwrap().is_success());
        assert!(!harness.connection.is_draining());
    }

    #[tokio::test]
    async fn test_dropping_connection_resolves_pending() {
        let mut harness = Harness::new(None);
        let handle = harness.connection.submit(request());
        harness.next_request().await;

        let Harness { connection, .. } = harness;
        drop(connection);
        assert!(matches!(resolve(handle).await, Err(SendError::Terminated(_))));
    }
}
