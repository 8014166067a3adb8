use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use inferprobe_frame::{
    channel_name, Frame, FrameCodec, FrameError, CONTROL, DEFAULT_MAX_PAYLOAD, PROCESS,
};
use inferprobe_transport::Connector;
use tokio::io::{AsyncRead, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::correlation::{CorrelationTable, PendingResponse};
use crate::error::{ClientError, RequestError, Result};
use crate::messages::{ControlMessage, Request, Response};

/// Lifecycle of a [`StreamSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Open,
    /// Terminal.
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session moved to [`SessionState::Closed`]. Recorded once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The processor signalled completion or ended the stream cleanly.
    PeerCompleted,
    /// Reading from or writing to the stream failed.
    Transport(String),
    /// The processor answered a request id that was not in flight.
    UnmatchedResponse(u64),
    /// The processor sent something that is not a valid message.
    Malformed(String),
}

impl CloseReason {
    /// Whether the session ended for any reason other than a local close.
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::PeerCompleted => f.write_str("peer completed the stream"),
            Self::Transport(err) => write!(f, "transport failure: {err}"),
            Self::UnmatchedResponse(id) => write!(f, "response for unknown request id {id}"),
            Self::Malformed(detail) => write!(f, "malformed message: {detail}"),
        }
    }
}

/// Tunables for a streaming session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest frame payload accepted or sent. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

type Sink<S> = FramedWrite<WriteHalf<S>, FrameCodec>;

/// How long `close()` waits to hand the completion notice to the peer.
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// One duplex stream multiplexing many correlated request/response exchanges.
///
/// Requests go out through a single writer; a reader task routes every
/// inbound response to the [`CorrelationTable`]. Any fatal condition closes
/// the session and fails every pending request with
/// [`ClientError::Disconnected`].
pub struct StreamSession<C: Connector> {
    connector: C,
    config: SessionConfig,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<Sink<C::Stream>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    table: CorrelationTable,
    status: Mutex<Status>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

struct Status {
    state: SessionState,
    reason: Option<CloseReason>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_open(&self) -> Result<()> {
        let mut status = self.status();
        match status.state {
            SessionState::Uninitialized => {
                status.state = SessionState::Open;
                Ok(())
            }
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(ClientError::SessionClosed),
        }
    }

    /// Move to Closed and fail everything in flight. Returns false if the
    /// session was already closed.
    fn close_with(&self, reason: CloseReason) -> bool {
        {
            let mut status = self.status();
            if status.state == SessionState::Closed {
                return false;
            }
            status.state = SessionState::Closed;
            status.reason = Some(reason.clone());
        }

        let failed = self
            .table
            .fail_all(RequestError::Disconnected(reason.to_string()));
        self.closed.cancel();

        if reason.is_fault() {
            warn!(%reason, failed, "session closed");
        } else {
            info!(failed, "session closed");
        }
        true
    }

    /// Route one inbound frame. `Some` means the session must close.
    fn dispatch(&self, frame: Frame) -> Option<CloseReason> {
        match frame.channel {
            PROCESS => {
                let response: Response = match serde_json::from_slice(&frame.payload) {
                    Ok(response) => response,
                    Err(err) => {
                        return Some(CloseReason::Malformed(format!(
                            "undecodable response: {err}"
                        )))
                    }
                };
                let request_id = response.request_id;
                trace!(request_id, "response received");
                match self.table.resolve(request_id, response.into_result()) {
                    Ok(()) => None,
                    Err(_) => Some(CloseReason::UnmatchedResponse(request_id)),
                }
            }
            CONTROL => match serde_json::from_slice::<ControlMessage>(&frame.payload) {
                Ok(message) if message.is_complete() => Some(CloseReason::PeerCompleted),
                Ok(message) => {
                    warn!(msg_type = %message.msg_type, "ignoring unexpected control message");
                    None
                }
                Err(err) => Some(CloseReason::Malformed(format!(
                    "undecodable control message: {err}"
                ))),
            },
            other => Some(CloseReason::Malformed(format!(
                "frame on unexpected channel {other} ({})",
                channel_name(other)
            ))),
        }
    }
}

impl<C: Connector> StreamSession<C> {
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, SessionConfig::default())
    }

    pub fn with_config(connector: C, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(Shared {
                table: CorrelationTable::new(),
                status: Mutex::new(Status {
                    state: SessionState::Uninitialized,
                    reason: None,
                }),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    /// Establish the stream and start the reader task.
    ///
    /// No-op when already open. On a connection failure the session stays
    /// uninitialized and may be retried.
    pub async fn connect(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match self.state() {
            SessionState::Open => return Ok(()),
            SessionState::Closed => return Err(ClientError::SessionClosed),
            SessionState::Uninitialized => {}
        }

        let stream = self
            .connector
            .connect()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        let (read_half, write_half) = tokio::io::split(stream);

        self.shared.mark_open()?;
        *writer = Some(FramedWrite::new(
            write_half,
            FrameCodec::new(self.config.max_payload_size),
        ));

        let frames = FramedRead::new(read_half, FrameCodec::new(self.config.max_payload_size));
        let handle = tokio::spawn(read_loop(Arc::clone(&self.shared), frames));
        *self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("session open");
        Ok(())
    }

    /// Send `request` and return a handle for its response.
    ///
    /// Connects first if needed. Fails immediately with
    /// [`ClientError::SessionClosed`] once the session is closed.
    pub async fn submit(&self, request: Request) -> Result<PendingResponse> {
        match self.state() {
            SessionState::Closed => return Err(ClientError::SessionClosed),
            SessionState::Uninitialized => self.connect().await?,
            SessionState::Open => {}
        }

        let request_id = request.request_id;
        let payload = serde_json::to_vec(&request)?;
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            }
            .into());
        }

        let pending = self.shared.table.register(request_id)?;

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ClientError::SessionClosed);
        };
        // A peer that stops reading blocks the send; shutdown releases the writer.
        let sent = tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => None,
            sent = sink.send(Frame::new(PROCESS, payload)) => Some(sent),
        };
        match sent {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                writer.take();
                drop(writer);
                self.shared.close_with(CloseReason::Transport(err.to_string()));
                return Err(err.into());
            }
            None => {
                writer.take();
                return Err(ClientError::SessionClosed);
            }
        }

        debug!(request_id, kind = request.payload.kind(), "request sent");
        Ok(pending)
    }

    /// Close the session. Idempotent.
    ///
    /// Fails all pending requests, tells the peer the stream is complete,
    /// shuts the writer down and stops the reader task. The completion notice
    /// is best effort: a peer that does not drain it within [`CLOSE_GRACE`]
    /// just sees the stream drop.
    pub async fn close(&self) {
        let closed_now = self.shared.close_with(CloseReason::Local);
        self.shared.shutdown.cancel();

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let finish = async {
                if closed_now {
                    match serde_json::to_vec(&ControlMessage::complete()) {
                        Ok(payload) => {
                            if let Err(err) = sink.send(Frame::new(CONTROL, payload)).await {
                                debug!(error = %err, "failed to send completion");
                            }
                        }
                        Err(err) => debug!(error = %err, "failed to encode completion"),
                    }
                }
                if let Err(err) = sink.close().await {
                    debug!(error = %err, "writer shutdown failed");
                }
            };
            if tokio::time::timeout(CLOSE_GRACE, finish).await.is_err() {
                debug!("peer is not reading; dropping the writer");
            }
        }

        let handle = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "reader task ended abnormally");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.status().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.status().reason.clone()
    }

    /// Resolves once the session is closed, with the recorded reason.
    pub async fn closed(&self) -> CloseReason {
        self.shared.closed.cancelled().await;
        self.close_reason().unwrap_or(CloseReason::Local)
    }

    /// Number of requests awaiting a response.
    pub fn pending(&self) -> usize {
        self.shared.table.len()
    }

    /// Close without notifying the peer or waiting for the reader task.
    ///
    /// For callers outside an async context. Pending requests fail at once;
    /// the stream drops once the reader task and any blocked writer let go.
    pub fn close_now(&self) {
        self.shared.close_with(CloseReason::Local);
        self.shared.shutdown.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl<C: Connector> Drop for StreamSession<C> {
    fn drop(&mut self) {
        self.close_now();
    }
}

impl<C: Connector> fmt::Debug for StreamSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn read_loop<S: AsyncRead>(
    shared: Arc<Shared>,
    mut frames: FramedRead<ReadHalf<S>, FrameCodec>,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            next = frames.next() => next,
        };

        match next {
            None => break CloseReason::PeerCompleted,
            Some(Ok(frame)) => {
                if let Some(reason) = shared.dispatch(frame) {
                    break reason;
                }
            }
            Some(Err(FrameError::Io(err))) => break CloseReason::Transport(err.to_string()),
            Some(Err(FrameError::ConnectionClosed)) => {
                break CloseReason::Transport("stream ended mid-frame".to_string())
            }
            Some(Err(err)) => break CloseReason::Malformed(err.to_string()),
        }
    };

    shared.close_with(reason);
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use inferprobe_transport::TransportError;
    use serde_json::json;
    use tokio::io::DuplexStream;

    use super::*;

    struct DuplexConnector {
        stream: Mutex<Option<DuplexStream>>,
    }

    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        fn connect(&self) -> impl Future<Output = inferprobe_transport::Result<DuplexStream>> + Send {
            let stream = self.stream.lock().unwrap().take();
            async move {
                stream.ok_or_else(|| {
                    TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "no stream available",
                    ))
                })
            }
        }
    }

    struct Peer {
        frames: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
        sink: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    }

    impl Peer {
        async fn next_request(&mut self) -> Request {
            let frame = self.frames.next().await.unwrap().unwrap();
            assert_eq!(frame.channel, PROCESS);
            serde_json::from_slice(&frame.payload).unwrap()
        }

        async fn respond(&mut self, response: &Response) {
            let payload = serde_json::to_vec(response).unwrap();
            self.sink.send(Frame::new(PROCESS, payload)).await.unwrap();
        }

        async fn send_raw(&mut self, channel: u16, payload: &[u8]) {
            self.sink
                .send(Frame::new(channel, payload.to_vec()))
                .await
                .unwrap();
        }
    }

    fn session_pair() -> (StreamSession<DuplexConnector>, Peer) {
        session_pair_with_capacity(64 * 1024)
    }

    fn session_pair_with_capacity(capacity: usize) -> (StreamSession<DuplexConnector>, Peer) {
        let (client, server) = tokio::io::duplex(capacity);
        let (read_half, write_half) = tokio::io::split(server);
        let session = StreamSession::new(DuplexConnector {
            stream: Mutex::new(Some(client)),
        });
        let peer = Peer {
            frames: FramedRead::new(read_half, FrameCodec::default()),
            sink: FramedWrite::new(write_half, FrameCodec::default()),
        };
        (session, peer)
    }

    async fn wait_closed(session: &StreamSession<DuplexConnector>) -> CloseReason {
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("session did not close")
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (session, mut peer) = session_pair();
        assert_eq!(session.state(), SessionState::Uninitialized);

        let mut waiters = Vec::new();
        for id in 1..=3 {
            waiters.push(session.submit(Request::startup(id)).await.unwrap());
        }
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.pending(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(peer.next_request().await.request_id);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        for id in [3, 1, 2] {
            peer.respond(&Response::ok(id, json!({ "echo": id }))).await;
        }

        for (waiter, id) in waiters.into_iter().zip(1..=3u64) {
            assert_eq!(waiter.await.unwrap(), json!({ "echo": id }));
        }
        assert_eq!(session.pending(), 0);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn processor_error_is_local_to_the_request() {
        let (session, mut peer) = session_pair();
        let failing = session.submit(Request::startup(1)).await.unwrap();
        let passing = session.submit(Request::startup(2)).await.unwrap();
        peer.next_request().await;
        peer.next_request().await;

        peer.respond(&Response::error(1, "bad frame")).await;
        peer.respond(&Response::ok(2, json!(null))).await;

        assert!(matches!(
            failing.await,
            Err(ClientError::Rejected { request_id: 1, .. })
        ));
        assert!(passing.await.is_ok());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn unmatched_response_closes_session() {
        let (session, mut peer) = session_pair();
        let waiter = session.submit(Request::startup(1)).await.unwrap();
        peer.next_request().await;

        peer.respond(&Response::ok(99, json!(null))).await;

        assert_eq!(wait_closed(&session).await, CloseReason::UnmatchedResponse(99));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(waiter.await, Err(ClientError::Disconnected(_))));
    }

    #[tokio::test]
    async fn close_fails_pending_and_notifies_peer() {
        let (session, mut peer) = session_pair();
        let waiters: Vec<_> = {
            let mut waiters = Vec::new();
            for id in 1..=3 {
                waiters.push(session.submit(Request::startup(id)).await.unwrap());
            }
            waiters
        };

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Local));

        for waiter in waiters {
            assert!(matches!(waiter.await, Err(ClientError::Disconnected(_))));
        }

        for _ in 0..3 {
            peer.next_request().await;
        }
        let complete = peer.frames.next().await.unwrap().unwrap();
        assert_eq!(complete.channel, CONTROL);
        let message: ControlMessage = serde_json::from_slice(&complete.payload).unwrap();
        assert!(message.is_complete());
        assert!(peer.frames.next().await.is_none());

        session.close().await;
        assert_eq!(session.close_reason(), Some(CloseReason::Local));
    }

    #[tokio::test]
    async fn close_is_not_held_up_by_a_peer_that_stops_reading() {
        let (session, _peer) = session_pair_with_capacity(1024);
        let session = Arc::new(session);

        let flooding = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let mut waiters = Vec::new();
                for id in 1..100 {
                    match session.submit(Request::startup(id)).await {
                        Ok(waiter) => waiters.push(waiter),
                        Err(err) => return (waiters, Some(err)),
                    }
                }
                (waiters, None)
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!flooding.is_finished(), "writes should be stalled");
        assert!(session.pending() > 0);

        tokio::time::timeout(Duration::from_secs(3), session.close())
            .await
            .expect("close waited on a stalled writer");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Local));

        let (waiters, err) = tokio::time::timeout(Duration::from_secs(3), flooding)
            .await
            .expect("stalled submit was not released")
            .unwrap();
        assert!(matches!(err, Some(ClientError::SessionClosed)));
        assert!(!waiters.is_empty());
        for waiter in waiters {
            assert!(matches!(waiter.await, Err(ClientError::Disconnected(_))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submitters_each_get_their_own_response() {
        const CALLERS: u64 = 200;
        let (session, mut peer) = session_pair();
        let session = Arc::new(session);

        let processor = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..CALLERS {
                ids.push(peer.next_request().await.request_id);
            }
            for id in ids.iter().rev() {
                peer.respond(&Response::ok(*id, json!({ "echo": id }))).await;
            }
            (peer, ids)
        });

        let callers: Vec<_> = (0..CALLERS)
            .map(|id| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let waiter = session.submit(Request::startup(id)).await.unwrap();
                    (id, waiter.await.unwrap())
                })
            })
            .collect();

        for caller in callers {
            let (id, value) = caller.await.unwrap();
            assert_eq!(value, json!({ "echo": id }));
        }

        let (_peer, mut ids) = processor.await.unwrap();
        ids.sort_unstable();
        assert_eq!(ids, (0..CALLERS).collect::<Vec<_>>());
        assert_eq!(session.pending(), 0);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn close_now_works_outside_a_runtime() {
        let (session, _peer) = session_pair();
        session.close_now();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Local));
    }

    #[tokio::test]
    async fn submit_after_close_fails_immediately() {
        let (session, _peer) = session_pair();
        session.connect().await.unwrap();
        session.close().await;

        assert!(matches!(
            session.submit(Request::startup(1)).await,
            Err(ClientError::SessionClosed)
        ));
        assert!(matches!(session.connect().await, Err(ClientError::SessionClosed)));
    }

    #[tokio::test]
    async fn close_before_connect_is_terminal() {
        let (session, _peer) = session_pair();
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.submit(Request::startup(0)).await,
            Err(ClientError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn peer_completion_and_eof_are_not_protocol_errors() {
        let (session, mut peer) = session_pair();
        let waiter = session.submit(Request::startup(1)).await.unwrap();
        peer.next_request().await;

        peer.send_raw(CONTROL, br#"{"type":"complete"}"#).await;
        assert_eq!(wait_closed(&session).await, CloseReason::PeerCompleted);
        assert!(matches!(waiter.await, Err(ClientError::Disconnected(_))));

        let (session, peer) = session_pair();
        session.connect().await.unwrap();
        drop(peer);
        assert_eq!(wait_closed(&session).await, CloseReason::PeerCompleted);
    }

    #[tokio::test]
    async fn garbage_from_peer_is_malformed() {
        let (session, mut peer) = session_pair();
        session.connect().await.unwrap();
        peer.send_raw(PROCESS, b"not json").await;
        assert!(matches!(wait_closed(&session).await, CloseReason::Malformed(_)));

        let (session, mut peer) = session_pair();
        session.connect().await.unwrap();
        peer.send_raw(7, b"{}").await;
        assert!(matches!(wait_closed(&session).await, CloseReason::Malformed(_)));
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (session, _peer) = session_pair();
        let _first = session.submit(Request::startup(5)).await.unwrap();

        assert!(matches!(
            session.submit(Request::startup(5)).await,
            Err(ClientError::DuplicateRequestId(5))
        ));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn connect_failure_leaves_session_uninitialized() {
        let session = StreamSession::new(DuplexConnector {
            stream: Mutex::new(None),
        });

        assert!(matches!(session.connect().await, Err(ClientError::Connection(_))));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (session, _peer) = session_pair();
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Open);
    }
}
