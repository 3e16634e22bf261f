//! Session management.
//!
//! A session owns one duplex byte stream. It sends the server hello,
//! negotiates capabilities against the client hello, picks the framing,
//! then loops reading `<rpc>` messages and writing replies. Notifications
//! share the same writer, so a reply and a notification never interleave on
//! the wire.

use crate::broadcast::{NotificationEvent, Stream, StreamRegistry};
use crate::datastore::DatastoreSession;
use crate::error::ServerError;
use crate::handler::{OperationContext, OperationRegistry, Teardown};
use crate::server::Server;
use chrono::{DateTime, Utc};
use netconf_core::BASE_KEYWORD;
use netconf_protocol::message::{notification_complete, replay_complete};
use netconf_protocol::xml::Element;
use netconf_protocol::{build_reply, Framing, Hello, MessageReader, MessageWriter, ReplyContent, RpcError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Write half of a session, type-erased.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Id allocated, nothing sent yet.
    Connecting,
    /// Server hello written, waiting for the client hello.
    HelloSent,
    /// Client hello received.
    Negotiating,
    /// Framing chosen from the negotiated base version.
    FramingSelected,
    /// Processing RPCs.
    Operating,
    /// Teardown in progress.
    Closing,
    Closed,
}

/// A NETCONF session.
pub struct Session {
    id: u32,

    /// Remote peer, for logging.
    peer: String,

    state: Mutex<SessionState>,

    /// Send critical section shared by replies and notifications.
    writer: tokio::sync::Mutex<MessageWriter<BoxedWriter>>,

    /// Names of subscribed streams.
    subscriptions: Mutex<HashSet<String>>,

    /// Replay and termination tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,

    closed: AtomicBool,

    /// Wakes the read loop on close.
    close_tx: watch::Sender<bool>,

    rpc_count: AtomicU64,

    created_at: Instant,
}

impl Session {
    pub fn new(id: u32, peer: impl Into<String>, writer: MessageWriter<BoxedWriter>) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            peer: peer.into(),
            state: Mutex::new(SessionState::Connecting),
            writer: tokio::sync::Mutex::new(writer),
            subscriptions: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_tx,
            rpc_count: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// A session whose output is discarded.
    #[cfg(test)]
    pub(crate) fn detached(id: u32) -> Arc<Self> {
        let writer: BoxedWriter = Box::new(tokio::io::sink());
        Arc::new(Self::new(id, "detached", MessageWriter::new(writer)))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        tracing::trace!("session {} -> {:?}", self.id, state);
        *self.state.lock() = state;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    /// Returns whether a subscribed stream matches `event`.
    pub fn wants(&self, streams: &StreamRegistry, event: &NotificationEvent) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|name| streams.get(name).map_or(false, |s| s.matches(event)))
    }

    /// Runs the session until the peer leaves, the session is closed, or a
    /// fatal error occurs. The caller performs teardown.
    pub(crate) async fn run<R: AsyncRead + Unpin>(
        self: &Arc<Self>,
        server: &Arc<Server>,
        mut reader: MessageReader<R>,
    ) -> Result<(), ServerError> {
        let mut close_rx = self.close_tx.subscribe();

        let hello = Hello::new(server.hello_capabilities().to_vec()).with_session_id(self.id);
        self.send(&hello.to_element()).await?;
        self.set_state(SessionState::HelloSent);

        let message = tokio::select! {
            message = reader.read_message(&["hello"]) => message?,
            _ = close_rx.changed() => return Ok(()),
        };
        let Some(message) = message else {
            tracing::debug!("[{}] peer left before hello", self.peer);
            return Ok(());
        };
        let client = Hello::from_element(&message)?;
        if let Some(id) = client.session_id {
            return Err(ServerError::UnexpectedMessage(format!(
                "client hello carries session-id {}",
                id
            )));
        }
        self.set_state(SessionState::Negotiating);

        let negotiated = server.capabilities().negotiate(&client.capabilities);
        let base = negotiated
            .highest_version(BASE_KEYWORD)
            .ok_or(ServerError::NoBaseCapability)?;
        let framing = if base >= (1, 1) {
            Framing::Chunked
        } else {
            Framing::EndOfMessage
        };
        reader.set_framing(framing);
        self.writer.lock().await.set_framing(framing);
        self.set_state(SessionState::FramingSelected);
        tracing::info!(
            "[{}] session {} established: base {}.{}, {} capabilities",
            self.peer,
            self.id,
            base.0,
            base.1,
            negotiated.len()
        );

        let mut datastore = server.datastore().open_session(self.id);
        self.set_state(SessionState::Operating);
        let result = self
            .operate(server, &negotiated, &mut reader, &mut datastore, &mut close_rx)
            .await;
        if let Some(mut handle) = datastore {
            handle.close();
        }
        result
    }

    async fn operate<R: AsyncRead + Unpin>(
        self: &Arc<Self>,
        server: &Arc<Server>,
        negotiated: &OperationRegistry,
        reader: &mut MessageReader<R>,
        datastore: &mut Option<Box<dyn DatastoreSession>>,
        close_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        loop {
            if self.is_closed() {
                return Ok(());
            }

            let message = tokio::select! {
                message = reader.read_message(&["rpc"]) => message,
                _ = close_rx.changed() => return Ok(()),
            };
            let rpc = match message {
                Ok(Some(rpc)) => rpc,
                Ok(None) => {
                    tracing::debug!("[{}] peer closed the stream", self.peer);
                    return Ok(());
                }
                Err(e) if e.is_malformed() && reader.framing() == Framing::Chunked => {
                    tracing::warn!("[{}] malformed message: {}", self.peer, e);
                    let reply = build_reply(&[], ReplyContent::Errors(vec![e.to_rpc_error()]));
                    self.send(&reply).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.rpc_count.fetch_add(1, Ordering::Relaxed);

            // Held until the reply is written so that notifications queued by
            // the request follow it.
            let mut writer = self.writer.lock().await;
            if self.is_closed() {
                return Ok(());
            }
            let (reply, teardown) = {
                let mut ctx = OperationContext::new(server, self, negotiated, datastore);
                let reply = server.dispatcher().dispatch(&mut ctx, &rpc)?;
                (reply, ctx.take_teardown())
            };
            writer.write_message(&reply).await?;
            drop(writer);

            match teardown {
                Some(Teardown::Own) => {
                    tracing::debug!("[{}] close-session", self.peer);
                    return Ok(());
                }
                Some(Teardown::Session(id)) => {
                    tracing::info!("[{}] session {} killed session {}", self.peer, self.id, id);
                    server.kill_session(id);
                }
                None => {}
            }
        }
    }

    /// Writes one message under the send critical section.
    pub async fn send(&self, message: &Element) -> Result<(), ServerError> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ServerError::SessionClosed);
        }
        writer.write_message(message).await?;
        Ok(())
    }

    /// Writes `event` if the session is still subscribed to a stream that
    /// matches it once the send critical section is held.
    pub async fn deliver(&self, streams: &StreamRegistry, event: &NotificationEvent) -> bool {
        let mut writer = self.writer.lock().await;
        if self.is_closed() || !self.wants(streams, event) {
            return false;
        }
        match writer.write_message(&event.to_element()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("[{}] notification not delivered: {}", self.peer, e);
                false
            }
        }
    }

    /// Subscribes to `stream` (RFC 5277 §2.1.1).
    ///
    /// With `start`, events from the stream's replay log inside
    /// `[start, stop)` are sent, in log order, followed by `replayComplete`.
    /// With `stop`, the subscription ends at that time with
    /// `notificationComplete`.
    pub fn create_subscription(
        self: &Arc<Self>,
        server: &Arc<Server>,
        stream_name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::operation_failed("session is closed"));
        }
        let stream = server
            .streams()
            .get(stream_name)
            .ok_or_else(|| RpcError::invalid_value(format!("unknown stream '{}'", stream_name)))?;
        if start.is_some() && !stream.supports_replay() {
            return Err(RpcError::operation_failed(format!(
                "stream '{}' does not support replay",
                stream_name
            )));
        }
        if !self.subscriptions.lock().insert(stream_name.to_string()) {
            return Err(RpcError::operation_failed(format!(
                "already subscribed to stream '{}'",
                stream_name
            )));
        }
        if self.is_closed() {
            self.subscriptions.lock().clear();
            return Err(RpcError::operation_failed("session is closed"));
        }
        tracing::debug!("[{}] subscribed to stream '{}'", self.peer, stream_name);

        let span = tracing::info_span!("subscription", session = self.id, stream = stream_name);
        let replay_done = start.map(|start| {
            let (done_tx, done_rx) = oneshot::channel();
            let events = stream.replay_log();
            let task = tokio::spawn(
                replay(self.clone(), stream.clone(), events, start, stop, done_tx).instrument(span.clone()),
            );
            self.track(task);
            done_rx
        });

        if let Some(stop) = stop {
            let task = tokio::spawn(
                terminate(self.clone(), stream_name.to_string(), stop, replay_done).instrument(span),
            );
            self.track(task);
        }
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        if self.is_closed() {
            task.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Closes the session: wakes the read loop, aborts background tasks,
    /// releases locks, and deregisters. Idempotent.
    pub fn close(&self, server: &Server) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Closing);
        self.close_tx.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.subscriptions.lock().clear();
        server.release_locks(self.id);
        server.deregister_session(self.id);
    }

    /// Shuts down the write half. Must follow [`Session::close`].
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("[{}] shutdown failed: {}", self.peer, e);
        }
        drop(writer);
        self.set_state(SessionState::Closed);
    }
}

async fn replay(
    session: Arc<Session>,
    stream: Arc<Stream>,
    events: Vec<NotificationEvent>,
    start: DateTime<Utc>,
    stop: Option<DateTime<Utc>>,
    done: oneshot::Sender<()>,
) {
    let window = events.into_iter().filter(|e| {
        e.event_time >= start && stop.map_or(true, |stop| e.event_time < stop) && stream.matches(e)
    });
    let mut replayed = 0usize;
    for event in window {
        if session.send(&event.to_element()).await.is_err() {
            return;
        }
        replayed += 1;
    }
    if session.send(&replay_complete(&Utc::now())).await.is_ok() {
        tracing::debug!("replayed {} events", replayed);
    }
    let _ = done.send(());
}

async fn terminate(
    session: Arc<Session>,
    stream_name: String,
    stop: DateTime<Utc>,
    replay_done: Option<oneshot::Receiver<()>>,
) {
    if let Some(done) = replay_done {
        let _ = done.await;
    }
    // Sleep is recomputed on every wake.
    loop {
        let now = Utc::now();
        match (stop - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => tokio::time::sleep(remaining).await,
            _ => break,
        }
    }

    let mut writer = session.writer.lock().await;
    if session.is_closed() {
        return;
    }
    session.subscriptions.lock().remove(&stream_name);
    if let Err(e) = writer.write_message(&notification_complete(&Utc::now())).await {
        tracing::debug!("notificationComplete not delivered: {}", e);
    }
}
