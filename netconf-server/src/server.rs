//! NETCONF server.
//!
//! Holds everything shared between sessions: the session table, the lock
//! table, the notification streams, and the capability catalog.

use crate::broadcast::{NotificationEvent, StreamMatcher, StreamRegistry};
use crate::config::Config;
use crate::datastore::Datastore;
use crate::error::ServerError;
use crate::handler::{Dispatcher, OperationRegistry};
use crate::metrics::Metrics;
use crate::session::{BoxedWriter, Session};
use netconf_core::{CapabilityId, BASE_KEYWORD};
use netconf_protocol::framing::DEFAULT_CHUNK_SIZE;
use netconf_protocol::{ChunkedEncoder, MessageReader, MessageWriter, RpcError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::Instrument;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest chunk sent on base:1.1 sessions.
    pub max_chunk_size: usize,
    /// Send chunks of random size.
    pub randomize_chunks: bool,
    /// Events kept per replay stream.
    pub replay_log_size: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("randomize_chunks", &self.randomize_chunks)
            .field("replay_log_size", &self.replay_log_size)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], netconf_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            randomize_chunks: false,
            replay_log_size: 1024,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            max_chunk_size: config.framing.max_chunk_size,
            randomize_chunks: config.framing.randomize_chunks,
            replay_log_size: config.notifications.replay_log_size,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Live sessions and the id allocator. An id is reserved (`None`) from
/// allocation until its session registers.
struct SessionTable {
    sessions: HashMap<u32, Option<Arc<Session>>>,
    last_allocated: u32,
    max_id: u32,
}

impl SessionTable {
    fn new() -> Self {
        Self::with_max_id(u32::MAX)
    }

    fn with_max_id(max_id: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            last_allocated: 0,
            max_id,
        }
    }

    /// Round robin over `[1, max_id]` starting after the last allocated id,
    /// skipping ids in use.
    fn allocate(&mut self) -> Result<u32, ServerError> {
        if self.sessions.len() as u64 >= self.max_id as u64 {
            return Err(ServerError::SessionIdsExhausted);
        }
        let mut candidate = self.last_allocated;
        loop {
            candidate = if candidate >= self.max_id { 1 } else { candidate + 1 };
            if !self.sessions.contains_key(&candidate) {
                break;
            }
        }
        self.sessions.insert(candidate, None);
        self.last_allocated = candidate;
        Ok(candidate)
    }

    fn live(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values().flatten()
    }
}

/// NETCONF server.
pub struct Server {
    config: ServerConfig,
    capabilities: OperationRegistry,
    hello_capabilities: Vec<String>,
    datastore: Arc<dyn Datastore>,
    streams: StreamRegistry,
    dispatcher: Dispatcher,
    sessions: Mutex<SessionTable>,
    /// Target name to holding session id.
    locks: Mutex<HashMap<String, u32>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    running: AtomicBool,
}

impl Server {
    /// Creates a server advertising the loadable capabilities of
    /// `capabilities`.
    ///
    /// Fails if the catalog has a dependency cycle or no base capability.
    pub fn new(
        config: ServerConfig,
        capabilities: OperationRegistry,
        datastore: Arc<dyn Datastore>,
    ) -> Result<Self, ServerError> {
        let hello_capabilities = capabilities.loadable_order()?;
        let has_base = hello_capabilities.iter().any(|id| {
            CapabilityId::parse(id).map_or(false, |id| id.keyword() == BASE_KEYWORD)
        });
        if !has_base {
            return Err(ServerError::Config("no base capability can load".to_string()));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut dispatcher = Dispatcher::new();
        if let Some(ref metrics) = config.metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }
        Ok(Self {
            streams: StreamRegistry::new(config.replay_log_size),
            config,
            capabilities,
            hello_capabilities,
            datastore,
            dispatcher,
            sessions: Mutex::new(SessionTable::new()),
            locks: Mutex::new(HashMap::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            shutting_down: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The local catalog.
    pub fn capabilities(&self) -> &OperationRegistry {
        &self.capabilities
    }

    /// Capability ids sent in the server hello, in load order.
    pub fn hello_capabilities(&self) -> &[String] {
        &self.hello_capabilities
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn register_stream(&self, name: impl Into<String>, matcher: StreamMatcher, replay: bool) {
        self.streams.register(name, matcher, replay);
    }

    /// Reserves the next free session id.
    pub fn allocate_session_id(&self) -> Result<u32, ServerError> {
        self.sessions.lock().allocate()
    }

    fn register_session(&self, session: Arc<Session>) {
        self.sessions.lock().sessions.insert(session.id(), Some(session));
        if let Some(ref metrics) = self.config.metrics {
            metrics.sessions_total.inc();
            metrics.sessions_active.inc();
        }
    }

    /// Removes a session or a reservation. Idempotent.
    pub(crate) fn deregister_session(&self, id: u32) {
        let removed = self.sessions.lock().sessions.remove(&id);
        if let (Some(Some(_)), Some(metrics)) = (removed, self.config.metrics.as_ref()) {
            metrics.sessions_active.dec();
        }
    }

    pub fn session(&self, id: u32) -> Option<Arc<Session>> {
        self.sessions.lock().sessions.get(&id).cloned().flatten()
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().live().count()
    }

    fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().live().cloned().collect()
    }

    /// Locks `target` for `session_id`. Fails with `lock-denied` naming the
    /// holder if any session, including the caller, already holds it, and
    /// with `operation-failed` if `session_id` is not a live session.
    pub fn lock(&self, target: &str, session_id: u32) -> Result<(), RpcError> {
        let session = self
            .session(session_id)
            .filter(|s| !s.is_closed())
            .ok_or_else(|| RpcError::operation_failed(format!("session {} is closed", session_id)))?;

        {
            let mut locks = self.locks.lock();
            if let Some(&holder) = locks.get(target) {
                tracing::debug!("lock on '{}' denied to {}: held by {}", target, session_id, holder);
                return Err(RpcError::lock_denied(holder));
            }
            locks.insert(target.to_string(), session_id);
            if let Some(ref metrics) = self.config.metrics {
                metrics.locks_held.set(locks.len() as f64);
            }
        }

        // close() marks the session before releasing its locks, so a close
        // that raced the insert is either seen here or removes the entry.
        if session.is_closed() {
            self.release_locks(session_id);
            return Err(RpcError::operation_failed(format!("session {} is closed", session_id)));
        }
        Ok(())
    }

    /// Releases `target`. Fails with `operation-failed` unless held by
    /// `session_id`.
    pub fn unlock(&self, target: &str, session_id: u32) -> Result<(), RpcError> {
        let mut locks = self.locks.lock();
        match locks.get(target) {
            Some(&holder) if holder == session_id => {
                locks.remove(target);
                if let Some(ref metrics) = self.config.metrics {
                    metrics.locks_held.set(locks.len() as f64);
                }
                Ok(())
            }
            Some(_) => Err(RpcError::operation_failed(format!(
                "'{}' is locked by another session",
                target
            ))),
            None => Err(RpcError::operation_failed(format!("'{}' is not locked", target))),
        }
    }

    pub fn lock_holder(&self, target: &str) -> Option<u32> {
        self.locks.lock().get(target).copied()
    }

    /// Releases every lock held by `session_id`.
    pub fn release_locks(&self, session_id: u32) {
        let mut locks = self.locks.lock();
        locks.retain(|_, holder| *holder != session_id);
        if let Some(ref metrics) = self.config.metrics {
            metrics.locks_held.set(locks.len() as f64);
        }
    }

    /// Closes session `id`. Returns false if no such session is live.
    pub fn kill_session(&self, id: u32) -> bool {
        match self.session(id) {
            Some(session) => {
                session.close(self);
                true
            }
            None => false,
        }
    }

    /// Publishes an event: records it in the replay logs, then delivers it
    /// to every session subscribed to a matching stream, each on its own
    /// task. Returns the number of deliveries started.
    pub fn send_notification(self: &Arc<Self>, event: NotificationEvent) -> usize {
        self.streams.record(&event);

        let mut started = 0;
        for session in self.sessions_snapshot() {
            if !session.wants(&self.streams, &event) {
                continue;
            }
            started += 1;
            let server = self.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if session.deliver(&server.streams, &event).await {
                    if let Some(ref metrics) = server.config.metrics {
                        metrics.notifications_sent_total.inc();
                    }
                }
            });
        }
        tracing::debug!("notification fanned out to {} sessions", started);
        started
    }

    /// Runs one session over `reader`/`writer` until it ends.
    pub async fn serve<R, W>(
        self: &Arc<Self>,
        reader: R,
        writer: W,
        peer: impl Into<String>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServerError::ShuttingDown);
        }
        let peer = peer.into();
        let id = self.allocate_session_id()?;
        let encoder = ChunkedEncoder::new(self.config.max_chunk_size)
            .with_randomized_chunks(self.config.randomize_chunks);
        let writer = MessageWriter::new(Box::new(writer) as BoxedWriter).with_chunk_encoder(encoder);
        let session = Arc::new(Session::new(id, peer.clone(), writer));
        self.register_session(session.clone());

        let span = tracing::info_span!("session", id);
        let result = session
            .run(self, MessageReader::new(reader))
            .instrument(span)
            .await;

        session.close(self);
        self.release_locks(id);
        session.shutdown().await;

        match &result {
            Ok(()) => tracing::info!("[{}] session {} closed", peer, id),
            Err(e) if e.is_disconnect() => tracing::info!("[{}] session {} ended: {}", peer, id, e),
            Err(e) => {
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] session {} terminated: {}", peer, id, e);
            }
        }
        result
    }

    /// Accepts TCP connections until [`Server::shutdown`] is called.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("[{}] set_nodelay failed: {}", addr, e);
                            }

                            let server = self.clone();
                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);
                                let (reader, writer) = tcp_stream.into_split();
                                // Outcome is logged by serve.
                                let _ = server.serve(reader, writer, addr.to_string()).await;
                                server.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting connections and closes every session. Sessions
    /// started afterwards are refused.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
        for session in self.sessions_snapshot() {
            session.close(self);
        }
    }

    /// Subscribes to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
