//! Multi-client TCP server: bind-with-retry, accept loop, session registry,
//! broadcast/targeted send, and idle-connection reaping.

use crate::error_map::io_to_channel_error;
use crate::session::{Session, SessionRegistry};
use bytes::Bytes;
use chanio_core::{
    AtomicLinkState, Callbacks, ChannelError, ClientLimit, ConnectionContext, ErrorContext,
    ErrorKind, FixedInterval, LinkState, MessageContext, ReconnectPolicy, StateDebouncer,
    StopFlag, SystemClock,
};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info, warn};

const DEFAULT_READ_BUFFER: usize = 4096;
const STATE_DEBOUNCE_WINDOW: Duration = Duration::from_millis(10);
const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 1024 * 1024;
const DEFAULT_BIND_RETRY_INTERVAL: Duration = Duration::from_millis(2000);
const DEFAULT_MAX_BIND_RETRIES: i32 = -1;
const IDLE_REAP_MIN_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_REAP_MAX_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct TcpServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: ClientLimit,
    pub backpressure_threshold: usize,
    /// `0` disables idle reaping.
    pub idle_timeout_ms: u64,
}

pub struct TcpServerBuilder {
    host: String,
    port: u32,
    max_connections: u32,
    backpressure_threshold: usize,
    idle_timeout_ms: u64,
    enable_port_retry: bool,
    max_bind_retries: i32,
    port_retry_interval_ms: u64,
    bind_retry_policy: Option<Arc<dyn ReconnectPolicy>>,
    callbacks: Callbacks,
    auto_manage: bool,
}

impl TcpServerBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: port as u32,
            max_connections: 0,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            idle_timeout_ms: 0,
            enable_port_retry: true,
            max_bind_retries: DEFAULT_MAX_BIND_RETRIES,
            port_retry_interval_ms: DEFAULT_BIND_RETRY_INTERVAL.as_millis() as u64,
            bind_retry_policy: None,
            callbacks: Callbacks::new(),
            auto_manage: false,
        }
    }

    /// `0` means unlimited.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn backpressure_threshold(mut self, bytes: usize) -> Self {
        self.backpressure_threshold = bytes;
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Whether a bind failure with `PortInUse` or `AccessDenied` is retried
    /// at all; other bind failures are always terminal regardless of this
    /// setting.
    pub fn enable_port_retry(mut self, enabled: bool) -> Self {
        self.enable_port_retry = enabled;
        self
    }

    pub fn max_bind_retries(mut self, max_retries: i32) -> Self {
        self.max_bind_retries = max_retries;
        self
    }

    pub fn port_retry_interval_ms(mut self, ms: u64) -> Self {
        self.port_retry_interval_ms = ms;
        self
    }

    pub fn bind_retry_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.bind_retry_policy = Some(policy);
        self
    }

    pub fn auto_manage(mut self, enabled: bool) -> Self {
        self.auto_manage = enabled;
        self
    }

    /// Unified data callback; wins over `on_bytes` if both are set.
    pub fn on_data(self, cb: impl FnMut(MessageContext) + Send + 'static) -> Self {
        self.callbacks.set_on_bytes(cb);
        self
    }

    pub fn on_state(self, cb: impl FnMut(LinkState) + Send + 'static) -> Self {
        self.callbacks.set_on_state(cb);
        self
    }

    pub fn on_error(self, cb: impl FnMut(ErrorContext) + Send + 'static) -> Self {
        self.callbacks.set_on_error(cb);
        self
    }

    pub fn on_connect(self, cb: impl FnMut(ConnectionContext) + Send + 'static) -> Self {
        self.callbacks.set_on_connect(cb);
        self
    }

    pub fn on_disconnect(self, cb: impl FnMut(ConnectionContext) + Send + 'static) -> Self {
        self.callbacks.set_on_disconnect(cb);
        self
    }

    pub fn build(self) -> Result<TcpServer, chanio_core::ValidationError> {
        chanio_core::validate::validate_host(&self.host)?;
        chanio_core::validate::validate_port(self.port)?;
        chanio_core::validate::validate_backpressure_threshold(self.backpressure_threshold)?;
        chanio_core::validate::validate_max_retries(self.max_bind_retries)?;
        chanio_core::validate::validate_retry_interval_ms(self.port_retry_interval_ms)?;

        let config = TcpServerConfig {
            host: self.host,
            port: self.port as u16,
            max_connections: ClientLimit::from_max_connections(self.max_connections),
            backpressure_threshold: self.backpressure_threshold,
            idle_timeout_ms: self.idle_timeout_ms,
        };
        let bind_retry_policy = self
            .bind_retry_policy
            .unwrap_or_else(|| Arc::new(FixedInterval::new(Duration::from_millis(self.port_retry_interval_ms))));

        Ok(TcpServer {
            inner: Arc::new(ServerInner {
                config,
                enable_port_retry: self.enable_port_retry,
                max_bind_retries: self.max_bind_retries,
                bind_retry_policy,
                state: AtomicLinkState::new(LinkState::Idle),
                stop: StopFlag::new(),
                stop_notify: Notify::new(),
                callbacks: self.callbacks,
                registry: SessionRegistry::new(ClientLimit::from_max_connections(self.max_connections).limit()),
                bound_addr: parking_lot::Mutex::new(None),
                listening_notify: Notify::new(),
                state_debouncer: parking_lot::Mutex::new(StateDebouncer::new(SystemClock, STATE_DEBOUNCE_WINDOW)),
            }),
            auto_manage: self.auto_manage,
        })
    }
}

struct ServerInner {
    config: TcpServerConfig,
    enable_port_retry: bool,
    max_bind_retries: i32,
    bind_retry_policy: Arc<dyn ReconnectPolicy>,
    state: AtomicLinkState,
    stop: StopFlag,
    stop_notify: Notify,
    callbacks: Callbacks,
    registry: SessionRegistry,
    bound_addr: parking_lot::Mutex<Option<std::net::SocketAddr>>,
    listening_notify: Notify,
    state_debouncer: parking_lot::Mutex<StateDebouncer<SystemClock>>,
}

/// A multi-client TCP server.
pub struct TcpServer {
    inner: Arc<ServerInner>,
    auto_manage: bool,
}

impl TcpServer {
    pub fn state(&self) -> LinkState {
        self.inner.state.load()
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Replaces the unified data callback after construction. Useful when
    /// the callback itself needs a handle to this server (e.g. an echo
    /// handler calling [`TcpServer::send_to`]), which isn't available yet
    /// while the builder is still being assembled.
    pub fn set_on_data(&self, cb: impl FnMut(MessageContext) + Send + 'static) {
        self.inner.callbacks.set_on_bytes(cb);
    }

    pub fn connected_client_ids(&self) -> Vec<u64> {
        self.inner.registry.client_ids()
    }

    /// The OS-assigned local address once bound (e.g. after binding to
    /// port `0`), or `None` before the first successful bind.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.inner.bound_addr.lock()
    }

    /// Resolves once the server reaches `Listening`, primarily useful in
    /// tests that bind an ephemeral port and need to learn it before
    /// connecting a client.
    pub async fn wait_until_listening(&self) -> std::net::SocketAddr {
        loop {
            if let Some(addr) = self.local_addr() {
                return addr;
            }
            self.inner.listening_notify.notified().await;
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        let inner = self.inner.clone();
        let listener = match self.bind_with_retry().await {
            Some(listener) => listener,
            None => return,
        };

        *inner.bound_addr.lock() = listener.local_addr().ok();
        inner.state.store(LinkState::Listening);
        inner.callbacks.emit_state(&inner.stop, LinkState::Listening);
        inner.listening_notify.notify_waiters();
        info!(host = %inner.config.host, port = inner.config.port, "tcp server listening");

        let reap_period = inner.idle_reap_period();
        let mut reaper = interval(reap_period);

        loop {
            tokio::select! {
                biased;
                _ = inner.wait_for_stop() => {
                    break;
                }
                _ = reaper.tick() => {
                    self.reap_idle_sessions();
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.accept(stream, addr.to_string()),
                        Err(err) => {
                            warn!(%err, "accept failed");
                            inner.callbacks.emit_error(&inner.stop, ErrorContext { code: ErrorKind::IoError, message: err.to_string(), client_id: None });
                        }
                    }
                }
            }
        }

        for session in inner.registry.all() {
            session.request_disconnect();
        }
    }

    async fn bind_with_retry(self: &Arc<Self>) -> Option<TcpListener> {
        let inner = &self.inner;
        let mut attempts = chanio_core::AttemptCounter::new();
        loop {
            if inner.stop.is_set() {
                return None;
            }
            inner.state.store(LinkState::Connecting);
            if inner.state_debouncer.lock().should_emit(LinkState::Connecting) {
                inner.callbacks.emit_state(&inner.stop, LinkState::Connecting);
            }

            let addr = format!("{}:{}", inner.config.host, inner.config.port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => return Some(listener),
                Err(err) => {
                    let err = io_to_channel_error(err);
                    inner.callbacks.emit_error(&inner.stop, ErrorContext { code: err.kind(), message: err.message().to_string(), client_id: None });

                    // Only a port-in-use / access-denied bind failure is
                    // ever retried, and only when the caller opted in; any
                    // other bind error is terminal on the first attempt.
                    let retryable_kind = matches!(err.kind(), ErrorKind::PortInUse | ErrorKind::AccessDenied);
                    if !inner.enable_port_retry || !retryable_kind {
                        inner.fail_terminal(err.kind(), err.message());
                        return None;
                    }

                    let attempt = attempts.record_failure();
                    if chanio_core::reconnect::retry_budget_exhausted(attempt, self.inner.max_bind_retries) {
                        inner.fail_terminal(ErrorKind::StartFailed, "bind retry budget exhausted");
                        return None;
                    }
                    let decision = inner.bind_retry_policy.decide(&err, attempt);
                    if !decision.should_retry {
                        inner.fail_terminal(err.kind(), err.message());
                        return None;
                    }
                    tokio::select! {
                        biased;
                        _ = inner.wait_for_stop() => return None,
                        _ = tokio::time::sleep(decision.delay) => {}
                    }
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, stream: tokio::net::TcpStream, remote_address: String) {
        let inner = self.inner.clone();
        let client_id = inner.registry.allocate_client_id();
        let (read_half, write_half) = stream.into_split();
        let session = Session::new(client_id, remote_address.clone(), write_half, inner.config.backpressure_threshold);

        if !inner.registry.try_register(session.clone()) {
            debug!(client_id, "rejecting connection past max_connections");
            let _ = socket2::SockRef::from(&read_half).shutdown(Shutdown::Both);
            return;
        }

        inner.callbacks.emit_connect(&inner.stop, ConnectionContext { client_id, client_info: remote_address });
        let this = self.clone();
        tokio::spawn(async move { this.serve_session(session, read_half).await });
    }

    async fn serve_session(self: Arc<Self>, session: Arc<Session>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let inner = &self.inner;
        let mut buf = vec![0u8; DEFAULT_READ_BUFFER];
        let remote = session.remote_address.clone();
        let client_id = session.client_id;

        let _disconnect_reason: ChannelError = loop {
            tokio::select! {
                biased;
                _ = inner.wait_for_stop() => break ChannelError::new(ErrorKind::Stopped, "server stopped"),
                _ = session.disconnect_notify.notified() => break ChannelError::new(ErrorKind::Stopped, "session disconnected"),
                read_result = read_half.read(&mut buf) => {
                    match read_result {
                        Ok(0) => break ChannelError::new(ErrorKind::ConnectionReset, "peer closed connection"),
                        Ok(n) => {
                            session.touch();
                            inner.callbacks.emit_bytes(&inner.stop, MessageContext { client_id, data: Bytes::copy_from_slice(&buf[..n]), remote_address: remote.clone() });
                        }
                        Err(err) => break io_to_channel_error(err),
                    }
                }
                _ = session.write_notify.notified() => {
                    if let Err(err) = self.drain_session_writes(&session).await {
                        break err;
                    }
                }
            }
        };

        if let Some(write_half) = session.write_half.lock().as_ref() {
            let _ = socket2::SockRef::from(write_half).shutdown(Shutdown::Both);
        }
        inner.registry.remove(client_id);
        // Every still-open session observes its own disconnect even when the
        // server's shared stop flag is already set, so a clean server-wide
        // shutdown still leaves each client's lifecycle ordered connect < disconnect.
        inner.callbacks.notify_terminal_disconnect(ConnectionContext { client_id, client_info: remote });
    }

    async fn drain_session_writes(&self, session: &Arc<Session>) -> Result<(), ChannelError> {
        loop {
            let payload = {
                let mut queue = session.write_queue.lock();
                if !queue.begin_write() {
                    return Ok(());
                }
                queue.front().cloned()
            };
            let Some(payload) = payload else {
                session.write_queue.lock().end_write();
                return Ok(());
            };

            // Take the half out of the lock before awaiting the write:
            // parking_lot guards are `!Send`, and holding one across an
            // `.await` would make this fn (and everything that spawns it)
            // `!Send` too.
            let mut half = match session.write_half.lock().take() {
                Some(half) => half,
                None => {
                    session.write_queue.lock().end_write();
                    return Err(ChannelError::new(ErrorKind::NotConnected, "session closed"));
                }
            };
            let write_result = half.write(&payload).await;
            *session.write_half.lock() = Some(half);

            let mut queue = session.write_queue.lock();
            match write_result {
                Ok(n) => {
                    queue.advance(n);
                    queue.end_write();
                    session.touch();
                }
                Err(err) => {
                    queue.end_write();
                    return Err(io_to_channel_error(err));
                }
            }
        }
    }

    fn reap_idle_sessions(&self) {
        let inner = &self.inner;
        if inner.config.idle_timeout_ms == 0 {
            return;
        }
        let timeout = Duration::from_millis(inner.config.idle_timeout_ms);
        for session in inner.registry.all() {
            if session.idle_for() >= timeout {
                debug!(client_id = session.client_id, "reaping idle session");
                session.request_disconnect();
            }
        }
    }

    /// Sends `data` to every currently-connected session via a cheap
    /// `Bytes` clone per session.
    pub fn broadcast(&self, data: Bytes) {
        for session in self.inner.registry.all() {
            self.enqueue_on(&session, data.clone());
        }
    }

    /// Sends `data` to a single session, if still connected.
    pub fn send_to(&self, client_id: u64, data: Bytes) -> bool {
        match self.inner.registry.get(client_id) {
            Some(session) => {
                self.enqueue_on(&session, data);
                true
            }
            None => false,
        }
    }

    fn enqueue_on(&self, session: &Arc<Session>, payload: Bytes) {
        match session.enqueue(payload) {
            chanio_core::EnqueueOutcome::Accepted { crossed_threshold } => {
                if crossed_threshold {
                    self.inner.callbacks.emit_backpressure(&self.inner.stop, session.write_queue.lock().queued_bytes());
                }
            }
            chanio_core::EnqueueOutcome::Rejected => {
                self.inner.callbacks.emit_error(
                    &self.inner.stop,
                    ErrorContext { code: ErrorKind::BackpressureExceeded, message: "session write queue exceeded backpressure threshold".into(), client_id: Some(session.client_id) },
                );
                session.request_disconnect();
            }
        }
    }

    /// Idempotent stop: stops accepting new connections and
    /// disconnects every current session. Per-session teardown happens
    /// concurrently on each session's own task; this call does not block
    /// on their completion.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.stop.set() {
            return;
        }
        let previous = inner.state.swap(LinkState::Closed);
        if !previous.is_terminal() {
            inner.callbacks.notify_terminal_state(LinkState::Closed);
        }
        inner.stop_notify.notify_waiters();
        for session in inner.registry.all() {
            session.request_disconnect();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.auto_manage {
            self.stop();
        }
    }
}

impl ServerInner {
    async fn wait_for_stop(&self) {
        loop {
            if self.stop.is_set() {
                return;
            }
            self.stop_notify.notified().await;
        }
    }

    fn idle_reap_period(&self) -> Duration {
        if self.config.idle_timeout_ms == 0 {
            return IDLE_REAP_MAX_INTERVAL;
        }
        Duration::from_millis(self.config.idle_timeout_ms / 4).clamp(IDLE_REAP_MIN_INTERVAL, IDLE_REAP_MAX_INTERVAL)
    }

    fn fail_terminal(&self, kind: ErrorKind, message: &str) {
        let previous = self.state.swap(LinkState::Error);
        if !previous.is_terminal() {
            self.callbacks.emit_error(&self.stop, ErrorContext { code: kind, message: message.to_string(), client_id: None });
            self.callbacks.emit_state(&self.stop, LinkState::Error);
        }
        self.stop.set();
        self.stop_notify.notify_waiters();
    }
}
