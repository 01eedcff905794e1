//! TCP client channel: resolve → connect → read/write loop → reconnect.
//!
//! The socket is owned end-to-end by one dedicated task rather than
//! guarded by a shared async mutex, so the read and write halves can make
//! progress concurrently without contending on the same lock.

use crate::error_map::io_to_channel_error;
use bytes::Bytes;
use chanio_core::{
    AtomicLinkState, Callbacks, ChannelError, ConnectionContext, ErrorContext, ErrorKind,
    FixedInterval, LinkState, MessageContext, ReconnectPolicy, StateDebouncer, StopFlag,
    SystemClock, WriteQueue, AttemptCounter, EnqueueOutcome, SINGLE_CHANNEL_CLIENT_ID,
};
use socket2::SockRef;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_READ_BUFFER: usize = 4096;
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(2000);
const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 1024 * 1024;
const DEFAULT_MAX_RETRIES: i32 = -1;
const STATE_DEBOUNCE_WINDOW: Duration = Duration::from_millis(10);

/// Validated, immutable connection parameters.
#[derive(Clone)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    pub connection_timeout: Duration,
    pub backpressure_threshold: usize,
    pub max_retries: i32,
    pub read_buffer_size: usize,
}

/// Builds a [`TcpClient`]. All setters are infallible; `build()` runs every
/// validation rule once, before any reactor task exists, and returns an
/// error instead of constructing a channel if one fails.
pub struct TcpClientBuilder {
    host: String,
    port: u32,
    connection_timeout_ms: u64,
    backpressure_threshold: usize,
    max_retries: i32,
    retry_interval_ms: u64,
    reconnect_policy: Option<Arc<dyn ReconnectPolicy>>,
    callbacks: Callbacks,
    auto_manage: bool,
}

impl TcpClientBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: port as u32,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            reconnect_policy: None,
            callbacks: Callbacks::new(),
            auto_manage: false,
        }
    }

    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    pub fn backpressure_threshold(mut self, bytes: usize) -> Self {
        self.backpressure_threshold = bytes;
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay between reconnect attempts under the default fixed-interval
    /// policy. Ignored once a custom [`reconnect_policy`](Self::reconnect_policy) is set.
    pub fn retry_interval_ms(mut self, ms: u64) -> Self {
        self.retry_interval_ms = ms;
        self
    }

    pub fn reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect_policy = Some(policy);
        self
    }

    /// Stop the channel automatically when the returned [`TcpClient`] handle
    /// is dropped, mirroring the original's RAII `resource_manager.cc`
    /// convenience (supplemented feature, see DESIGN.md).
    pub fn auto_manage(mut self, enabled: bool) -> Self {
        self.auto_manage = enabled;
        self
    }

    pub fn on_bytes(self, cb: impl FnMut(MessageContext) + Send + 'static) -> Self {
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

    pub fn build(self) -> Result<TcpClient, chanio_core::ValidationError> {
        chanio_core::validate::validate_host(&self.host)?;
        chanio_core::validate::validate_port(self.port)?;
        chanio_core::validate::validate_connection_timeout_ms(self.connection_timeout_ms)?;
        chanio_core::validate::validate_max_retries(self.max_retries)?;
        chanio_core::validate::validate_backpressure_threshold(self.backpressure_threshold)?;
        chanio_core::validate::validate_retry_interval_ms(self.retry_interval_ms)?;

        let config = TcpClientConfig {
            host: self.host,
            port: self.port as u16,
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            backpressure_threshold: self.backpressure_threshold,
            max_retries: self.max_retries,
            read_buffer_size: DEFAULT_READ_BUFFER,
        };
        let policy = self
            .reconnect_policy
            .unwrap_or_else(|| Arc::new(FixedInterval::new(Duration::from_millis(self.retry_interval_ms))));
        let write_queue = parking_lot::Mutex::new(WriteQueue::new(config.backpressure_threshold));

        Ok(TcpClient {
            inner: Arc::new(ClientInner {
                config,
                policy,
                state: AtomicLinkState::new(LinkState::Idle),
                stop: StopFlag::new(),
                callbacks: self.callbacks,
                write_queue,
                write_notify: Notify::new(),
                stop_notify: Notify::new(),
                write_half: parking_lot::Mutex::new(None),
                state_debouncer: parking_lot::Mutex::new(StateDebouncer::new(SystemClock, STATE_DEBOUNCE_WINDOW)),
            }),
            auto_manage: self.auto_manage,
        })
    }
}

struct ClientInner {
    config: TcpClientConfig,
    policy: Arc<dyn ReconnectPolicy>,
    state: AtomicLinkState,
    stop: StopFlag,
    callbacks: Callbacks,
    write_queue: parking_lot::Mutex<WriteQueue>,
    write_notify: Notify,
    stop_notify: Notify,
    write_half: parking_lot::Mutex<Option<OwnedWriteHalf>>,
    state_debouncer: parking_lot::Mutex<StateDebouncer<SystemClock>>,
}

/// A TCP client channel with a built-in reconnection engine.
///
/// `start()` spawns the resolve/connect/read/write/reconnect loop on the
/// caller's Tokio runtime and returns immediately; the loop runs until
/// `stop()` is called or the reconnect policy gives up.
pub struct TcpClient {
    inner: Arc<ClientInner>,
    auto_manage: bool,
}

impl TcpClient {
    pub fn state(&self) -> LinkState {
        self.inner.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Replaces the `on_bytes` callback after construction (see
    /// `TcpServer::set_on_data` for the motivating use case).
    pub fn set_on_bytes(&self, cb: impl FnMut(MessageContext) + Send + 'static) {
        self.inner.callbacks.set_on_bytes(cb);
    }

    /// Spawns the engine task. Calling `start()` more than once is a no-op
    /// after the first call returns a handle; callers that need to restart
    /// a stopped channel should build a new one — `start()`/`stop()` is not
    /// a resumable pair.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        let inner = self.inner.clone();
        let mut attempts = AttemptCounter::new();

        loop {
            if inner.stop.is_set() {
                return;
            }
            inner.state.store(LinkState::Connecting);
            if inner.state_debouncer.lock().should_emit(LinkState::Connecting) {
                inner.callbacks.emit_state(&inner.stop, LinkState::Connecting);
            }

            let connect_result = tokio::select! {
                biased;
                _ = inner.wait_for_stop() => {
                    return;
                }
                result = inner.connect() => result,
            };

            let stream = match connect_result {
                Ok(stream) => stream,
                Err(err) => {
                    if inner.stop.is_set() {
                        return;
                    }
                    if !self.handle_connect_failure(&mut attempts, err).await {
                        return;
                    }
                    continue;
                }
            };

            attempts.reset();
            inner.state.store(LinkState::Connected);
            inner.callbacks.emit_connect(
                &inner.stop,
                ConnectionContext { client_id: SINGLE_CHANNEL_CLIENT_ID, client_info: format!("{}:{}", inner.config.host, inner.config.port) },
            );
            inner.callbacks.emit_state(&inner.stop, LinkState::Connected);

            let disconnect_reason = self.serve(stream).await;

            if inner.stop.is_set() {
                return;
            }

            inner.callbacks.emit_disconnect(
                &inner.stop,
                ConnectionContext { client_id: SINGLE_CHANNEL_CLIENT_ID, client_info: format!("{}:{}", inner.config.host, inner.config.port) },
            );

            if !self.handle_connect_failure(&mut attempts, disconnect_reason).await {
                return;
            }
        }
    }

    /// Applies the reconnect policy to a failed attempt, sleeps for the
    /// resulting delay (cancellable by `stop()`), and reports whether the
    /// caller's loop should try again.
    async fn handle_connect_failure(&self, attempts: &mut AttemptCounter, err: ChannelError) -> bool {
        let inner = &self.inner;
        let attempt = attempts.record_failure();
        if chanio_core::reconnect::retry_budget_exhausted(attempt, inner.config.max_retries) {
            warn!(attempt, "tcp client retry budget exhausted, giving up");
            inner.fail_terminal(ErrorKind::StartFailed, "retry budget exhausted");
            return false;
        }
        let decision = inner.policy.decide(&err, attempt);
        inner.callbacks.emit_error(
            &inner.stop,
            ErrorContext { code: err.kind(), message: err.message().to_string(), client_id: None },
        );
        if !decision.should_retry {
            inner.fail_terminal(err.kind(), err.message());
            return false;
        }
        debug!(attempt, delay_ms = decision.delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            biased;
            _ = inner.wait_for_stop() => false,
            _ = tokio::time::sleep(decision.delay) => true,
        }
    }

    /// Runs the read loop and write-drain loop concurrently until either
    /// side observes an error, EOF, or the stop signal. Returns the error
    /// that ended the connection (a "stopped" error if it was cancellation).
    async fn serve(&self, stream: TcpStream) -> ChannelError {
        let inner = &self.inner;
        let (mut read_half, write_half) = stream.into_split();
        *inner.write_half.lock() = Some(write_half);

        let mut buf = vec![0u8; inner.config.read_buffer_size];
        let remote = format!("{}:{}", inner.config.host, inner.config.port);

        let result = loop {
            tokio::select! {
                biased;
                _ = inner.wait_for_stop() => {
                    break ChannelError::new(ErrorKind::Stopped, "stopped");
                }
                read_result = read_half.read(&mut buf) => {
                    match read_result {
                        Ok(0) => break ChannelError::new(ErrorKind::ConnectionReset, "peer closed connection"),
                        Ok(n) => {
                            inner.callbacks.emit_bytes(
                                &inner.stop,
                                MessageContext {
                                    client_id: SINGLE_CHANNEL_CLIENT_ID,
                                    data: Bytes::copy_from_slice(&buf[..n]),
                                    remote_address: remote.clone(),
                                },
                            );
                        }
                        Err(err) => break io_to_channel_error(err),
                    }
                }
                _ = inner.write_notify.notified() => {
                    if let Err(err) = inner.drain_write_queue().await {
                        break err;
                    }
                }
            }
        };

        *inner.write_half.lock() = None;
        result
    }

    /// Copies `data` into a fresh buffer and enqueues it.
    pub fn write_copy(&self, data: &[u8]) {
        self.enqueue(Bytes::copy_from_slice(data));
    }

    /// Moves an owned buffer into the queue without copying.
    pub fn write_owned(&self, data: Vec<u8>) {
        self.enqueue(Bytes::from(data));
    }

    /// Enqueues a cheap clone of an already-shared buffer — the same
    /// `Bytes` can be handed to other channels, e.g. a server's broadcast,
    /// without re-copying.
    pub fn write_shared(&self, data: Bytes) {
        self.enqueue(data);
    }

    fn enqueue(&self, payload: Bytes) {
        let inner = &self.inner;
        if inner.stop.is_set() {
            return;
        }
        let outcome = inner.write_queue.lock().enqueue(payload);
        match outcome {
            EnqueueOutcome::Accepted { crossed_threshold } => {
                if crossed_threshold {
                    inner.callbacks.emit_backpressure(&inner.stop, inner.write_queue.lock().queued_bytes());
                }
                inner.write_notify.notify_one();
            }
            EnqueueOutcome::Rejected => {
                inner.fail_terminal(ErrorKind::BackpressureExceeded, "write queue exceeded backpressure threshold");
            }
        }
    }

    /// Idempotent stop: sets the flag, shuts down the socket if
    /// one is open, drains the write queue, and emits exactly one terminal
    /// `Closed` notification unless the channel was already terminal.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.stop.set() {
            return;
        }
        if let Some(write_half) = inner.write_half.lock().as_ref() {
            if let Err(err) = SockRef::from(write_half).shutdown(Shutdown::Both) {
                debug!(%err, "socket shutdown during stop() failed (benign if already closed)");
            }
        }
        inner.write_queue.lock().drain();
        let previous = inner.state.swap(LinkState::Closed);
        if !previous.is_terminal() {
            inner.callbacks.notify_terminal_state(LinkState::Closed);
        }
        inner.stop_notify.notify_waiters();
        inner.write_notify.notify_waiters();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        if self.auto_manage {
            self.stop();
        }
    }
}

impl ClientInner {
    async fn wait_for_stop(&self) {
        loop {
            if self.stop.is_set() {
                return;
            }
            self.stop_notify.notified().await;
        }
    }

    async fn connect(&self) -> Result<TcpStream, ChannelError> {
        let addr = format!("{}:{}", self.host_for_resolve(), self.config.port);
        let connect_fut = TcpStream::connect(&addr);
        match timeout(self.config.connection_timeout, connect_fut).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(io_to_channel_error(err)),
            Err(_) => Err(ChannelError::new(ErrorKind::TimedOut, "connection attempt timed out")),
        }
    }

    fn host_for_resolve(&self) -> &str {
        &self.config.host
    }

    async fn drain_write_queue(&self) -> Result<(), ChannelError> {
        loop {
            let payload = {
                let mut queue = self.write_queue.lock();
                if !queue.begin_write() {
                    return Ok(());
                }
                queue.front().cloned()
            };
            let Some(payload) = payload else {
                self.write_queue.lock().end_write();
                return Ok(());
            };

            // Take the half out of the lock before awaiting the write:
            // parking_lot guards are `!Send`, and holding one across an
            // `.await` would make this fn (and everything that spawns it)
            // `!Send` too.
            let mut half = match self.write_half.lock().take() {
                Some(half) => half,
                None => {
                    self.write_queue.lock().end_write();
                    return Err(ChannelError::new(ErrorKind::NotConnected, "not connected"));
                }
            };
            let write_result = half.write(&payload).await;
            *self.write_half.lock() = Some(half);

            let mut queue = self.write_queue.lock();
            match write_result {
                Ok(n) => {
                    queue.advance(n);
                    queue.end_write();
                }
                Err(err) => {
                    queue.end_write();
                    return Err(io_to_channel_error(err));
                }
            }
        }
    }

    fn fail_terminal(&self, kind: ErrorKind, message: &str) {
        let previous = self.state.swap(LinkState::Error);
        if !previous.is_terminal() {
            self.callbacks.emit_error(&self.stop, ErrorContext { code: kind, message: message.to_string(), client_id: None });
            self.callbacks.emit_state(&self.stop, LinkState::Error);
        }
        self.stop.set();
        self.write_queue.lock().drain();
        self.stop_notify.notify_waiters();
        self.write_notify.notify_waiters();
    }
}
