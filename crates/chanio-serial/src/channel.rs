//! Serial port channel: open → configure → read/write loop → reopen on
//! error, mirroring the TCP client's reconnection engine shape but without
//! a resolve step and with a device path in place of a host/port pair.

use bytes::Bytes;
use chanio_core::{
    AtomicLinkState, AttemptCounter, Callbacks, ChannelError, ConnectionContext, EnqueueOutcome,
    ErrorContext, ErrorKind, FixedInterval, LinkState, MessageContext, ReconnectPolicy,
    StateDebouncer, StopFlag, SystemClock, ValidationError, WriteQueue, SINGLE_CHANNEL_CLIENT_ID,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::Notify;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, warn};

const DEFAULT_READ_BUFFER: usize = 4096;
const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 1024 * 1024;
const STATE_DEBOUNCE_WINDOW: Duration = Duration::from_millis(10);
const DEFAULT_REOPEN_INTERVAL: Duration = Duration::from_millis(2000);
const DEFAULT_MAX_RETRIES: i32 = -1;

#[derive(Clone)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    pub flow_control: String,
    pub backpressure_threshold: usize,
    pub read_buffer_size: usize,
}

pub struct SerialChannelBuilder {
    device: String,
    baud_rate: u32,
    data_bits: u8,
    stop_bits: u8,
    parity: String,
    flow_control: String,
    backpressure_threshold: usize,
    reopen_on_error: bool,
    max_retries: i32,
    retry_interval_ms: u64,
    reopen_policy: Option<Arc<dyn ReconnectPolicy>>,
    callbacks: Callbacks,
    auto_manage: bool,
}

impl SerialChannelBuilder {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            flow_control: "none".to_string(),
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            reopen_on_error: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_REOPEN_INTERVAL.as_millis() as u64,
            reopen_policy: None,
            callbacks: Callbacks::new(),
            auto_manage: false,
        }
    }

    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    pub fn parity(mut self, parity: impl Into<String>) -> Self {
        self.parity = parity.into();
        self
    }

    pub fn flow_control(mut self, flow_control: impl Into<String>) -> Self {
        self.flow_control = flow_control.into();
        self
    }

    pub fn backpressure_threshold(mut self, bytes: usize) -> Self {
        self.backpressure_threshold = bytes;
        self
    }

    /// Whether a read/open error reopens the port after `retry_interval_ms`
    /// (the default) or is treated as an immediate terminal error.
    pub fn reopen_on_error(mut self, enabled: bool) -> Self {
        self.reopen_on_error = enabled;
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_interval_ms(mut self, ms: u64) -> Self {
        self.retry_interval_ms = ms;
        self
    }

    pub fn reopen_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reopen_policy = Some(policy);
        self
    }

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

    pub fn build(self) -> Result<SerialChannel, ValidationError> {
        chanio_core::validate::validate_device_path(&self.device)?;
        chanio_core::validate::validate_baud_rate(self.baud_rate)?;
        chanio_core::validate::validate_data_bits(self.data_bits)?;
        chanio_core::validate::validate_stop_bits(self.stop_bits)?;
        chanio_core::validate::validate_parity(&self.parity)?;
        chanio_core::validate::validate_flow_control(&self.flow_control)?;
        chanio_core::validate::validate_max_retries(self.max_retries)?;
        chanio_core::validate::validate_backpressure_threshold(self.backpressure_threshold)?;
        chanio_core::validate::validate_retry_interval_ms(self.retry_interval_ms)?;

        let config = SerialConfig {
            device: self.device,
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            flow_control: self.flow_control,
            backpressure_threshold: self.backpressure_threshold,
            read_buffer_size: DEFAULT_READ_BUFFER,
        };
        let policy = self
            .reopen_policy
            .unwrap_or_else(|| Arc::new(FixedInterval::new(Duration::from_millis(self.retry_interval_ms))));
        let write_queue = parking_lot::Mutex::new(WriteQueue::new(config.backpressure_threshold));

        Ok(SerialChannel {
            inner: Arc::new(ChannelInner {
                config,
                reopen_on_error: self.reopen_on_error,
                max_retries: self.max_retries,
                policy,
                state: AtomicLinkState::new(LinkState::Idle),
                stop: StopFlag::new(),
                stop_notify: Notify::new(),
                callbacks: self.callbacks,
                write_queue,
                write_notify: Notify::new(),
                write_half: parking_lot::Mutex::new(None),
                state_debouncer: parking_lot::Mutex::new(StateDebouncer::new(SystemClock, STATE_DEBOUNCE_WINDOW)),
            }),
            auto_manage: self.auto_manage,
        })
    }
}

struct ChannelInner {
    config: SerialConfig,
    reopen_on_error: bool,
    max_retries: i32,
    policy: Arc<dyn ReconnectPolicy>,
    state: AtomicLinkState,
    stop: StopFlag,
    stop_notify: Notify,
    callbacks: Callbacks,
    write_queue: parking_lot::Mutex<WriteQueue>,
    write_notify: Notify,
    write_half: parking_lot::Mutex<Option<WriteHalf<SerialStream>>>,
    state_debouncer: parking_lot::Mutex<StateDebouncer<SystemClock>>,
}

/// A serial port channel.
pub struct SerialChannel {
    inner: Arc<ChannelInner>,
    auto_manage: bool,
}

impl SerialChannel {
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

            let open_result = tokio::select! {
                biased;
                _ = inner.wait_for_stop() => return,
                result = inner.open() => result,
            };

            let port = match open_result {
                Ok(port) => port,
                Err(err) => {
                    if inner.stop.is_set() {
                        return;
                    }
                    if !self.handle_open_failure(&mut attempts, err).await {
                        return;
                    }
                    continue;
                }
            };

            attempts.reset();
            inner.state.store(LinkState::Connected);
            inner.callbacks.emit_connect(&inner.stop, ConnectionContext { client_id: SINGLE_CHANNEL_CLIENT_ID, client_info: inner.config.device.clone() });
            inner.callbacks.emit_state(&inner.stop, LinkState::Connected);

            let disconnect_reason = self.serve(port).await;
            if inner.stop.is_set() {
                return;
            }

            inner.callbacks.emit_disconnect(&inner.stop, ConnectionContext { client_id: SINGLE_CHANNEL_CLIENT_ID, client_info: inner.config.device.clone() });

            if !self.handle_open_failure(&mut attempts, disconnect_reason).await {
                return;
            }
        }
    }

    async fn handle_open_failure(&self, attempts: &mut AttemptCounter, err: ChannelError) -> bool {
        let inner = &self.inner;
        if !inner.reopen_on_error {
            inner.callbacks.emit_error(&inner.stop, ErrorContext { code: err.kind(), message: err.message().to_string(), client_id: None });
            inner.fail_terminal(err.kind(), err.message());
            return false;
        }
        let attempt = attempts.record_failure();
        if chanio_core::reconnect::retry_budget_exhausted(attempt, inner.max_retries) {
            warn!(attempt, device = %inner.config.device, "serial reopen budget exhausted, giving up");
            inner.fail_terminal(ErrorKind::StartFailed, "reopen retry budget exhausted");
            return false;
        }
        let decision = inner.policy.decide(&err, attempt);
        inner.callbacks.emit_error(&inner.stop, ErrorContext { code: err.kind(), message: err.message().to_string(), client_id: None });
        if !decision.should_retry {
            inner.fail_terminal(err.kind(), err.message());
            return false;
        }
        debug!(attempt, delay_ms = decision.delay.as_millis() as u64, "scheduling serial reopen");
        tokio::select! {
            biased;
            _ = inner.wait_for_stop() => false,
            _ = tokio::time::sleep(decision.delay) => true,
        }
    }

    async fn serve(&self, port: SerialStream) -> ChannelError {
        let inner = &self.inner;
        let (mut read_half, write_half) = split(port);
        *inner.write_half.lock() = Some(write_half);

        let mut buf = vec![0u8; inner.config.read_buffer_size];
        let device = inner.config.device.clone();

        let result = loop {
            tokio::select! {
                biased;
                _ = inner.wait_for_stop() => break ChannelError::new(ErrorKind::Stopped, "stopped"),
                read_result = read_half.read(&mut buf) => {
                    match read_result {
                        Ok(0) => break ChannelError::new(ErrorKind::ConnectionReset, "serial port closed"),
                        Ok(n) => {
                            inner.callbacks.emit_bytes(&inner.stop, MessageContext { client_id: SINGLE_CHANNEL_CLIENT_ID, data: Bytes::copy_from_slice(&buf[..n]), remote_address: device.clone() });
                        }
                        Err(err) => break ChannelError::from(err),
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
        drop(read_half);
        result
    }

    pub fn write_copy(&self, data: &[u8]) {
        self.enqueue(Bytes::copy_from_slice(data));
    }

    pub fn write_owned(&self, data: Vec<u8>) {
        self.enqueue(Bytes::from(data));
    }

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

    /// Idempotent stop. Dropping the write half (and, once the
    /// read loop observes the stop flag, the read half) closes the
    /// underlying file descriptor — there is no socket-level shutdown call
    /// to make for a serial port the way there is for a TCP stream.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.stop.set() {
            return;
        }
        *inner.write_half.lock() = None;
        inner.write_queue.lock().drain();
        let previous = inner.state.swap(LinkState::Closed);
        if !previous.is_terminal() {
            inner.callbacks.notify_terminal_state(LinkState::Closed);
        }
        inner.stop_notify.notify_waiters();
        inner.write_notify.notify_waiters();
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        if self.auto_manage {
            self.stop();
        }
    }
}

impl ChannelInner {
    async fn wait_for_stop(&self) {
        loop {
            if self.stop.is_set() {
                return;
            }
            self.stop_notify.notified().await;
        }
    }

    async fn open(&self) -> Result<SerialStream, ChannelError> {
        tokio_serial::new(&self.config.device, self.config.baud_rate)
            .data_bits(to_data_bits(self.config.data_bits))
            .stop_bits(to_stop_bits(self.config.stop_bits))
            .parity(to_parity(&self.config.parity))
            .flow_control(to_flow_control(&self.config.flow_control))
            .open_native_async()
            .map_err(|err| ChannelError::from(io::Error::new(io::ErrorKind::Other, err)))
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
                    return Err(ChannelError::from(err));
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

fn to_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn to_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

fn to_parity(parity: &str) -> Parity {
    match parity.to_ascii_lowercase().as_str() {
        "odd" => Parity::Odd,
        "even" => Parity::Even,
        _ => Parity::None,
    }
}

fn to_flow_control(flow_control: &str) -> FlowControl {
    match flow_control.to_ascii_lowercase().as_str() {
        "sw" => FlowControl::Software,
        "hw" => FlowControl::Hardware,
        _ => FlowControl::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accepts_a_well_formed_configuration() {
        let channel = SerialChannelBuilder::new("/dev/ttyUSB0", 115_200)
            .data_bits(8)
            .stop_bits(1)
            .parity("none")
            .build();
        assert!(channel.is_ok());
        assert_eq!(channel.unwrap().state(), LinkState::Idle);
    }

    #[test]
    fn builder_rejects_bad_device_path() {
        let err = SerialChannelBuilder::new("relative/path", 9600).build().unwrap_err();
        assert_eq!(err.field, "device");
    }

    #[test]
    fn builder_rejects_out_of_range_baud_rate() {
        let err = SerialChannelBuilder::new("/dev/ttyUSB0", 5).build().unwrap_err();
        assert_eq!(err.field, "baud_rate");
    }

    #[test]
    fn builder_rejects_unknown_parity() {
        let err = SerialChannelBuilder::new("/dev/ttyUSB0", 9600).parity("mark").build().unwrap_err();
        assert_eq!(err.field, "parity");
    }

    #[test]
    fn data_bits_stop_bits_parity_map_to_tokio_serial_variants() {
        assert_eq!(to_data_bits(7), DataBits::Seven);
        assert_eq!(to_stop_bits(2), StopBits::Two);
        assert_eq!(to_parity("EVEN"), Parity::Even);
        assert_eq!(to_parity("bogus"), Parity::None);
    }

    #[test]
    fn flow_control_maps_to_tokio_serial_variants() {
        assert_eq!(to_flow_control("HW"), FlowControl::Hardware);
        assert_eq!(to_flow_control("sw"), FlowControl::Software);
        assert_eq!(to_flow_control("bogus"), FlowControl::None);
    }

    #[test]
    fn builder_rejects_unknown_flow_control() {
        let err = SerialChannelBuilder::new("/dev/ttyUSB0", 9600).flow_control("xonxoff").build().unwrap_err();
        assert_eq!(err.field, "flow_control");
    }

    #[test]
    fn builder_accepts_flow_control_and_reopen_knobs() {
        let channel = SerialChannelBuilder::new("/dev/ttyUSB0", 115_200)
            .flow_control("hw")
            .reopen_on_error(false)
            .retry_interval_ms(500)
            .build();
        assert!(channel.is_ok());
    }
}

