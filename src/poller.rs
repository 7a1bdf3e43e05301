//! Long-lived polling engine: one job per `BuilderRequest`, each driving its own connection,
//! retrying with capped backoff, and fanning decoded values into a bounded result channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    BACKOFF_CAP_MS, BACKOFF_INITIAL_MS, BACKOFF_RESET_THRESHOLD_MS, DEFAULT_MAX_CONSECUTIVE_ERRORS,
    JOB_HEALTH_LOG_TICK_SECS,
};
use crate::error::{ModbusError, Result};
use crate::field::{FieldValue, Protocol};
use crate::pdu::{CoilResponse, RegisterResponse, Response};
use crate::register_view::RegisterView;
use crate::splitter::BuilderRequest;
use crate::transport::{Client, ClientConfig};

/// Per-batch counters, read concurrently; matches the teacher's `parking_lot::RwLock`
/// convention for read-heavy shared state.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub start_count: u64,
    pub request_ok_count: u64,
    pub request_err_count: u64,
    pub request_modbus_err_count: u64,
    pub send_skip_count: u64,
    /// True while the job is between ticks; false while backing off.
    pub is_polling: bool,
}

/// One tick's worth of decoded field values. Extraction runs in accumulation mode
/// (`continue_on_extraction_errors = true`): a failed field records its own error string
/// rather than aborting the whole batch.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub batch_index: usize,
    pub time: DateTime<Utc>,
    pub values: Vec<(String, std::result::Result<FieldValue, String>)>,
}

/// Downgrades (or re-raises) an error observed from `do_request`, before it reaches
/// statistics and retry counting. The documented mechanism for ignoring expected Modbus
/// exceptions, e.g. "illegal data address" when a device subsystem is offline.
pub type OnClientDoError = dyn Fn(ModbusError, usize) -> Option<ModbusError> + Send + Sync;

/// Builds a fresh transport client for a batch's `(protocol, server_url)`. The default
/// implementation (`default_connect`) wraps `transport::Client`; callers may substitute a
/// pluggable connector, e.g. to share one connection across jobs targeting a serial device.
pub type ConnectFn = Arc<dyn Fn(Protocol, String) -> BoxFuture<'static, Result<Client>> + Send + Sync>;

pub fn default_connect() -> ConnectFn {
    Arc::new(|_protocol, url| {
        Box::pin(async move {
            let client = Client::new(&url, ClientConfig::default())?;
            client.connect().await?;
            Ok(client)
        })
    })
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub max_consecutive_errors: u32,
    /// Result channel capacity is `channel_capacity_multiplier * num_batches`.
    pub channel_capacity_multiplier: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS, channel_capacity_multiplier: 2 }
    }
}

/// Extracts typed field values out of a decoded response, in accumulation mode: per-field
/// errors are recorded rather than aborting the batch.
fn extract_poll_values(request: &BuilderRequest, response: &Response) -> Vec<(String, std::result::Result<FieldValue, String>)> {
    if let Some(bits) = response.as_coil_set() {
        return request
            .fields
            .iter()
            .map(|field| {
                let idx = field.address.saturating_sub(request.start_address) as usize;
                let value = bits
                    .get(idx)
                    .map(|&b| FieldValue::Bit(b))
                    .ok_or_else(|| "address out of bounds".to_string());
                (field.name.clone(), value)
            })
            .collect();
    }

    let registers = response.as_registers().unwrap_or(&[]);
    let mut raw = Vec::with_capacity(registers.len() * 2);
    for r in registers {
        raw.extend_from_slice(&r.to_be_bytes());
    }
    let view = RegisterView::new(&raw, request.start_address);
    request
        .fields
        .iter()
        .map(|field| (field.name.clone(), field.extract_from(&view).map_err(|e| e.to_string())))
        .collect()
}

/// Whether an error should trigger an immediate connection drop rather than continued
/// retrying on the same connection.
fn needs_reconnect(err: &ModbusError) -> bool {
    matches!(err, ModbusError::NotConnected | ModbusError::Cancelled | ModbusError::TotalReadTimeoutExceeded)
        || !err.is_exception()
}

async fn run_job(
    batch_index: usize,
    request: BuilderRequest,
    connect: ConnectFn,
    on_error: Option<Arc<OnClientDoError>>,
    max_consecutive_errors: u32,
    stats: Arc<RwLock<BatchStats>>,
    results: mpsc::Sender<PollResult>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
    let backoff_cap = Duration::from_millis(BACKOFF_CAP_MS);
    let backoff_reset_threshold = Duration::from_millis(BACKOFF_RESET_THRESHOLD_MS);
    let health_tick = Duration::from_secs(JOB_HEALTH_LOG_TICK_SECS);

    'connect: loop {
        if cancel.is_cancelled() {
            debug!(batch_index, "job cancelled before connect");
            return;
        }
        stats.write().is_polling = false;

        let client = tokio::select! {
            _ = cancel.cancelled() => return,
            res = connect(request.protocol, request.server_url.clone()) => res,
        };
        let client = match client {
            Ok(c) => c,
            Err(e) => {
                warn!(batch_index, error = %e, next_retry_ms = backoff.as_millis(), "connect failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {},
                }
                backoff = (backoff * 2).min(backoff_cap);
                continue 'connect;
            },
        };

        info!(batch_index, "connected, entering polling state");
        stats.write().is_polling = true;
        let session_start = tokio::time::Instant::now();
        let mut consecutive_errors = 0u32;
        let mut ticker = tokio::time::interval(request.request_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_health_log = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    client.close().await;
                    debug!(batch_index, "job cancelled, closing connection");
                    return;
                },
                _ = ticker.tick() => {},
            }

            if last_health_log.elapsed() >= health_tick {
                info!(batch_index, elapsed_s = session_start.elapsed().as_secs(), "job health tick");
                last_health_log = tokio::time::Instant::now();
            }

            stats.write().start_count += 1;
            let outcome = client.do_request(&request.request, request.unit_id, &cancel).await;

            let outcome = match outcome {
                Ok(response) => {
                    stats.write().request_ok_count += 1;
                    if session_start.elapsed() > backoff_reset_threshold {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                    }
                    consecutive_errors = 0;
                    let values = extract_poll_values(&request, &response);
                    let result = PollResult { batch_index, time: Utc::now(), values };
                    match results.try_send(result) {
                        Ok(()) => {},
                        Err(_) => stats.write().send_skip_count += 1,
                    }
                    continue;
                },
                Err(e) => e,
            };

            if matches!(outcome, ModbusError::Cancelled) {
                client.close().await;
                return;
            }

            let classified = match on_error.as_ref() {
                Some(f) => f(outcome, batch_index),
                None => Some(outcome),
            };
            let Some(err) = classified else {
                // Downgraded to None: suppressed from statistics and retry counting.
                continue;
            };

            {
                let mut s = stats.write();
                s.request_err_count += 1;
                if err.is_exception() {
                    s.request_modbus_err_count += 1;
                }
            }
            consecutive_errors += 1;
            warn!(batch_index, error = %err, consecutive_errors, "request error");

            if needs_reconnect(&err) || consecutive_errors >= max_consecutive_errors {
                client.close().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {},
                }
                backoff = (backoff * 2).min(backoff_cap);
                continue 'connect;
            }
        }
    }
}

/// Handle returned by `Poller::poll`: a result receiver plus the still-running job tasks.
/// `join` waits for every job to return (normally only after the shared cancellation token
/// fires), matching the contract that the Poller only returns once all jobs have.
pub struct PollerHandle {
    pub results: mpsc::Receiver<PollResult>,
    tasks: JoinSet<()>,
}

impl PollerHandle {
    pub async fn join(mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Owns one job per `BuilderRequest`. A single instance cannot be polled concurrently twice;
/// `is_running` guards against a double `poll()` call.
pub struct Poller {
    requests: Vec<BuilderRequest>,
    config: PollerConfig,
    connect: ConnectFn,
    on_error: Option<Arc<OnClientDoError>>,
    is_running: AtomicBool,
    stats: Vec<Arc<RwLock<BatchStats>>>,
}

impl Poller {
    pub fn new(requests: Vec<BuilderRequest>) -> Self {
        let stats = requests.iter().map(|_| Arc::new(RwLock::new(BatchStats::default()))).collect();
        Self {
            requests,
            config: PollerConfig::default(),
            connect: default_connect(),
            on_error: None,
            is_running: AtomicBool::new(false),
            stats,
        }
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_connect_fn(mut self, connect: ConnectFn) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_error_callback(mut self, callback: Arc<OnClientDoError>) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.requests.len()
    }

    /// Current statistics snapshot for `batch_index`.
    pub fn stats(&self, batch_index: usize) -> Option<BatchStats> {
        self.stats.get(batch_index).map(|s| s.read().clone())
    }

    /// Start every job. Returns a handle exposing the fan-in result channel; the caller must
    /// eventually cancel `cancel` and await `handle.join()` to observe clean shutdown.
    pub fn poll(&self, cancel: CancellationToken) -> Result<PollerHandle> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(ModbusError::Validation("poller is already running".into()));
        }

        let capacity = (self.config.channel_capacity_multiplier * self.requests.len()).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let mut tasks = JoinSet::new();

        for (idx, request) in self.requests.iter().cloned().enumerate() {
            let connect = self.connect.clone();
            let on_error = self.on_error.clone();
            let max_consecutive_errors = self.config.max_consecutive_errors;
            let stats = self.stats[idx].clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(run_job(idx, request, connect, on_error, max_consecutive_errors, stats, tx, cancel));
        }
        drop(tx);

        Ok(PollerHandle { results: rx, tasks })
    }
}

/// Collapses a stream of `PollResult`s into the latest value per field name, convenient for
/// consumers that only care about current state rather than the full tick history.
pub fn latest_values(results: &[PollResult]) -> HashMap<String, FieldValue> {
    let mut out = HashMap::new();
    for result in results {
        for (name, value) in &result.values {
            if let Ok(v) = value {
                out.insert(name.clone(), v.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_order::ByteOrder;
    use crate::field::{Field, FieldType};
    use crate::pdu::Request;
    use crate::server::{serve_tcp, FrameHandler};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::net::TcpListener;

    fn sample_request() -> BuilderRequest {
        let field = Field {
            name: "temp".into(),
            server_url: "tcp://127.0.0.1:15021".into(),
            unit_id: 1,
            function_code: 3,
            protocol: Protocol::Tcp,
            request_interval: Duration::from_millis(20),
            address: 0,
            field_type: FieldType::Uint16,
            bit: None,
            from_high_byte: false,
            length: None,
            byte_order: ByteOrder::BigEndian,
            invalid: None,
        };
        BuilderRequest {
            server_url: field.server_url.clone(),
            unit_id: 1,
            function_code: 3,
            protocol: Protocol::Tcp,
            request_interval: field.request_interval,
            start_address: 0,
            quantity: 1,
            fields: vec![field],
            request: Request::ReadHoldingRegisters { start_address: 0, quantity: 1 },
        }
    }

    #[tokio::test]
    async fn poller_retries_and_counts_skips_on_persistent_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let connect: ConnectFn = Arc::new(move |_protocol, _url| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ModbusError::NotConnected)
            })
        });

        let poller = Poller::new(vec![sample_request()])
            .with_config(PollerConfig { max_consecutive_errors: 5, channel_capacity_multiplier: 2 })
            .with_connect_fn(connect);

        let cancel = CancellationToken::new();
        let handle = poller.poll(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.join().await;

        assert!(attempts.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn double_poll_is_rejected() {
        let poller = Poller::new(vec![sample_request()]);
        poller.is_running.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        assert!(poller.poll(cancel).is_err());
    }

    /// A loopback peer that answers every read-holding-registers request with an
    /// `IllegalDataValue` exception, for scenario 6 (persistent exception retry/count).
    struct AlwaysIllegalDataValue;

    #[async_trait]
    impl FrameHandler for AlwaysIllegalDataValue {
        async fn handle(&self, _unit_id: u8, request_pdu: &[u8]) -> Vec<u8> {
            vec![request_pdu[0] | 0x80, 0x03]
        }
    }

    /// A loopback peer that always answers with a fixed-value holding-register response.
    struct ConstantRegister;

    #[async_trait]
    impl FrameHandler for ConstantRegister {
        async fn handle(&self, _unit_id: u8, request_pdu: &[u8]) -> Vec<u8> {
            let quantity = u16::from_be_bytes([request_pdu[3], request_pdu[4]]);
            let mut pdu = vec![request_pdu[0], (quantity * 2) as u8];
            for _ in 0..quantity {
                pdu.extend_from_slice(&1u16.to_be_bytes());
            }
            pdu
        }
    }

    fn request_against(addr: std::net::SocketAddr, interval: Duration) -> BuilderRequest {
        let mut request = sample_request();
        request.server_url = format!("tcp://{addr}");
        request.request_interval = interval;
        for field in &mut request.fields {
            field.server_url = request.server_url.clone();
            field.request_interval = interval;
        }
        request
    }

    #[tokio::test]
    async fn scenario_6_persistent_exception_counts_both_error_tallies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_cancel = CancellationToken::new();
        let server = tokio::spawn(serve_tcp(listener, Arc::new(AlwaysIllegalDataValue), server_cancel.clone()));

        let request = request_against(addr, Duration::from_millis(5));
        let poller = Poller::new(vec![request])
            .with_config(PollerConfig { max_consecutive_errors: 5, channel_capacity_multiplier: 2 })
            .with_error_callback(Arc::new(|e, _batch_index| Some(e)));

        let cancel = CancellationToken::new();
        let handle = poller.poll(cancel.clone()).unwrap();

        let mut stats = poller.stats(0).unwrap();
        for _ in 0..300 {
            stats = poller.stats(0).unwrap();
            if stats.request_modbus_err_count >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(stats.request_err_count >= 5, "request_err_count = {}", stats.request_err_count);
        assert!(stats.request_modbus_err_count >= 5, "request_modbus_err_count = {}", stats.request_modbus_err_count);
        assert_eq!(stats.request_err_count, stats.request_modbus_err_count);

        cancel.cancel();
        handle.join().await;
        server_cancel.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn send_skip_count_increments_when_results_channel_is_full() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_cancel = CancellationToken::new();
        let server = tokio::spawn(serve_tcp(listener, Arc::new(ConstantRegister), server_cancel.clone()));

        let request = request_against(addr, Duration::from_millis(2));
        let poller = Poller::new(vec![request])
            .with_config(PollerConfig { max_consecutive_errors: 5, channel_capacity_multiplier: 1 });

        let cancel = CancellationToken::new();
        // Hold the handle (and its receiver) without ever draining it, so the capacity-1
        // channel fills after the first successful result.
        let handle = poller.poll(cancel.clone()).unwrap();

        let mut stats = poller.stats(0).unwrap();
        for _ in 0..300 {
            stats = poller.stats(0).unwrap();
            if stats.send_skip_count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stats.send_skip_count > 0, "send_skip_count = {}", stats.send_skip_count);

        cancel.cancel();
        handle.join().await;
        server_cancel.cancel();
        let _ = server.await;
    }
}
