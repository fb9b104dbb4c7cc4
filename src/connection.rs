//! Status channel connection manager.
//!
//! Owns the single logical connection to the pipeline server's status
//! broadcast, turns inbound frames into sink callbacks and reconnects with
//! capped, jittered exponential backoff until stopped.
//!
//! ## Lifecycle
//! - `start` arms a driver task (idempotent while running)
//! - the driver connects, pumps frames, and on close sleeps for exactly one
//!   retry delay before the next attempt; socket and retry timer never coexist
//! - `stop` cancels the driver, closes the open socket and silences the sink
//!   before it returns; `shutdown` also waits for the close handshake
//! - a restarted driver waits for its predecessor, so at most one socket is
//!   ever open
//!
//! Sink callbacks run while the manager's state lock is held. That is what lets
//! `stop` guarantee silence, and it means a sink must never call back into the
//! manager.

use crate::backoff::ReconnectPolicy;
use crate::clarification::ClarificationSession;
use crate::event_log::LogLevel;
use crate::loop_events::LoopEventEntry;
use crate::protocol::{classify, InboundMessage};
use crate::status::{map_code, PipelineStatus};
use crate::transport::{
    status_channel_url, ConnectionError, SocketCloser, SocketEvent, StatusSocket, Transport,
    WebSocketTransport,
};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Supplies the server base URL. Called afresh before every connection
/// attempt, so an edited URL takes effect on the next reconnect.
pub type UrlProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Receiver of everything the status channel learns.
///
/// Implementations must not call into the [`ConnectionManager`] that drives
/// them.
pub trait StatusSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
    fn status(&self, status: PipelineStatus);
    fn progress_label(&self, label: Option<&str>);
    fn connection_state(&self, connected: bool);
    fn clarification(&self, session: ClarificationSession);
    fn loop_event(&self, event: LoopEventEntry);
}

/// Bookkeeping for the logical connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Whether a connection should be maintained
    pub desired: bool,
    /// Consecutive failed attempts since the last successful open
    pub attempt: u32,
    pub connected: bool,
    /// Delay of the armed retry timer, if one is armed
    pub pending_retry: Option<Duration>,
    /// Retries scheduled since the last `start`
    pub scheduled_retries: u64,
    generation: u64,
}

impl ConnectionState {
    /// Mark the connection as wanted. Returns the new run generation, or
    /// `None` when already running.
    fn begin(&mut self) -> Option<u64> {
        if self.desired {
            return None;
        }
        self.desired = true;
        self.attempt = 0;
        self.connected = false;
        self.pending_retry = None;
        self.scheduled_retries = 0;
        self.generation = self.generation.wrapping_add(1);
        Some(self.generation)
    }

    /// A socket opened successfully
    pub fn opened(&mut self) {
        self.attempt = 0;
        self.connected = true;
        self.pending_retry = None;
    }

    /// A socket closed (or failed to open). Arms one retry and returns its
    /// delay, or `None` when no connection is wanted.
    pub fn closed(&mut self, policy: &ReconnectPolicy, jitter_fraction: f64) -> Option<Duration> {
        self.connected = false;
        if !self.desired {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        let delay = policy.delay_with_jitter(self.attempt, jitter_fraction);
        self.pending_retry = Some(delay);
        self.scheduled_retries += 1;
        Some(delay)
    }

    /// The armed retry timer fired
    fn retry_fired(&mut self) {
        self.pending_retry = None;
    }

    /// Stop maintaining the connection. Returns `false` if already stopped.
    pub fn stop(&mut self) -> bool {
        if !self.desired {
            return false;
        }
        self.desired = false;
        self.connected = false;
        self.pending_retry = None;
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.desired && self.generation == generation
    }
}

struct Shared {
    state: ConnectionState,
    cancel: Option<CancellationToken>,
    /// Closing side of the open socket, registered only while the run is current
    live: Option<Box<dyn SocketCloser>>,
    /// The most recently spawned driver
    driver: Option<JoinHandle<()>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How long a stopped driver waits for the peer to acknowledge its close.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Keeps one status channel connection alive.
///
/// Construct once at the application root and share by reference.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<Shared>>,
    unknown_codes: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::default(),
                cancel: None,
                live: None,
                driver: None,
            })),
            unknown_codes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Manager over the real WebSocket transport
    pub fn websocket(policy: ReconnectPolicy) -> Self {
        Self::new(Arc::new(WebSocketTransport::new()), policy)
    }

    /// Start maintaining the connection.
    ///
    /// Returns `Ok(false)` without side effects if already running. Must be
    /// called from within a tokio runtime. After a restart the new driver
    /// first waits for the previous one to finish, so two sockets are never
    /// open at once.
    pub fn start(
        &self,
        url_provider: UrlProvider,
        sink: Arc<dyn StatusSink>,
    ) -> Result<bool, ConnectionError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        let mut shared = lock(&self.shared);
        let Some(generation) = shared.state.begin() else {
            log::debug!("Status channel already running; start ignored");
            return Ok(false);
        };

        let cancel = CancellationToken::new();
        shared.cancel = Some(cancel.clone());

        let driver = Driver {
            transport: self.transport.clone(),
            policy: self.policy,
            shared: self.shared.clone(),
            unknown_codes: self.unknown_codes.clone(),
            url_provider,
            sink,
            generation,
            cancel,
            previous: shared.driver.take(),
        };
        shared.driver = Some(runtime.spawn(driver.run()));
        drop(shared);

        log::info!("Status channel started");
        Ok(true)
    }

    /// Stop maintaining the connection: cancels the retry timer and closes
    /// the live socket. No sink callback fires after this returns.
    ///
    /// Returns `false` if the manager was already stopped.
    pub fn stop(&self) -> bool {
        let mut shared = lock(&self.shared);
        let changed = shared.state.stop();
        if let Some(cancel) = shared.cancel.take() {
            cancel.cancel();
        }
        if let Some(closer) = shared.live.take() {
            closer.close();
        }
        if changed {
            log::info!("Status channel stopped");
        }
        changed
    }

    /// Stop, then wait for the driver to finish its close handshake.
    ///
    /// Use this instead of `stop` when the runtime is about to go away.
    pub async fn shutdown(&self) -> bool {
        let changed = self.stop();
        let driver = lock(&self.shared).driver.take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                log::warn!("Status channel driver ended abnormally: {}", e);
            }
        }
        changed
    }

    /// Snapshot of the connection bookkeeping
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).state.desired
    }

    /// Status codes received that the mapping table does not know
    pub fn unknown_codes_observed(&self) -> u64 {
        self.unknown_codes.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One run of the connection loop, from `start` to `stop`.
struct Driver {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<Shared>>,
    unknown_codes: Arc<AtomicU64>,
    url_provider: UrlProvider,
    sink: Arc<dyn StatusSink>,
    generation: u64,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
}

impl Driver {
    /// Run `f` under the state lock if this run is still the live one.
    fn with_current<R>(&self, f: impl FnOnce(&mut ConnectionState, &dyn StatusSink) -> R) -> Option<R> {
        let mut shared = lock(&self.shared);
        if !shared.state.is_current(self.generation) {
            return None;
        }
        Some(f(&mut shared.state, self.sink.as_ref()))
    }

    async fn run(mut self) {
        // The previous run is already cancelled; it only has its socket to
        // close, bounded by CLOSE_GRACE.
        if let Some(previous) = self.previous.take() {
            if let Err(e) = previous.await {
                log::warn!("Previous status channel driver ended abnormally: {}", e);
            }
        }

        loop {
            let base = (self.url_provider)();
            match status_channel_url(&base) {
                Ok(url) => {
                    if self
                        .with_current(|_, sink| sink.log(LogLevel::Info, &format!("Connecting to {}", url)))
                        .is_none()
                    {
                        return;
                    }

                    let connected = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        result = self.transport.connect(&url) => result,
                    };

                    match connected {
                        Ok(socket) => {
                            if !self.pump(socket).await {
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("Status channel connect to {} failed: {}", url, e);
                            self.with_current(|state, sink| {
                                state.connected = false;
                                sink.connection_state(false);
                                sink.log(LogLevel::Error, &format!("Connection failed: {}", e));
                            });
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Status channel URL from '{}' rejected: {}", base, e);
                    self.with_current(|_, sink| sink.log(LogLevel::Error, &e.to_string()));
                }
            }

            if !self.wait_for_retry().await {
                return;
            }
        }
    }

    /// Hand the socket's closer to `stop`, or close at once when this run
    /// was stopped while connecting. Returns `false` in the latter case.
    fn register(&self, closer: Box<dyn SocketCloser>) -> bool {
        let mut shared = lock(&self.shared);
        if !shared.state.is_current(self.generation) {
            drop(shared);
            closer.close();
            return false;
        }
        shared.state.opened();
        self.sink.connection_state(true);
        self.sink.log(LogLevel::Info, "Connected to status channel");
        shared.live = Some(closer);
        true
    }

    /// Close the socket unless `stop` already did.
    fn release(&self) {
        let closer = lock(&self.shared).live.take();
        if let Some(closer) = closer {
            closer.close();
        }
    }

    /// Drive one open socket until it closes. Returns `false` when the run
    /// was stopped meanwhile.
    async fn pump(&self, mut socket: Box<dyn StatusSocket>) -> bool {
        if !self.register(socket.take_closer()) {
            drain(&mut *socket).await;
            return false;
        }
        log::info!("Status channel connected");

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => None,
                event = socket.next_event() => Some(event),
            };
            let Some(event) = event else {
                self.release();
                drain(&mut *socket).await;
                return false;
            };

            let live = match event {
                SocketEvent::Text(text) => self.dispatch(&text),
                SocketEvent::Error(e) => {
                    // The close that follows schedules the retry.
                    log::warn!("Status channel error: {}", e);
                    self.with_current(|state, sink| {
                        state.connected = false;
                        sink.connection_state(false);
                        sink.log(LogLevel::Error, &format!("Connection error: {}", e));
                    })
                    .is_some()
                }
                SocketEvent::Closed(reason) => {
                    log::info!("Status channel closed ({})", reason.as_deref().unwrap_or("no reason"));
                    self.release();
                    let message = match reason {
                        Some(reason) => format!("Disconnected: {}", reason),
                        None => "Disconnected".to_string(),
                    };
                    self.with_current(|state, sink| {
                        state.connected = false;
                        sink.connection_state(false);
                        sink.log(LogLevel::Warn, &message);
                    });
                    return true;
                }
            };

            if !live {
                self.release();
                drain(&mut *socket).await;
                return false;
            }
        }
    }

    /// Route one text frame to exactly one kind of sink callback.
    fn dispatch(&self, text: &str) -> bool {
        let message = classify(text);
        self.with_current(|_, sink| match message {
            InboundMessage::Clarification(session) => sink.clarification(session),
            InboundMessage::LoopEvent(event) => sink.loop_event(event),
            InboundMessage::Status {
                status,
                current_node,
            } => {
                for code in [status, current_node].into_iter().flatten() {
                    match map_code(&code) {
                        Some(mapping) => {
                            sink.status(mapping.status);
                            sink.progress_label(mapping.label);
                        }
                        None => {
                            self.unknown_codes.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Ignoring unknown status code '{}'", code);
                        }
                    }
                }
            }
            InboundMessage::Ignored => log::debug!("Ignoring status frame without known fields"),
            InboundMessage::Raw(raw) => sink.log(LogLevel::Info, &raw),
        })
        .is_some()
    }

    /// Arm one retry timer and wait for it. Returns `false` when stopped.
    async fn wait_for_retry(&self) -> bool {
        let jitter_fraction = rand::thread_rng().gen_range(0.0..=1.0);
        let scheduled = self
            .with_current(|state, sink| {
                let delay = state.closed(&self.policy, jitter_fraction)?;
                sink.log(
                    LogLevel::Info,
                    &format!(
                        "Reconnecting in {}ms (attempt {})",
                        delay.as_millis(),
                        state.attempt
                    ),
                );
                Some((delay, state.attempt))
            })
            .flatten();
        let Some((delay, attempt)) = scheduled else {
            return false;
        };
        log::info!("Status channel retry {} in {:?}", attempt, delay);

        let fired = tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        fired && self.with_current(|state, _| state.retry_fired()).is_some()
    }
}

/// Read a closing socket until the peer acknowledges, giving up after
/// `CLOSE_GRACE`. Frames read meanwhile are discarded.
async fn drain(socket: &mut dyn StatusSocket) {
    let closed = async {
        while !matches!(socket.next_event().await, SocketEvent::Closed(_)) {}
    };
    if tokio::time::timeout(CLOSE_GRACE, closed).await.is_err() {
        log::debug!("Status channel close was not acknowledged in time");
    }
}
