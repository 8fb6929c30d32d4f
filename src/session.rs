//! Per-device connection lifecycle.
//!
//! A [`DeviceSession`] drives one sensor through
//! `Idle → Scanning → Connecting → Subscribed → Disconnecting → Idle | Terminated`,
//! feeding every notification into the frame decoder and handing the
//! results to a [`Publisher`]. Transient failures are retried after a
//! fixed delay; structural ones end the session without affecting others.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::ble::{BleLink, BleTransport, DeviceAddress, Discovered, LT_NOTIFY_UUID};
use crate::data::BatteryScale;
use crate::device::{resolve_name, DeviceIdentity};
use crate::error::{Error, Result};
use crate::protocol::{decode_with, Decoded};
use crate::publisher::{Diagnostic, DiagnosticCategory, Publisher};
use crate::signal::Signal;

/// Default passive wait after subscribing.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_secs(30);

/// Default pause after the adapter reports it is busy.
pub const DEFAULT_BUSY_BACKOFF: Duration = Duration::from_secs(5);

/// Default pause after a failed connection attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default pause before scanning again for a device that was not seen.
pub const DEFAULT_NOT_FOUND_DELAY: Duration = Duration::from_secs(30);

/// The same unclassified stack failure this many times in a row ends the session.
pub const REPEATED_FAILURE_LIMIT: u32 = 3;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No resources held.
    #[default]
    Idle,
    /// Looking for the device by address.
    Scanning,
    /// Opening the connection.
    Connecting,
    /// Receiving notifications.
    Subscribed,
    /// Releasing the connection.
    Disconnecting,
    /// Finished; the session will not run again.
    Terminated,
}

impl SessionState {
    /// Whether the session has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// A state transition, as broadcast to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStateChange {
    /// Device the session belongs to.
    pub address: DeviceAddress,
    /// Previous state.
    pub from: SessionState,
    /// New state.
    pub to: SessionState,
}

/// What to do when a scan completes without seeing the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundPolicy {
    /// Go idle, wait, and scan again.
    #[default]
    Retry,
    /// End the session.
    Terminate,
}

/// What to do once the idle wait after subscribing has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterIdle {
    /// Unsubscribe, then keep the connection until the device drops it.
    #[default]
    AwaitDisconnect,
    /// Unsubscribe and disconnect.
    Disconnect,
}

/// Everything one session needs to know, merged from global and
/// per-device settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Hardware address of the sensor.
    pub address: DeviceAddress,
    /// Display name override.
    pub custom_name: Option<String>,
    /// Downstream integration id.
    pub integration_id: Option<u32>,
    /// Passive wait after subscribing.
    pub idle_wait: Duration,
    /// Pause after an adapter-busy error.
    pub busy_backoff: Duration,
    /// Pause after a failed connection attempt.
    pub retry_delay: Duration,
    /// Reaction to a device that was not seen.
    pub not_found: NotFoundPolicy,
    /// Pause before scanning again when retrying a missing device.
    pub not_found_delay: Duration,
    /// Consecutive failed connection attempts tolerated; unlimited if `None`.
    pub max_connect_attempts: Option<u32>,
    /// Go back to scanning after a disconnect instead of finishing.
    pub reconnect: bool,
    /// Behaviour once the idle wait elapses.
    pub after_idle: AfterIdle,
    /// Battery byte scaling for decoded readings.
    pub battery_scale: BatteryScale,
}

impl SessionConfig {
    /// Settings for `address` with every default applied.
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            custom_name: None,
            integration_id: None,
            idle_wait: DEFAULT_IDLE_WAIT,
            busy_backoff: DEFAULT_BUSY_BACKOFF,
            retry_delay: DEFAULT_RETRY_DELAY,
            not_found: NotFoundPolicy::default(),
            not_found_delay: DEFAULT_NOT_FOUND_DELAY,
            max_connect_attempts: None,
            reconnect: true,
            after_idle: AfterIdle::default(),
            battery_scale: BatteryScale::default(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ran its single connection cycle to completion.
    Completed,
    /// Stopped by a shutdown request.
    Cancelled,
    /// The device was not seen and the policy is to give up.
    NotFound,
    /// Too many consecutive connection failures.
    RetriesExhausted {
        /// Failed attempts in a row.
        attempts: u32,
    },
    /// A structural error; retrying would not help.
    Failed {
        /// What went wrong.
        reason: String,
    },
    /// Did not stop within the shutdown grace period and was aborted.
    Aborted,
}

impl SessionOutcome {
    /// Whether the session ended because something went wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::RetriesExhausted { .. } | Self::Failed { .. } | Self::Aborted
        )
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::NotFound => write!(f, "device not found"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "gave up after {} connection attempts", attempts)
            }
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final report of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Device address.
    pub address: DeviceAddress,
    /// Last resolved name.
    pub name: String,
    /// How the session ended.
    pub outcome: SessionOutcome,
    /// Number of successful connections.
    pub connections: u32,
}

/// Result of one phase: move on, go round again, or stop.
enum Step<T> {
    Proceed(T),
    Retry,
    Finish(SessionOutcome),
}

/// Why the subscribed wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    /// Shutdown arrived before the subscription was in place.
    CancelledSubscribing,
    DeviceDisconnected,
    Cancelled,
    IdleDisconnect,
}

/// State machine for one configured device.
pub struct DeviceSession<T: BleTransport> {
    config: SessionConfig,
    transport: Arc<T>,
    publisher: Arc<dyn Publisher>,
    shutdown: Signal,
    state: SessionState,
    state_tx: broadcast::Sender<SessionStateChange>,
    /// Name used in log lines; refreshed on every connection.
    name: String,
    /// Consecutive failed connection attempts.
    failed_attempts: u32,
    connections: u32,
    /// Last unclassified stack failure and how often it recurred in a row.
    stack_failure: Option<(String, u32)>,
}

impl<T: BleTransport> DeviceSession<T> {
    /// Create a session. It does nothing until [`DeviceSession::run`].
    pub fn new(
        config: SessionConfig,
        transport: Arc<T>,
        publisher: Arc<dyn Publisher>,
        shutdown: Signal,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(32);
        let name = resolve_name(config.custom_name.as_deref(), None, &config.address);
        Self {
            config,
            transport,
            publisher,
            shutdown,
            state: SessionState::Idle,
            state_tx,
            name,
            failed_attempts: 0,
            connections: 0,
            stack_failure: None,
        }
    }

    /// Publish state transitions on an existing channel, so several
    /// sessions can share one stream of changes.
    pub fn with_state_channel(mut self, state_tx: broadcast::Sender<SessionStateChange>) -> Self {
        self.state_tx = state_tx;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Device address.
    pub fn address(&self) -> DeviceAddress {
        self.config.address
    }

    /// Subscribe to state transitions.
    pub fn subscribe_states(&self) -> broadcast::Receiver<SessionStateChange> {
        self.state_tx.subscribe()
    }

    /// Drive the device until a terminal condition and report how it ended.
    pub async fn run(mut self) -> SessionReport {
        let outcome = loop {
            if self.shutdown.is_fired() {
                break SessionOutcome::Cancelled;
            }
            match self.cycle().await {
                Step::Proceed(()) | Step::Retry => continue,
                Step::Finish(outcome) => break outcome,
            }
        };

        self.transition(SessionState::Terminated);
        if outcome.is_failure() {
            warn!("[{}] Session ended: {}", self.name, outcome);
        } else {
            info!("[{}] Session ended: {}", self.name, outcome);
        }

        SessionReport {
            address: self.config.address,
            name: self.name,
            outcome,
            connections: self.connections,
        }
    }

    /// One pass from scanning to the end of a connection.
    async fn cycle(&mut self) -> Step<()> {
        let found = match self.scan().await {
            Step::Proceed(found) => found,
            Step::Retry => return Step::Retry,
            Step::Finish(outcome) => return Step::Finish(outcome),
        };

        let on_disconnect = Signal::new();
        let link = match self.connect(&found, on_disconnect.clone()).await {
            Step::Proceed(link) => link,
            Step::Retry => return Step::Retry,
            Step::Finish(outcome) => return Step::Finish(outcome),
        };

        let identity = DeviceIdentity::new(
            self.config.address,
            resolve_name(
                self.config.custom_name.as_deref(),
                found.local_name.as_deref(),
                &self.config.address,
            ),
            self.config.integration_id,
        );
        self.name = identity.name.clone();
        info!("[{}] Connection successful", self.name);

        let end = match self.subscribed(&link, &identity, &on_disconnect).await {
            Ok(end) => end,
            Err(e) => {
                error!("[{}] Could not subscribe to notifications: {}", self.name, e);
                self.disconnecting(&link, &identity, false).await;
                if let Some(outcome) = self.fatal(&e) {
                    return Step::Finish(outcome);
                }
                return self.pause(self.config.retry_delay).await;
            }
        };

        match end {
            WaitEnd::CancelledSubscribing | WaitEnd::Cancelled => {
                info!("[{}] Cancelling connection, disconnecting", self.name)
            }
            WaitEnd::DeviceDisconnected => info!("[{}] Disconnected", self.name),
            WaitEnd::IdleDisconnect => info!("[{}] Idle wait over, disconnecting", self.name),
        }
        let announced = end != WaitEnd::CancelledSubscribing;
        self.disconnecting(&link, &identity, announced).await;

        if matches!(end, WaitEnd::Cancelled | WaitEnd::CancelledSubscribing)
            || self.shutdown.is_fired()
        {
            Step::Finish(SessionOutcome::Cancelled)
        } else if !self.config.reconnect {
            Step::Finish(SessionOutcome::Completed)
        } else {
            self.transition(SessionState::Idle);
            Step::Proceed(())
        }
    }

    async fn scan(&mut self) -> Step<Discovered<T::Device>> {
        self.transition(SessionState::Scanning);
        info!("[{}] Scanning for device {}", self.name, self.config.address);

        let result = tokio::select! {
            biased;
            _ = self.shutdown.fired() => return Step::Finish(SessionOutcome::Cancelled),
            result = self.transport.scan_by_address(&self.config.address) => result,
        };

        match result {
            Ok(Some(found)) => {
                debug!(
                    "[{}] Device found (name {:?}, rssi {:?}), attempting connection",
                    self.name, found.local_name, found.rssi
                );
                Step::Proceed(found)
            }
            Ok(None) => {
                info!(
                    "[{}] Could not find device with address {}",
                    self.name, self.config.address
                );
                match self.config.not_found {
                    NotFoundPolicy::Terminate => Step::Finish(SessionOutcome::NotFound),
                    NotFoundPolicy::Retry => {
                        self.transition(SessionState::Idle);
                        self.pause(self.config.not_found_delay).await
                    }
                }
            }
            Err(e) if e.is_adapter_busy() => {
                warn!(
                    "[{}] Interface busy while scanning, retry in {:?}",
                    self.name, self.config.busy_backoff
                );
                self.pause(self.config.busy_backoff).await
            }
            Err(e) => {
                error!("[{}] Scan failed: {}", self.name, e);
                Step::Finish(SessionOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn connect(
        &mut self,
        found: &Discovered<T::Device>,
        on_disconnect: Signal,
    ) -> Step<T::Link> {
        self.transition(SessionState::Connecting);

        let result = tokio::select! {
            biased;
            _ = self.shutdown.fired() => {
                info!("[{}] Cancelling connection attempt", self.name);
                self.transition(SessionState::Disconnecting);
                if let Err(e) = self.transport.release(&found.device).await {
                    debug!("[{}] Releasing abandoned connection: {}", self.name, e);
                }
                return Step::Finish(SessionOutcome::Cancelled);
            }
            result = self.transport.connect(&found.device, on_disconnect) => result,
        };

        let e = match result {
            Ok(link) => {
                self.failed_attempts = 0;
                self.connections += 1;
                return Step::Proceed(link);
            }
            Err(e) => e,
        };

        if let Some(outcome) = self.fatal(&e) {
            error!("[{}] Connection failed: {}", self.name, e);
            return Step::Finish(outcome);
        }

        self.failed_attempts += 1;
        if let Some(max) = self.config.max_connect_attempts {
            if self.failed_attempts >= max {
                error!(
                    "[{}] Too many errors, stopping after {} attempts: {}",
                    self.name, self.failed_attempts, e
                );
                return Step::Finish(SessionOutcome::RetriesExhausted {
                    attempts: self.failed_attempts,
                });
            }
        }

        let delay = if e.is_adapter_busy() {
            self.config.busy_backoff
        } else {
            self.config.retry_delay
        };
        warn!(
            "[{}] Connection failed (attempt {}): {}, retry in {:?}",
            self.name, self.failed_attempts, e, delay
        );
        self.pause(delay).await
    }

    /// Subscribe, announce the device and pump notifications until the
    /// connection should end.
    async fn subscribed(
        &mut self,
        link: &T::Link,
        identity: &DeviceIdentity,
        on_disconnect: &Signal,
    ) -> Result<WaitEnd> {
        self.transition(SessionState::Subscribed);

        let (sink, mut frames) = mpsc::unbounded_channel();
        tokio::select! {
            biased;
            _ = self.shutdown.fired() => return Ok(WaitEnd::CancelledSubscribing),
            result = link.subscribe(LT_NOTIFY_UUID, sink) => result?,
        }
        self.stack_failure = None;

        self.publisher.publish_discovery(identity);

        let idle = tokio::time::sleep(self.config.idle_wait);
        tokio::pin!(idle);
        let mut idle_elapsed = false;

        let end = loop {
            tokio::select! {
                biased;
                Some(frame) = frames.recv() => self.handle_frame(identity, &frame),
                _ = on_disconnect.fired() => break WaitEnd::DeviceDisconnected,
                _ = self.shutdown.fired() => break WaitEnd::Cancelled,
                _ = &mut idle, if !idle_elapsed => {
                    idle_elapsed = true;
                    debug!("[{}] Idle wait elapsed, unsubscribing", self.name);
                    if let Err(e) = link.unsubscribe(LT_NOTIFY_UUID).await {
                        warn!("[{}] Unsubscribe failed: {}", self.name, e);
                    }
                    if self.config.after_idle == AfterIdle::Disconnect {
                        break WaitEnd::IdleDisconnect;
                    }
                }
            }
        };

        // Frames delivered before the link went away are still processed.
        while let Ok(frame) = frames.try_recv() {
            self.handle_frame(identity, &frame);
        }

        Ok(end)
    }

    /// Withdraw the announcement and release the link.
    async fn disconnecting(
        &mut self,
        link: &T::Link,
        identity: &DeviceIdentity,
        discovery_published: bool,
    ) {
        self.transition(SessionState::Disconnecting);
        if discovery_published {
            self.publisher.retract_discovery(identity);
        }
        if let Err(e) = link.disconnect().await {
            warn!("[{}] Disconnect failed: {}", self.name, e);
        }
    }

    fn handle_frame(&self, identity: &DeviceIdentity, frame: &[u8]) {
        trace!("[{}] Received data ({} bytes)", self.name, frame.len());

        let diagnostic = match decode_with(frame, self.config.battery_scale) {
            Ok(Decoded::Reading(reading)) => {
                info!("[{}] {}", self.name, reading);
                self.publisher.publish_reading(identity, &reading);
                return;
            }
            Ok(Decoded::HourData { hex }) => {
                debug!("[{}] Hour data {}", self.name, hex);
                Diagnostic::new(DiagnosticCategory::HourData, hex)
            }
            Ok(Decoded::VersionInfo(version)) => {
                debug!("[{}] Version info {}", self.name, version);
                Diagnostic::new(DiagnosticCategory::VersionInfo, version)
            }
            Ok(Decoded::Unrecognized { frame_type, hex }) => {
                debug!("[{}] Other data (type {:#04x}) {}", self.name, frame_type, hex);
                Diagnostic::new(
                    DiagnosticCategory::Unrecognized,
                    format!("{:#04x}: {}", frame_type, hex),
                )
            }
            Err(reason) => {
                warn!("[{}] {}", self.name, reason);
                Diagnostic::new(DiagnosticCategory::Rejected, reason.to_string())
            }
        };
        self.publisher.publish_diagnostic(identity, &diagnostic);
    }

    /// Outcome ending the session for `e`, if retrying cannot help.
    ///
    /// Unclassified stack failures become fatal once the same one has
    /// recurred [`REPEATED_FAILURE_LIMIT`] times without a subscription
    /// succeeding in between.
    fn fatal(&mut self, e: &Error) -> Option<SessionOutcome> {
        if e.is_structural() {
            return Some(SessionOutcome::Failed {
                reason: e.to_string(),
            });
        }
        if !e.is_stack_failure() {
            return None;
        }

        let text = e.to_string();
        let repeats = match self.stack_failure.take() {
            Some((last, count)) if last == text => count + 1,
            _ => 1,
        };
        if repeats >= REPEATED_FAILURE_LIMIT {
            return Some(SessionOutcome::Failed {
                reason: format!("{} (repeated {} times)", text, repeats),
            });
        }
        self.stack_failure = Some((text, repeats));
        None
    }

    /// Sleep unless shutdown is requested first.
    async fn pause<U>(&self, delay: Duration) -> Step<U> {
        tokio::select! {
            biased;
            _ = self.shutdown.fired() => Step::Finish(SessionOutcome::Cancelled),
            _ = tokio::time::sleep(delay) => Step::Retry,
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!("[{}] {} -> {}", self.name, from, to);
        self.state = to;
        let _ = self.state_tx.send(SessionStateChange {
            address: self.config.address,
            from,
            to,
        });
    }
}
