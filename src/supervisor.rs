//! Running every configured device at once.
//!
//! The [`Supervisor`] spawns one [`DeviceSession`] task per device. Sessions
//! share nothing but the transport, the publisher and the shutdown signal,
//! so one device failing (or panicking) leaves the others running.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ble::{BleTransport, DeviceAddress};
use crate::error::{Error, Result};
use crate::publisher::Publisher;
use crate::session::{DeviceSession, SessionConfig, SessionOutcome, SessionReport, SessionStateChange};
use crate::signal::Signal;

/// Time sessions get to tear down after a shutdown request.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runs one session per configured device.
pub struct Supervisor<T: BleTransport> {
    transport: Arc<T>,
    publisher: Arc<dyn Publisher>,
    configs: Vec<SessionConfig>,
    shutdown: Signal,
    grace: Duration,
    state_tx: broadcast::Sender<SessionStateChange>,
}

impl<T: BleTransport> Supervisor<T> {
    /// Create a supervisor for the given devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the same address is listed twice, since
    /// a device can only hold one connection at a time.
    pub fn new(
        transport: Arc<T>,
        publisher: Arc<dyn Publisher>,
        configs: Vec<SessionConfig>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.address) {
                return Err(Error::config(format!(
                    "device {} is configured more than once",
                    config.address
                )));
            }
        }

        let (state_tx, _) = broadcast::channel(64);
        Ok(Self {
            transport,
            publisher,
            configs,
            shutdown: Signal::new(),
            grace: DEFAULT_SHUTDOWN_GRACE,
            state_tx,
        })
    }

    /// Set how long sessions get to tear down after a shutdown request.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Signal that stops every session when fired.
    pub fn shutdown_signal(&self) -> Signal {
        self.shutdown.clone()
    }

    /// Subscribe to state transitions of all sessions.
    pub fn subscribe_states(&self) -> broadcast::Receiver<SessionStateChange> {
        self.state_tx.subscribe()
    }

    /// Addresses of the supervised devices, in configuration order.
    pub fn devices(&self) -> Vec<DeviceAddress> {
        self.configs.iter().map(|c| c.address).collect()
    }

    /// Run until every session has terminated.
    pub async fn run(self) -> Vec<SessionReport> {
        self.run_until(std::future::pending()).await
    }

    /// Run until every session has terminated or `interrupt` completes.
    ///
    /// On interrupt the shutdown signal is fired and sessions get the grace
    /// period to disconnect; stragglers are aborted. Reports come back in
    /// configuration order.
    pub async fn run_until<F>(self, interrupt: F) -> Vec<SessionReport>
    where
        F: Future<Output = ()>,
    {
        info!("Starting {} device session(s)", self.configs.len());

        let handles: Vec<(DeviceAddress, JoinHandle<SessionReport>)> = self
            .configs
            .iter()
            .cloned()
            .map(|config| {
                let address = config.address;
                (address, self.spawn_session(config))
            })
            .collect();
        let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

        let collect = collect_reports(handles);
        tokio::pin!(collect);

        let reports = tokio::select! {
            reports = &mut collect => reports,
            _ = interrupt => {
                info!("Shutdown requested, stopping all sessions");
                self.shutdown.fire();
                match tokio::time::timeout(self.grace, &mut collect).await {
                    Ok(reports) => reports,
                    Err(_) => {
                        warn!(
                            "Sessions still running after {:?}, aborting them",
                            self.grace
                        );
                        for abort in &aborts {
                            abort.abort();
                        }
                        collect.await
                    }
                }
            }
        };

        for report in &reports {
            if report.outcome.is_failure() {
                warn!("[{}] {}", report.name, report.outcome);
            } else {
                info!("[{}] {}", report.name, report.outcome);
            }
        }
        reports
    }

    fn spawn_session(&self, config: SessionConfig) -> JoinHandle<SessionReport> {
        let session = DeviceSession::new(
            config,
            self.transport.clone(),
            self.publisher.clone(),
            self.shutdown.clone(),
        )
        .with_state_channel(self.state_tx.clone());

        tokio::spawn(session.run())
    }
}

/// Await every session, turning task failures into reports.
async fn collect_reports(
    handles: Vec<(DeviceAddress, JoinHandle<SessionReport>)>,
) -> Vec<SessionReport> {
    let mut reports = Vec::with_capacity(handles.len());
    for (address, handle) in handles {
        let report = match handle.await {
            Ok(report) => report,
            Err(e) => {
                let outcome = if e.is_cancelled() {
                    SessionOutcome::Aborted
                } else {
                    error!("[{}] Session task panicked: {}", address, e);
                    SessionOutcome::Failed {
                        reason: "session task panicked".to_string(),
                    }
                };
                SessionReport {
                    address,
                    name: address.to_string(),
                    outcome,
                    connections: 0,
                }
            }
        };
        reports.push(report);
    }
    reports
}
