//! Radar polling loop - drives the presence tracker from the sensor
//!
//! Link lifecycle: Disconnected → Connecting → Connected → (Disconnected on
//! failure). Connect failures retry forever at a fixed backoff; the sensor
//! may be unpowered or hot-swapped at any time.
//!
//! Each poll cycle:
//! 1. Read one line from the async port, bounded by the read deadline
//! 2. Feed a valid detection to the tracker
//! 3. Check the inactivity timeout (always, even when the read failed)
//! 4. On error: log, back off briefly, carry on
//! 5. Yield, or wait out the minimum poll interval
//!
//! Stop is cooperative: the shutdown flag is checked at the top of every
//! cycle and interrupts backoff waits. An in-flight read finishes within the
//! port read timeout. A read that overruns the deadline is dropped along
//! with the link, which closes the port before the reconnect.

use crate::domain::types::LinkState;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::event_store::StoreError;
use crate::io::frame::parse_raw_frame;
use crate::io::radar::{SensorConnector, SensorLink};
use crate::services::presence::PresenceTracker;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Failures that end a poll cycle early
#[derive(Debug, Error)]
pub enum PollError {
    #[error("sensor read failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("sensor read exceeded {0:?} deadline")]
    ReadDeadline(Duration),

    #[error("event store: {0}")]
    Store(#[from] StoreError),
}

impl PollError {
    /// Whether the link has to be reopened after this error
    fn drops_link(&self) -> bool {
        !matches!(self, PollError::Store(_))
    }
}

/// Timing knobs for the loop
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub connect_backoff: Duration,
    pub error_backoff: Duration,
    pub min_poll_interval: Duration,
    pub read_deadline: Duration,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_backoff: config.connect_backoff(),
            error_backoff: config.error_backoff(),
            min_poll_interval: config.min_poll_interval(),
            read_deadline: config.read_deadline(),
        }
    }
}

/// Owns the polling task; `start` and `stop` may be called from any task
pub struct PresenceService {
    tracker: Arc<PresenceTracker>,
    connector: Arc<dyn SensorConnector>,
    metrics: Arc<Metrics>,
    settings: PollSettings,
    link_tx: Arc<watch::Sender<LinkState>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceService {
    pub fn new(
        tracker: Arc<PresenceTracker>,
        connector: Arc<dyn SensorConnector>,
        metrics: Arc<Metrics>,
        settings: PollSettings,
    ) -> Self {
        let (link_tx, _) = watch::channel(LinkState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tracker,
            connector,
            metrics,
            settings,
            link_tx: Arc::new(link_tx),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling loop. No-op while a loop is already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("poller_already_running");
            return;
        }

        self.shutdown_tx.send_replace(false);
        let poll_loop = PollLoop {
            tracker: self.tracker.clone(),
            connector: self.connector.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            link_tx: self.link_tx.clone(),
        };
        let shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(poll_loop.run(shutdown)));
    }

    /// Signal the loop to stop and wait until it has exited
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "poller_task_failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_tx.borrow()
    }

    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }
}

/// Wait for `duration` unless shutdown is signalled first.
/// Returns true when the caller should stop.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

struct PollLoop {
    tracker: Arc<PresenceTracker>,
    connector: Arc<dyn SensorConnector>,
    metrics: Arc<Metrics>,
    settings: PollSettings,
    link_tx: Arc<watch::Sender<LinkState>>,
}

impl PollLoop {
    fn set_link(&self, state: LinkState) {
        let previous = self.link_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous.as_str(), to = %state.as_str(), "sensor_link_state");
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sensor = %self.connector.describe(),
            connect_backoff_ms = %self.settings.connect_backoff.as_millis(),
            error_backoff_ms = %self.settings.error_backoff.as_millis(),
            min_poll_interval_ms = %self.settings.min_poll_interval.as_millis(),
            read_deadline_ms = %self.settings.read_deadline.as_millis(),
            "poller_started"
        );

        let mut link: Option<Box<dyn SensorLink>> = None;

        while !*shutdown.borrow() {
            let current = match link.take() {
                Some(current) => current,
                None => match self.open_link().await {
                    Ok(opened) => opened,
                    Err(e) => {
                        error!(
                            sensor = %self.connector.describe(),
                            error = %e,
                            retry_ms = %self.settings.connect_backoff.as_millis(),
                            "sensor_connect_failed"
                        );
                        // Absence is still decided while the sensor is away
                        self.check_timeout_logged();
                        if wait_or_shutdown(self.settings.connect_backoff, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let cycle_start = Instant::now();
            let (kept, result) = self.poll_cycle(current).await;
            link = kept;
            self.metrics.record_poll_cycle();

            if let Err(e) = result {
                self.metrics.record_loop_error();
                if link.is_none() {
                    self.set_link(LinkState::Disconnected);
                    warn!(error = %e, "sensor_link_lost");
                } else {
                    error!(error = %e, "poll_cycle_failed");
                }
                if wait_or_shutdown(self.settings.error_backoff, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let remaining = self.settings.min_poll_interval.saturating_sub(cycle_start.elapsed());
            if remaining.is_zero() {
                tokio::task::yield_now().await;
            } else if wait_or_shutdown(remaining, &mut shutdown).await {
                break;
            }
        }

        if link.take().is_some() {
            info!(sensor = %self.connector.describe(), "sensor_link_closed");
        }
        self.set_link(LinkState::Disconnected);
        info!("poller_stopped");
    }

    async fn open_link(&self) -> Result<Box<dyn SensorLink>, PollError> {
        self.set_link(LinkState::Connecting);

        match self.connector.connect().await {
            Ok(link) => {
                self.metrics.record_connect(true);
                self.set_link(LinkState::Connected);
                info!(sensor = %self.connector.describe(), "sensor_connected");
                Ok(link)
            }
            Err(e) => {
                self.metrics.record_connect(false);
                self.set_link(LinkState::Disconnected);
                Err(PollError::Transport(e))
            }
        }
    }

    /// One read-detect-check cycle. Returns the link if it is still usable.
    async fn poll_cycle(
        &self,
        mut link: Box<dyn SensorLink>,
    ) -> (Option<Box<dyn SensorLink>>, Result<(), PollError>) {
        let read = self.read_one(link.as_mut()).await;

        let mut result: Result<(), PollError> = match read {
            Ok(Some(raw)) => {
                let detection = parse_raw_frame(&raw);
                self.metrics.record_frame(detection.is_some());
                match detection {
                    Some(d) => {
                        trace!(distance_m = %d.distance_m, energy = ?d.energy, "radar_detection");
                        self.tracker
                            .on_detection(d.distance_m, Utc::now())
                            .map(|_| ())
                            .map_err(PollError::from)
                    }
                    None => {
                        debug!(raw = %String::from_utf8_lossy(&raw), "radar_frame_dropped");
                        Ok(())
                    }
                }
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        // Runs even when the read failed so absence is never held up by I/O
        if let Err(e) = self.tracker.check_timeout(Utc::now()) {
            if result.is_ok() {
                result = Err(e.into());
            } else {
                error!(error = %e, "presence_timeout_persist_failed");
            }
        }

        match &result {
            Err(e) if e.drops_link() => (None, result),
            _ => (Some(link), result),
        }
    }

    /// Read one line, bounded by the deadline. Dropping the timed-out read
    /// future releases its borrow of the port.
    async fn read_one(&self, link: &mut dyn SensorLink) -> Result<Option<Vec<u8>>, PollError> {
        let started = Instant::now();

        match tokio::time::timeout(self.settings.read_deadline, link.read_line()).await {
            Ok(Ok(line)) => {
                self.metrics.record_read_latency(started.elapsed().as_millis() as u64);
                Ok(line)
            }
            Ok(Err(e)) => Err(PollError::Transport(e)),
            Err(_) => {
                self.metrics.record_read_deadline_overrun();
                Err(PollError::ReadDeadline(self.settings.read_deadline))
            }
        }
    }

    fn check_timeout_logged(&self) {
        if let Err(e) = self.tracker.check_timeout(Utc::now()) {
            error!(error = %e, "presence_timeout_persist_failed");
        }
    }
}
