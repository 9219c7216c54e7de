//! Presence state machine
//!
//! Owns the occupancy decision for the monitored area and decides which
//! readings are worth an event. This is the single source of truth for
//! presence; the HTTP layer only reads snapshots of it.
//!
//! Key behaviors:
//! - First detection while absent flips to present and records an event
//! - While present, a new distance is only recorded once it moves more than
//!   the hysteresis threshold away from the last recorded distance
//! - Absence is decided by `check_timeout`, driven once per poll cycle;
//!   the transition fires once and stays quiet until the next detection
//! - Every operation holds the state lock across its store append, so the
//!   store sees events in transition order

use crate::domain::types::{NewPresenceEvent, Occupancy, PresenceEvent, PresenceSnapshot};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::event_store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};

#[derive(Debug, Default)]
struct TrackerState {
    occupancy: Occupancy,
    last_seen: Option<DateTime<Utc>>,
    last_distance_m: Option<f64>,
    persistence_degraded: bool,
}

/// Debounced presence tracker
pub struct PresenceTracker {
    inactivity_timeout: Duration,
    hysteresis_m: f64,
    note: Option<String>,
    append_retries: u32,
    store: Arc<dyn EventStore>,
    metrics: Arc<Metrics>,
    state: Mutex<TrackerState>,
}

impl PresenceTracker {
    pub fn new(config: &Config, store: Arc<dyn EventStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout(),
            hysteresis_m: config.hysteresis_m(),
            note: config.event_note().map(str::to_string),
            append_retries: config.store_append_retries(),
            store,
            metrics,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Feed one valid detection.
    ///
    /// Returns the persisted event when the reading was state-relevant.
    /// On a store failure the state change still stands and the error is
    /// returned after the snapshot has been flagged degraded.
    pub fn on_detection(
        &self,
        distance_m: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<PresenceEvent>, StoreError> {
        let mut state = self.state.lock();
        let mut changed = false;

        if state.occupancy == Occupancy::Absent {
            state.occupancy = Occupancy::Present;
            changed = true;
            info!(distance_m = %distance_m, "presence_detected");
        }

        let moved = match state.last_distance_m {
            None => true,
            Some(last) => (last - distance_m).abs() > self.hysteresis_m,
        };
        if moved {
            state.last_distance_m = Some(distance_m);
            changed = true;
        }

        // Never move last_seen backwards if the wall clock steps back
        state.last_seen = Some(state.last_seen.map_or(now, |prev| prev.max(now)));

        if !changed {
            trace!(distance_m = %distance_m, "presence_reading_within_hysteresis");
            return Ok(None);
        }

        self.persist(&mut state, now).map(Some)
    }

    /// Decide absence once the inactivity timeout has elapsed.
    ///
    /// No-op while absent, so repeated calls never produce extra events.
    pub fn check_timeout(&self, now: DateTime<Utc>) -> Result<Option<PresenceEvent>, StoreError> {
        let mut state = self.state.lock();

        if state.occupancy == Occupancy::Absent {
            return Ok(None);
        }
        let Some(last_seen) = state.last_seen else {
            return Ok(None);
        };

        // Negative elapsed (clock stepped back) counts as no time passed
        let elapsed = (now - last_seen).to_std().unwrap_or_default();
        if elapsed < self.inactivity_timeout {
            return Ok(None);
        }

        state.occupancy = Occupancy::Absent;
        info!(
            idle_ms = %elapsed.as_millis(),
            last_distance_m = ?state.last_distance_m,
            "presence_timed_out"
        );

        self.persist(&mut state, now).map(Some)
    }

    /// Administrative transition to absent; always records an event
    pub fn force_absent(&self, now: DateTime<Utc>) -> Result<PresenceEvent, StoreError> {
        let mut state = self.state.lock();
        let was = state.occupancy;
        state.occupancy = Occupancy::Absent;
        info!(previous = %was.as_str(), "presence_forced_absent");

        let result = self.persist(&mut state, now);
        state.last_seen = Some(now);
        result
    }

    /// Consistent copy of the current state
    pub fn snapshot(&self) -> PresenceSnapshot {
        let state = self.state.lock();
        PresenceSnapshot {
            present: state.occupancy.is_present(),
            last_seen: state.last_seen,
            last_distance_m: state.last_distance_m,
            note: self.note.clone(),
            persistence_degraded: state.persistence_degraded,
        }
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<PresenceEvent>, StoreError> {
        self.store.fetch_recent(limit)
    }

    pub fn latest_event(&self) -> Result<Option<PresenceEvent>, StoreError> {
        self.store.latest()
    }

    /// Append the event for the state just applied, retrying on failure.
    /// Called with the state lock held.
    fn persist(
        &self,
        state: &mut TrackerState,
        now: DateTime<Utc>,
    ) -> Result<PresenceEvent, StoreError> {
        let event = NewPresenceEvent {
            timestamp: now,
            present: state.occupancy.is_present(),
            distance_m: state.last_distance_m,
            note: self.note.clone(),
        };

        let mut attempt = 0;
        loop {
            match self.store.append(event.clone()) {
                Ok(stored) => {
                    if state.persistence_degraded {
                        info!(id = %stored.id, "event_store_recovered");
                    }
                    state.persistence_degraded = false;
                    self.metrics.record_event_appended();
                    info!(
                        id = %stored.id,
                        present = %stored.present,
                        distance_m = ?stored.distance_m,
                        "presence_event_recorded"
                    );
                    return Ok(stored);
                }
                Err(e) if attempt < self.append_retries => {
                    attempt += 1;
                    warn!(attempt = %attempt, error = %e, "event_append_retry");
                }
                Err(e) => {
                    state.persistence_degraded = true;
                    self.metrics.record_store_failure();
                    error!(
                        present = %event.present,
                        distance_m = ?event.distance_m,
                        attempts = %(attempt + 1),
                        error = %e,
                        "presence_event_dropped"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::event_store::MemoryEventStore;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails the first `failures` appends, then delegates
    struct FlakyStore {
        failures: AtomicU32,
        inner: MemoryEventStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self { failures: AtomicU32::new(failures), inner: MemoryEventStore::new() }
        }
    }

    impl EventStore for FlakyStore {
        fn append(&self, event: NewPresenceEvent) -> Result<PresenceEvent, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.append(event)
        }

        fn fetch_recent(&self, limit: usize) -> Result<Vec<PresenceEvent>, StoreError> {
            self.inner.fetch_recent(limit)
        }

        fn latest(&self) -> Result<Option<PresenceEvent>, StoreError> {
            self.inner.latest()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    fn create_tracker(config: Config) -> (PresenceTracker, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        let tracker = PresenceTracker::new(&config, store.clone(), Arc::new(Metrics::new()));
        (tracker, store)
    }

    fn default_tracker() -> (PresenceTracker, Arc<MemoryEventStore>) {
        create_tracker(Config::default().with_hysteresis_m(0.05).with_inactivity_timeout_s(30.0))
    }

    #[test]
    fn test_initial_snapshot() {
        let (tracker, _) = default_tracker();
        let snap = tracker.snapshot();
        assert!(!snap.present);
        assert!(snap.last_seen.is_none());
        assert!(snap.last_distance_m.is_none());
        assert!(!snap.persistence_degraded);
    }

    #[test]
    fn test_hysteresis_sequence() {
        let (tracker, store) = default_tracker();
        let now = t0();

        assert!(tracker.on_detection(1.00, now).unwrap().is_some());
        assert!(tracker.on_detection(1.02, now + secs(1)).unwrap().is_none());
        assert!(tracker.on_detection(1.10, now + secs(2)).unwrap().is_some());

        let events = store.all();
        assert_eq!(events.len(), 2);
        assert!(events[0].present);
        assert_eq!(events[0].distance_m, Some(1.00));
        assert!(events[1].present);
        assert_eq!(events[1].distance_m, Some(1.10));
    }

    #[test]
    fn test_hysteresis_uses_last_recorded_distance() {
        let (tracker, store) = default_tracker();
        let now = t0();

        tracker.on_detection(1.00, now).unwrap();
        // Each step is under the threshold, the drift from 1.00 is not
        tracker.on_detection(1.04, now).unwrap();
        assert_eq!(store.len(), 1);
        tracker.on_detection(1.08, now).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(tracker.snapshot().last_distance_m, Some(1.08));
    }

    #[test]
    fn test_delta_equal_to_threshold_does_not_fire() {
        let (tracker, store) = create_tracker(Config::default().with_hysteresis_m(0.5));
        tracker.on_detection(1.0, t0()).unwrap();
        tracker.on_detection(1.5, t0()).unwrap();
        tracker.on_detection(0.5, t0()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_last_seen_updates_without_event() {
        let (tracker, store) = default_tracker();
        tracker.on_detection(1.0, t0()).unwrap();
        tracker.on_detection(1.01, t0() + secs(10)).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(tracker.snapshot().last_seen, Some(t0() + secs(10)));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let (tracker, _) = default_tracker();
        tracker.on_detection(1.0, t0() + secs(10)).unwrap();
        tracker.on_detection(1.0, t0()).unwrap();
        assert_eq!(tracker.snapshot().last_seen, Some(t0() + secs(10)));
    }

    #[test]
    fn test_timeout_fires_once() {
        let (tracker, store) = default_tracker();
        tracker.on_detection(1.0, t0()).unwrap();

        assert!(tracker.check_timeout(t0() + secs(10)).unwrap().is_none());
        assert!(tracker.check_timeout(t0() + secs(29)).unwrap().is_none());

        let event = tracker.check_timeout(t0() + secs(30)).unwrap().unwrap();
        assert!(!event.present);
        assert_eq!(event.distance_m, Some(1.0));

        for i in 31..100 {
            assert!(tracker.check_timeout(t0() + secs(i)).unwrap().is_none());
        }
        assert_eq!(store.len(), 2);
        assert!(!tracker.snapshot().present);
    }

    #[test]
    fn test_check_timeout_while_absent_is_noop() {
        let (tracker, store) = default_tracker();
        for i in 0..50 {
            assert!(tracker.check_timeout(t0() + secs(i * 60)).unwrap().is_none());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_redetection_after_timeout() {
        let (tracker, store) = default_tracker();
        tracker.on_detection(1.0, t0()).unwrap();
        tracker.check_timeout(t0() + secs(31)).unwrap();

        // Same distance after absence still fires: the state flipped
        let event = tracker.on_detection(1.0, t0() + secs(40)).unwrap().unwrap();
        assert!(event.present);
        assert_eq!(event.distance_m, Some(1.0));
        assert_eq!(store.len(), 3);

        let ids: Vec<u64> = store.all().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_force_absent_always_records() {
        let (tracker, store) = default_tracker();

        // Even while already absent
        let event = tracker.force_absent(t0()).unwrap();
        assert!(!event.present);
        assert_eq!(event.distance_m, None);

        tracker.on_detection(2.0, t0() + secs(1)).unwrap();
        let event = tracker.force_absent(t0() + secs(2)).unwrap();
        assert!(!event.present);
        assert_eq!(event.distance_m, Some(2.0));

        let snap = tracker.snapshot();
        assert!(!snap.present);
        assert_eq!(snap.last_seen, Some(t0() + secs(2)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_note_attached_to_events() {
        let (tracker, store) =
            create_tracker(Config::default().with_event_note(Some("meeting room")));
        tracker.on_detection(1.0, t0()).unwrap();
        assert_eq!(store.all()[0].note.as_deref(), Some("meeting room"));
        assert_eq!(tracker.snapshot().note.as_deref(), Some("meeting room"));
    }

    #[test]
    fn test_append_retried_then_succeeds() {
        let store = Arc::new(FlakyStore::new(2));
        let config = Config::default().with_store_append_retries(2);
        let tracker = PresenceTracker::new(&config, store.clone(), Arc::new(Metrics::new()));

        let event = tracker.on_detection(1.0, t0()).unwrap().unwrap();
        assert_eq!(event.id, 1);
        assert!(!tracker.snapshot().persistence_degraded);
    }

    #[test]
    fn test_append_failure_degrades_but_keeps_state() {
        let store = Arc::new(FlakyStore::new(3));
        let metrics = Arc::new(Metrics::new());
        let config = Config::default().with_store_append_retries(1);
        let tracker = PresenceTracker::new(&config, store.clone(), metrics.clone());

        assert!(tracker.on_detection(1.0, t0()).is_err());
        let snap = tracker.snapshot();
        assert!(snap.present);
        assert_eq!(snap.last_distance_m, Some(1.0));
        assert!(snap.persistence_degraded);
        assert_eq!(metrics.store_failures(), 1);
        assert!(store.latest().unwrap().is_none());

        // One failure left, then the store recovers on the retry
        let event = tracker.check_timeout(t0() + secs(30)).unwrap().unwrap();
        assert!(!event.present);
        assert!(!tracker.snapshot().persistence_degraded);
    }

    #[test]
    fn test_concurrent_operations_keep_order() {
        let (tracker, store) = create_tracker(Config::default().with_hysteresis_m(0.0));
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let distance = (worker * 100 + i) as f64;
                        tracker.on_detection(distance, t0()).unwrap();
                        tracker.check_timeout(t0()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let events = store.all();
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        let snap = tracker.snapshot();
        assert_eq!(snap.last_distance_m, events.last().unwrap().distance_m);
    }
}
