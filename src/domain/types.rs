//! Shared types for the presence guardian

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One usable reading from the radar: distance plus optional energy/confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub distance_m: f64,
    pub energy: Option<f64>,
}

impl Detection {
    pub fn new(distance_m: f64, energy: Option<f64>) -> Self {
        Self { distance_m, energy }
    }
}

/// Occupancy decision of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Occupancy {
    #[default]
    Absent,
    Present,
}

impl Occupancy {
    pub fn is_present(self) -> bool {
        self == Occupancy::Present
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Occupancy::Absent => "absent",
            Occupancy::Present => "present",
        }
    }
}

/// Sensor link lifecycle as seen by the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }
}

/// Point-in-time copy of the tracker state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceSnapshot {
    pub present: bool,
    #[serde(with = "utc_iso::option")]
    pub last_seen: Option<DateTime<Utc>>,
    pub last_distance_m: Option<f64>,
    pub note: Option<String>,
    /// Set when the most recent event could not be persisted
    pub persistence_degraded: bool,
}

/// Event produced by the tracker, not yet assigned a store id
#[derive(Debug, Clone, PartialEq)]
pub struct NewPresenceEvent {
    pub timestamp: DateTime<Utc>,
    pub present: bool,
    pub distance_m: Option<f64>,
    pub note: Option<String>,
}

/// Persisted presence event. `id` is the store's insertion order key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub id: u64,
    #[serde(with = "utc_iso")]
    pub timestamp: DateTime<Utc>,
    pub present: bool,
    pub distance_m: Option<f64>,
    pub note: Option<String>,
}

impl PresenceEvent {
    pub fn from_new(id: u64, event: NewPresenceEvent) -> Self {
        Self {
            id,
            timestamp: event.timestamp,
            present: event.present,
            distance_m: event.distance_m,
            note: event.note,
        }
    }
}

/// UTC timestamps as ISO-8601 without an offset, e.g. `2024-05-01T12:00:00.250000`
pub mod utc_iso {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const WRITE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
    const READ_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.format(WRITE_FORMAT).to_string()
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, READ_FORMAT) {
            return Some(naive.and_utc());
        }
        // Tolerate records written with an explicit offset
        DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.with_timezone(&Utc))
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::Serializer;

        pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match ts {
                Some(ts) => serializer.serialize_some(&super::format(ts)),
                None => serializer.serialize_none(),
            }
        }
    }
}
