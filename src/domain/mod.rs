//! Domain models - core presence types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Detection` - one parsed radar reading
//! - `PresenceSnapshot` - consistent copy of the tracker state
//! - `PresenceEvent` - persisted occupancy transition
//! - `LinkState` - sensor connection lifecycle

pub mod types;

// Re-export commonly used types at module level
pub use types::{
    Detection, LinkState, NewPresenceEvent, Occupancy, PresenceEvent, PresenceSnapshot,
};
