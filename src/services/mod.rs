//! Services - presence logic
//!
//! - `presence` - Debounced presence state machine and event recording
//! - `poller` - Sensor polling loop with reconnect and lifecycle control

pub mod poller;
pub mod presence;

pub use poller::{PollError, PollSettings, PresenceService};
pub use presence::PresenceTracker;
