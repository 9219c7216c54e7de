//! IO modules - external system interfaces
//!
//! - `radar` - RD-03D serial link and line framing
//! - `frame` - Text frame parsing into detections
//! - `event_store` - Event store contract and in-memory store
//! - `event_log` - Durable append-only event log (JSONL format)
//! - `api` - HTTP query surface and Prometheus metrics

pub mod api;
pub mod event_log;
pub mod event_store;
pub mod frame;
pub mod radar;

// Re-export commonly used types
pub use event_log::JsonlEventStore;
pub use event_store::{EventStore, MemoryEventStore, StoreError};
pub use radar::{SensorConnector, SensorLink, SerialConnector};
