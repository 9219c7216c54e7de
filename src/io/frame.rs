//! RD-03D text frame parsing
//!
//! Protocol:
//! - One reading per line, comma-separated ASCII fields
//! - Field 1: distance in meters (required)
//! - Field 2: energy/confidence (optional, dropped if unparseable)
//! - Whitespace around fields and empty fields are ignored
//!
//! Parsing is total: every input maps to a detection or `None`.

use crate::domain::types::Detection;
use tracing::debug;

const FIELD_DELIMITER: char = ',';

/// Parse a raw line as read from the serial port.
///
/// Bytes that are not valid UTF-8 are dropped before parsing, matching a
/// lossy decode of the frame.
pub fn parse_raw_frame(raw: &[u8]) -> Option<Detection> {
    if raw.is_empty() {
        return None;
    }
    let text: String = String::from_utf8_lossy(raw).chars().filter(|&c| c != '\u{FFFD}').collect();
    parse_frame(&text)
}

/// Parse a decoded text frame such as `"0.87,58"`.
pub fn parse_frame(frame: &str) -> Option<Detection> {
    let mut fields = frame.split(FIELD_DELIMITER).map(str::trim).filter(|f| !f.is_empty());

    let first = fields.next()?;

    let distance_m = match first.parse::<f64>() {
        Ok(d) if d.is_finite() => d,
        _ => {
            debug!(frame = %frame, "radar_frame_invalid");
            return None;
        }
    };

    let energy = fields.next().and_then(|f| f.parse::<f64>().ok());

    Some(Detection { distance_m, energy })
}
