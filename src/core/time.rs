//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
