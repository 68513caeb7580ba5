use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch, 0 if the clock is before it.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
