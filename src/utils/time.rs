//! Wall-clock helpers. Value timestamps are microseconds; the periodic
//! driver works in milliseconds.

/// Current time in microseconds since the UNIX epoch.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Current time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
