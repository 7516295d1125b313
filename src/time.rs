use chrono::Utc;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Seconds since the epoch; lease expiry is tracked at this resolution.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}
