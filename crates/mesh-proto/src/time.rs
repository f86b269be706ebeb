use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current UTC time as a millisecond-precision ISO-8601 string (`Z` suffix).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format an epoch-millisecond timestamp as ISO-8601 with millisecond
/// precision.
pub fn iso_ms(ms: u64) -> String {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Parse an ISO-8601 timestamp into epoch milliseconds. Returns `None` for
/// anything unparseable rather than guessing.
pub fn parse_iso(s: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis().max(0) as u64)
}
