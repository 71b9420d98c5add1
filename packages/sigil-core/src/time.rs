//! Time utilities.
//!
//! All persisted and wire timestamps are Unix milliseconds (`i64`), taken from
//! `chrono::Utc::now()`.

use std::time::Duration;

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether `duration` has elapsed between `since_millis` and `now_millis`.
pub fn has_elapsed(since_millis: i64, now_millis: i64, duration: Duration) -> bool {
    let elapsed = now_millis.saturating_sub(since_millis);
    elapsed >= 0 && elapsed as u128 >= duration.as_millis()
}

/// Serde helper for `Duration` fields stored as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_timestamp_is_reasonable() {
        let ts = now_timestamp();
        // Should be after 2024-01-01 (1704067200)
        assert!(ts > 1704067200, "Timestamp {} is too old", ts);
        // Should be before 2100-01-01 (4102444800)
        assert!(ts < 4102444800, "Timestamp {} is too far in future", ts);
    }

    #[test]
    fn test_has_elapsed() {
        let start = 1_000;
        assert!(!has_elapsed(start, 1_500, Duration::from_secs(1)));
        assert!(has_elapsed(start, 2_000, Duration::from_secs(1)));
        // A clock that went backwards never counts as elapsed
        assert!(!has_elapsed(start, 500, Duration::ZERO));
    }
}
