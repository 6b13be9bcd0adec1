//! Utility functions used by Stampede.

use std::time;

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Used to launch virtual users at a steady pace: the time spent launching a user is
/// subtracted from the time slept before launching the next one. Returns a new drift
/// timer to pass into the next call.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// #[tokio::main]
/// async fn main() {
///     let mut drift_timer = tokio::time::Instant::now();
///     for _ in 0..2 {
///         // Do stuff ...
///
///         // Sleep for 10 milliseconds minus the time spent doing stuff.
///         drift_timer = util::sleep_minus_drift(
///             std::time::Duration::from_millis(10),
///             drift_timer,
///         ).await;
///     }
/// }
/// ```
pub async fn sleep_minus_drift(
    duration: time::Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Truncate strings when they're too long to display.
///
/// If a string is longer than the specified max length, it is truncated and two
/// dots are appended to the end.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // All but 7 characters are truncated, with ".." appended.
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
///
/// // All characters are returned as the string is less than 15 characters long.
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length.saturating_sub(2)) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Convert an optional string to a float, logging a warning if it isn't a number.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// assert_eq!(util::get_float_from_string(Some("1.5".to_string())), Some(1.5));
/// assert_eq!(util::get_float_from_string(Some("1.1.1".to_string())), None);
/// assert_eq!(util::get_float_from_string(None), None);
/// ```
pub fn get_float_from_string(string: Option<String>) -> Option<f64> {
    match string {
        Some(s) => match s.parse::<f64>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("failed to convert {} to float: {}", s, e);
                None
            }
        },
        None => None,
    }
}

/// Convert fractional seconds to a duration, zero if negative or NaN and saturating at
/// `Duration::MAX` if too large.
pub fn seconds_to_duration(seconds: f64) -> time::Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return time::Duration::ZERO;
    }
    time::Duration::try_from_secs_f64(seconds).unwrap_or(time::Duration::MAX)
}

/// A duration in nanoseconds, saturating at `u64::MAX`.
pub fn duration_nanos(duration: time::Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Nanoseconds as fractional milliseconds, for display.
pub fn nanos_to_millis(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000.0
}
