//! Utility functions used by Stampede, and available when writing iterations.

use lazy_static::lazy_static;
use num_format::{Locale, ToFormattedString};
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{self, Duration};
use url::Url;

use crate::StampedeError;

lazy_static! {
    static ref TIMESPAN: Regex =
        Regex::new(r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<millis>\d+)ms)?$")
            .expect("timespan regex is valid");
    /// Set when ctrl-c is caught, shared by every load test in the process.
    pub(crate) static ref CANCELED: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// Parse a string representing a time span and return it as a [`Duration`].
///
/// Can be specified as an integer or a decimal, indicating seconds. Or can use
/// integers together with one or more of "h", "m", "s" and "ms", in that order,
/// indicating "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 1.5, 20s, 3m, 2h, 1h20m, 3h30m10s, 250ms, 1s500ms.
/// Anything else returns `None`.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use stampede::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // A bare number is seconds.
/// assert_eq!(util::parse_timespan("0.1"), Some(Duration::from_millis(100)));
///
/// // Invalid value.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<Duration> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return None;
    }

    // A bare number is assumed to be seconds.
    if let Ok(seconds) = f64::from_str(time_str) {
        trace!("{} is a number: {} seconds", time_str, seconds);
        if seconds < 0.0 {
            return None;
        }
        // Rejects NaN, infinity, and values too large for a Duration.
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let captures = TIMESPAN.captures(time_str)?;
    // An unset component is 0, one too large for a u64 is invalid.
    let component = |name: &str| -> Option<u64> {
        match captures.name(name) {
            Some(m) => u64::from_str(m.as_str()).ok(),
            None => Some(0),
        }
    };
    let hours = component("hours")?;
    let minutes = component("minutes")?;
    let seconds = component("seconds")?;
    let millis = component("millis")?;
    let total_seconds = hours
        .checked_mul(60 * 60)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;
    let total = Duration::from_secs(total_seconds).checked_add(Duration::from_millis(millis))?;
    trace!(
        "{} hours {} minutes {} seconds {} milliseconds: {:?}",
        hours,
        minutes,
        seconds,
        millis,
        total
    );
    Some(total)
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Returns a fresh drift timer to pass in on the next call.
pub async fn sleep_minus_drift(
    duration: Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Determine if a timer has expired.
///
/// A `run_time` of zero never expires.
///
/// # Example
/// ```rust
/// use std::time::{Duration, Instant};
/// use stampede::util;
///
/// let started = Instant::now();
/// assert_eq!(util::timer_expired(started, Duration::from_secs(60)), false);
/// assert_eq!(util::timer_expired(started, Duration::from_secs(0)), false);
/// ```
pub fn timer_expired(started: time::Instant, run_time: Duration) -> bool {
    !run_time.is_zero() && started.elapsed() >= run_time
}

/// Convert optional string to f32, otherwise defaulting to None.
pub fn get_float_from_string(string: Option<String>) -> Option<f32> {
    match string {
        Some(s) => match s.parse::<f32>() {
            Ok(value) => Some(value),
            Err(e) => {
                info!("failed to convert {} to float: {}", s, e);
                None
            }
        },
        None => None,
    }
}

/// Ensure that a string is a valid URL including a host.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// assert!(util::is_valid_host("http://localhost:3000").is_ok());
/// assert!(util::is_valid_host("localhost").is_err());
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, StampedeError> {
    Url::parse(host).map_err(|parse_error| StampedeError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid host.".to_string(),
        parse_error,
    })?;
    Ok(true)
}

/// Round response times so the histogram stays small on long load tests.
///
/// Exact below 100ms, then rounded to the nearest 10ms below 500ms, the nearest
/// 100ms below 1s, and the nearest second above that.
pub fn round_response_time(response_time: u64) -> u64 {
    if response_time < 100 {
        response_time
    } else if response_time < 500 {
        ((response_time as f64 / 10.0).round() * 10.0) as u64
    } else if response_time < 1_000 {
        ((response_time as f64 / 100.0).round() * 100.0) as u64
    } else {
        ((response_time as f64 / 1_000.0).round() * 1_000.0) as u64
    }
}

/// Get the response time that a certain fraction of the requests finished within.
///
/// `response_times` maps a (rounded) response time to how often it was seen. The
/// result is clamped to the exact `min` and `max` to undo rounding at the edges.
///
/// # Example
/// ```rust
/// use std::collections::BTreeMap;
/// use stampede::util;
///
/// let mut times: BTreeMap<u64, usize> = BTreeMap::new();
/// times.insert(1, 1);
/// times.insert(99, 1);
/// times.insert(100, 1);
///
/// assert_eq!(util::percentile(&times, 3, 1, 100, 0.5), 99);
/// assert_eq!(util::percentile(&times, 3, 1, 100, 0.99), 100);
/// ```
pub fn percentile(
    response_times: &BTreeMap<u64, usize>,
    total: usize,
    min: u64,
    max: u64,
    fraction: f64,
) -> u64 {
    if total == 0 {
        return 0;
    }
    let wanted = ((total as f64 * fraction).round() as usize).max(1);

    let mut seen: usize = 0;
    for (value, counter) in response_times {
        seen += counter;
        if seen >= wanted {
            return (*value).clamp(min, max);
        }
    }
    max
}

/// Catch ctrl-c so the load test can stop gracefully and still return metrics.
///
/// A second ctrl-c exits immediately. The handler can only be installed once per
/// process; later calls just reset the flag.
pub(crate) fn setup_ctrlc_handler() {
    match ctrlc::set_handler(move || {
        if CANCELED.swap(true, Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            CANCELED.store(false, Ordering::SeqCst);
            info!("reset ctrl-c handler: {}", e);
        }
    }
}

/// Whether ctrl-c has been caught.
pub(crate) fn canceled() -> bool {
    CANCELED.load(Ordering::SeqCst)
}

/// Format large number in locale appropriate style.
pub fn format_number(number: usize) -> String {
    number.to_formatted_string(&Locale::en)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), Some(Duration::from_secs(0)));
        assert_eq!(parse_timespan("foo"), None);
        assert_eq!(parse_timespan(""), None);
        assert_eq!(parse_timespan("-1"), None);
        assert_eq!(parse_timespan("1"), Some(Duration::from_secs(1)));
        assert_eq!(parse_timespan("1.5"), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_timespan("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_timespan("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_timespan("61m"), Some(Duration::from_secs(3_660)));
        assert_eq!(parse_timespan("1h"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
        assert_eq!(parse_timespan("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timespan("1s500ms"), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_timespan(" 30s "), Some(Duration::from_secs(30)));
        assert_eq!(parse_timespan("1m1h"), None);

        // Too large for a Duration.
        assert_eq!(parse_timespan("1e30"), None);
        assert_eq!(parse_timespan("inf"), None);
        assert_eq!(parse_timespan("NaN"), None);
        assert_eq!(parse_timespan("9999999999999999999h"), None);
        assert_eq!(parse_timespan("99999999999999999999s"), None);
        assert_eq!(parse_timespan("18446744073709551615s999999999999ms"), None);
        assert_eq!(
            parse_timespan("18446744073709551615s"),
            Some(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn timer() {
        let started = time::Instant::now();
        assert!(!timer_expired(started, Duration::from_secs(0)));
        assert!(!timer_expired(started, Duration::from_secs(10)));
        assert!(timer_expired(
            started - Duration::from_secs(2),
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_response_time(7), 7);
        assert_eq!(round_response_time(99), 99);
        assert_eq!(round_response_time(123), 120);
        assert_eq!(round_response_time(555), 600);
        assert_eq!(round_response_time(1_499), 1_000);
        assert_eq!(round_response_time(1_500), 2_000);
    }

    #[test]
    fn percentiles() {
        let mut times: BTreeMap<u64, usize> = BTreeMap::new();
        assert_eq!(percentile(&times, 0, 0, 0, 0.5), 0);

        times.insert(5, 90);
        times.insert(120, 9);
        times.insert(1_000, 1);
        assert_eq!(percentile(&times, 100, 5, 1_234, 0.5), 5);
        assert_eq!(percentile(&times, 100, 5, 1_234, 0.95), 120);
        assert_eq!(percentile(&times, 100, 5, 1_234, 0.99), 120);
        assert_eq!(percentile(&times, 100, 5, 1_234, 1.0), 1_000);

        // Rounding is undone at the edges.
        let mut times: BTreeMap<u64, usize> = BTreeMap::new();
        times.insert(2_000, 1);
        assert_eq!(percentile(&times, 1, 1_678, 1_678, 0.5), 1_678);
    }

    #[test]
    fn host() {
        assert!(is_valid_host("http://example.com").is_ok());
        assert!(is_valid_host("https://example.com:8080/path").is_ok());
        assert!(is_valid_host("example.com").is_err());
        assert!(is_valid_host("").is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_number(12), "12");
    }
}
