//! Metrics collected and aggregated during load tests.
//!
//! Every request made through a [`VirtualUser`](../user/struct.VirtualUser.html)
//! produces a [`RequestOutcome`], sent over an
//! [`unbounded Flume channel`](https://docs.rs/flume/*/flume/fn.unbounded.html) to
//! a single collector task. The collector is the only owner of the aggregation
//! state: it folds outcomes into the current [`OutcomeWindow`], and every snapshot
//! interval turns that window into an immutable [`MetricsSnapshot`] before starting
//! a new one.
//!
//! When [`Stampede::execute()`](../struct.Stampede.html#method.execute) completes it
//! returns a [`StampedeMetrics`] object holding every emitted snapshot plus a final
//! snapshot covering the whole load test.

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::logger::{LoggerTx, StampedeLog};
use crate::profile::ProfileHistory;
use crate::util;

/// Why a request failed before a response was received.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
pub enum TransportErrorKind {
    /// The request timed out.
    Timeout,
    /// Connection refused, DNS failure, TLS failure, etc.
    Connect,
    /// The request could not be sent.
    Request,
    /// The response body could not be read.
    Body,
    /// Anything else.
    Other,
}

impl From<&reqwest::Error> for TransportErrorKind {
    fn from(error: &reqwest::Error) -> Self {
        // A connect timeout is both a timeout and a connect error, report the timeout.
        if error.is_timeout() {
            TransportErrorKind::Timeout
        } else if error.is_connect() {
            TransportErrorKind::Connect
        } else if error.is_request() {
            TransportErrorKind::Request
        } else if error.is_body() || error.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        }
    }
}

/// How a single request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// The server returned a 2xx status code.
    Success(u16),
    /// The server returned any other status code.
    HttpError(u16),
    /// No response was received.
    TransportError(TransportErrorKind),
}

impl OutcomeStatus {
    /// Classify the result of a request.
    pub fn from_response(response: &Result<reqwest::Response, reqwest::Error>) -> Self {
        match response {
            Ok(r) => OutcomeStatus::from_status_code(r.status().as_u16()),
            Err(e) => OutcomeStatus::TransportError(TransportErrorKind::from(e)),
        }
    }

    /// Classify a status code: 2xx is a success, anything else an error.
    pub fn from_status_code(status_code: u16) -> Self {
        match http::StatusCode::from_u16(status_code) {
            Ok(status) if status.is_success() => OutcomeStatus::Success(status_code),
            _ => OutcomeStatus::HttpError(status_code),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Success(_))
    }

    /// The status code returned by the server, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            OutcomeStatus::Success(code) | OutcomeStatus::HttpError(code) => Some(*code),
            OutcomeStatus::TransportError(_) => None,
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutcomeStatus::Success(code) | OutcomeStatus::HttpError(code) => write!(f, "{}", code),
            OutcomeStatus::TransportError(kind) => write!(f, "{}", kind),
        }
    }
}

/// The recorded result of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// When the request started, in milliseconds since the load test started.
    pub elapsed: u64,
    /// Which virtual user made the request.
    pub user: usize,
    /// The requested URL.
    pub url: String,
    /// How long the request took, in milliseconds.
    pub response_time: u64,
    /// How the request ended.
    pub status: OutcomeStatus,
}

impl RequestOutcome {
    pub fn new(
        elapsed: Duration,
        user: usize,
        url: String,
        response_time: Duration,
        status: OutcomeStatus,
    ) -> Self {
        RequestOutcome {
            elapsed: elapsed.as_millis() as u64,
            user,
            url,
            response_time: response_time.as_millis() as u64,
            status,
        }
    }
}

/// Messages accepted by the metrics collector.
#[derive(Debug, Clone)]
pub enum CollectorMessage {
    /// A request completed.
    Outcome(RequestOutcome),
    /// The number of active virtual users changed.
    Users(usize),
}

/// Outcomes aggregated since the start of a window.
///
/// Response times are kept in a histogram rather than individually, so memory use
/// doesn't grow with the number of requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeWindow {
    started: u64,
    count: usize,
    successes: usize,
    total_time: u64,
    min_time: u64,
    max_time: u64,
    times: BTreeMap<u64, usize>,
    status_codes: BTreeMap<u16, usize>,
    transport_errors: BTreeMap<TransportErrorKind, usize>,
}

impl OutcomeWindow {
    /// Start an empty window at `started` milliseconds into the load test.
    pub fn new(started: u64) -> Self {
        OutcomeWindow {
            started,
            ..Default::default()
        }
    }

    /// How many outcomes have been recorded in this window.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Fold one outcome into the window.
    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.count += 1;
        if outcome.status.is_success() {
            self.successes += 1;
        }

        let response_time = outcome.response_time;
        self.total_time += response_time;
        if self.count == 1 || response_time < self.min_time {
            self.min_time = response_time;
        }
        if response_time > self.max_time {
            self.max_time = response_time;
        }
        *self
            .times
            .entry(util::round_response_time(response_time))
            .or_insert(0) += 1;

        match outcome.status {
            OutcomeStatus::Success(code) | OutcomeStatus::HttpError(code) => {
                *self.status_codes.entry(code).or_insert(0) += 1;
            }
            OutcomeStatus::TransportError(kind) => {
                *self.transport_errors.entry(kind).or_insert(0) += 1;
            }
        }
    }

    /// Summarize the window as it ends at `ended` milliseconds with `users` active.
    ///
    /// Doesn't modify the window, so computing the same snapshot twice gives the
    /// same result.
    pub fn snapshot(&self, ended: u64, users: usize) -> MetricsSnapshot {
        let errors = self.count - self.successes;
        let seconds = ended.saturating_sub(self.started) as f64 / 1_000.0;
        let (error_rate, mean) = if self.count == 0 {
            (0.0, 0.0)
        } else {
            (
                errors as f64 / self.count as f64,
                self.total_time as f64 / self.count as f64,
            )
        };
        let percentile =
            |fraction| util::percentile(&self.times, self.count, self.min_time, self.max_time, fraction);

        MetricsSnapshot {
            window_start: self.started,
            window_end: ended,
            users,
            count: self.count,
            successes: self.successes,
            errors,
            error_rate,
            requests_per_second: if seconds > 0.0 {
                self.count as f64 / seconds
            } else {
                0.0
            },
            min: self.min_time,
            max: self.max_time,
            mean,
            median: percentile(0.5),
            p95: percentile(0.95),
            p99: percentile(0.99),
            status_codes: self.status_codes.clone(),
            transport_errors: self.transport_errors.clone(),
        }
    }
}

/// An aggregated summary of the outcomes recorded during one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Start of the window, in milliseconds since the load test started.
    pub window_start: u64,
    /// End of the window, in milliseconds since the load test started.
    pub window_end: u64,
    /// Active virtual users when the snapshot was taken. For the whole-run total,
    /// the most users that were active at once.
    pub users: usize,
    /// Requests completed during the window.
    pub count: usize,
    pub successes: usize,
    pub errors: usize,
    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub error_rate: f64,
    pub requests_per_second: f64,
    /// Fastest response, in milliseconds.
    pub min: u64,
    /// Slowest response, in milliseconds.
    pub max: u64,
    /// Average response time, in milliseconds.
    pub mean: f64,
    pub median: u64,
    pub p95: u64,
    pub p99: u64,
    /// How often each status code was returned.
    pub status_codes: BTreeMap<u16, usize>,
    /// How often each kind of transport error happened.
    pub transport_errors: BTreeMap<TransportErrorKind, usize>,
}

impl MetricsSnapshot {
    /// CSV header matching [`MetricsSnapshot::to_csv`].
    pub fn csv_header() -> &'static str {
        "window_start,window_end,users,count,successes,errors,error_rate,requests_per_second,min,max,mean,median,p95,p99"
    }

    /// One CSV row, without status code and transport error breakdowns.
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{:.4},{:.2},{},{},{:.2},{},{},{}",
            self.window_start,
            self.window_end,
            self.users,
            self.count,
            self.successes,
            self.errors,
            self.error_rate,
            self.requests_per_second,
            self.min,
            self.max,
            self.mean,
            self.median,
            self.p95,
            self.p99,
        )
    }
}

/// One line per snapshot, used for running log output.
impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:.1}s-{:.1}s: {} users, {} requests ({:.2}/s), {} errors ({:.2}%), ms avg {:.2} min {} median {} p95 {} p99 {} max {}",
            self.window_start as f64 / 1_000.0,
            self.window_end as f64 / 1_000.0,
            self.users,
            util::format_number(self.count),
            self.requests_per_second,
            util::format_number(self.errors),
            self.error_rate * 100.0,
            self.mean,
            self.min,
            self.median,
            self.p95,
            self.p99,
            self.max,
        )
    }
}

/// Everything the collector hands back when its channel closes.
#[derive(Debug, Clone, Default)]
pub(crate) struct CollectorReport {
    pub(crate) snapshots: Vec<MetricsSnapshot>,
    pub(crate) total: MetricsSnapshot,
}

/// The collector's aggregation state.
struct MetricsCollector {
    started: Instant,
    window: OutcomeWindow,
    total: OutcomeWindow,
    users: usize,
    peak_users: usize,
    snapshots: Vec<MetricsSnapshot>,
    logger: LoggerTx,
}

impl MetricsCollector {
    fn new(started: Instant, logger: LoggerTx) -> Self {
        MetricsCollector {
            started,
            window: OutcomeWindow::new(0),
            total: OutcomeWindow::new(0),
            users: 0,
            peak_users: 0,
            snapshots: Vec::new(),
            logger,
        }
    }

    fn elapsed(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn handle(&mut self, message: CollectorMessage) {
        match message {
            CollectorMessage::Outcome(outcome) => {
                self.window.record(&outcome);
                self.total.record(&outcome);
            }
            CollectorMessage::Users(users) => {
                self.users = users;
                self.peak_users = self.peak_users.max(users);
            }
        }
    }

    fn emit(&self, snapshot: &MetricsSnapshot) {
        if let Some(logger) = self.logger.as_ref() {
            if let Err(e) = logger.send(Some(StampedeLog::Snapshot(snapshot.clone()))) {
                warn!("failed to send snapshot to logger: {}", e);
            }
        }
    }

    // Close the current window, emitting it if anything happened, and start a new one.
    fn rotate(&mut self) {
        let now = self.elapsed();
        let snapshot = self.window.snapshot(now, self.users);
        if snapshot.count > 0 {
            info!("{}", snapshot);
            self.emit(&snapshot);
            self.snapshots.push(snapshot);
        } else {
            debug!("no requests between {}ms and {}ms", self.window.started, now);
        }
        self.window = OutcomeWindow::new(now);
    }

    fn finish(mut self) -> CollectorReport {
        self.rotate();
        let total = self.total.snapshot(self.elapsed(), self.peak_users);
        info!("final: {}", total);
        self.emit(&total);
        CollectorReport {
            snapshots: self.snapshots,
            total,
        }
    }
}

/// Collector task: aggregates messages until every sender has been dropped, emitting
/// a snapshot every `interval`.
pub(crate) async fn collector_main(
    receiver: flume::Receiver<CollectorMessage>,
    interval: Duration,
    started: Instant,
    logger: LoggerTx,
) -> CollectorReport {
    let mut collector = MetricsCollector::new(started, logger);
    let now = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval_at(now.checked_add(interval).unwrap_or(now), interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = receiver.recv_async() => match message {
                Ok(message) => collector.handle(message),
                // All senders are gone, the load test is over.
                Err(_) => break,
            },
            _ = ticker.tick() => collector.rotate(),
        }
    }

    debug!("metrics channel closed, emitting final snapshot");
    collector.finish()
}

/// Metrics returned by [`Stampede::execute()`](../struct.Stampede.html#method.execute).
#[derive(Clone, Debug, Default, Serialize)]
pub struct StampedeMetrics {
    /// When the load test started.
    pub started: Option<DateTime<Utc>>,
    /// When the load test finished.
    pub stopped: Option<DateTime<Utc>>,
    /// How long the load test ran.
    pub duration: Duration,
    /// Every snapshot emitted while the load test ran.
    pub snapshots: Vec<MetricsSnapshot>,
    /// A snapshot covering the entire load test.
    pub total: MetricsSnapshot,
    /// Changes in the scheduler's direction.
    #[serde(skip)]
    pub history: Vec<ProfileHistory>,
    /// How many virtual users were launched in total.
    pub users_launched: usize,
    /// The largest number of virtual users alive at the same time.
    pub max_users_observed: usize,
    /// Iterations completed by all virtual users.
    pub iterations: usize,
    /// Whether [`StampedeMetrics::print`] displays anything.
    #[serde(skip)]
    pub(crate) display_metrics: bool,
}

impl StampedeMetrics {
    /// Print the final summary, unless disabled.
    pub fn print(&self) {
        if self.display_metrics {
            println!("{}", self);
        }
    }
}

impl fmt::Display for StampedeMetrics {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let total = &self.total;
        writeln!(fmt)?;
        writeln!(fmt, " === SUMMARY ===")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Duration", "# reqs", "# fails", "req/s", "users"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.2} | {:>7}",
            format!("{:.1}s", self.duration.as_secs_f64()),
            util::format_number(total.count),
            format!(
                "{} ({:.1}%)",
                util::format_number(total.errors),
                total.error_rate * 100.0
            ),
            total.requests_per_second,
            self.max_users_observed,
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<10} | {:>9} | {:>9} | {:>9} | {:>9} | {:>9} | {:>9}",
            "", "Avg (ms)", "Min", "Median", "95%", "99%", "Max"
        )?;
        writeln!(
            fmt,
            " {:<10} | {:>9.2} | {:>9} | {:>9} | {:>9} | {:>9} | {:>9}",
            "Aggregated", total.mean, total.min, total.median, total.p95, total.p99, total.max,
        )?;

        if !total.status_codes.is_empty() || !total.transport_errors.is_empty() {
            writeln!(
                fmt,
                " ------------------------------------------------------------------------------"
            )?;
            writeln!(fmt, " {:<24} | {:>13}", "Status", "# times")?;
            for (code, count) in &total.status_codes {
                writeln!(fmt, " {:<24} | {:>13}", code, util::format_number(*count))?;
            }
            for (kind, count) in &total.transport_errors {
                writeln!(
                    fmt,
                    " {:<24} | {:>13}",
                    format!("{} error", kind),
                    util::format_number(*count)
                )?;
            }
        }
        write!(
            fmt,
            " ------------------------------------------------------------------------------"
        )
    }
}
