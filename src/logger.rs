//! Optional log files.
//!
//! Stampede can write two log files during a load test, enabled through any
//! combination of the following run-time options:
//!  - `--request-log`: one line per request made by any virtual user
//!  - `--snapshot-log`: one line per [`MetricsSnapshot`] emitted by the metrics
//!    collector, followed by the final snapshot covering the entire load test
//!
//! The format of each log can be configured with `--request-format` and
//! `--snapshot-format`: `json` (the default), `csv`, `raw` or `pretty`.
//!
//! When at least one log is enabled, a logger task is launched and a channel is
//! provided to every [`VirtualUser`](../user/struct.VirtualUser.html) and to the
//! metrics collector. The logger task writes through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html), so
//! logging doesn't slow down the virtual users.
//!
//! A request log entry in the `json` format looks like:
//! ```json
//! {"elapsed":1203,"user":3,"url":"http://localhost:3000/api","response_time":2,"status":{"Success":200}}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::IntoEnumIterator;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::StampedeConfiguration;
use crate::metrics::{MetricsSnapshot, RequestOutcome};
use crate::StampedeError;

/// Optional join handle for the logger task, if enabled.
pub(crate) type LoggerJoinHandle = Option<tokio::task::JoinHandle<Result<(), StampedeError>>>;
/// Optional unbounded sender to the logger task, if enabled. Sending `None` tells
/// the logger to flush and exit.
pub(crate) type LoggerTx = Option<flume::Sender<Option<StampedeLog>>>;

/// Formats available for log files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum_macros::EnumIter)]
pub enum LogFormat {
    Json,
    Csv,
    Raw,
    Pretty,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LogFormat::Json => "json",
            LogFormat::Csv => "csv",
            LogFormat::Raw => "raw",
            LogFormat::Pretty => "pretty",
        };
        write!(f, "{}", name)
    }
}

/// Allow `--request-format` and `--snapshot-format` to be set from the command line.
impl FromStr for LogFormat {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = s.trim().to_lowercase();
        match LogFormat::iter().find(|f| f.to_string() == format) {
            Some(f) => Ok(f),
            None => {
                let expected: Vec<String> = LogFormat::iter().map(|f| f.to_string()).collect();
                Err(StampedeError::InvalidOption {
                    option: "LogFormat".to_string(),
                    value: s.to_string(),
                    detail: format!("Expected one of: {}.", expected.join(", ")),
                })
            }
        }
    }
}

/// Messages accepted by the logger task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StampedeLog {
    /// Written to the request log.
    Request(RequestOutcome),
    /// Written to the snapshot log.
    Snapshot(MetricsSnapshot),
}

const REQUEST_CSV_HEADER: &str = "elapsed,user,url,response_time,status,success";

fn request_csv(outcome: &RequestOutcome) -> String {
    format!(
        "{},{},\"{}\",{},{},{}",
        outcome.elapsed,
        outcome.user,
        outcome.url.replace('"', "\"\""),
        outcome.response_time,
        outcome.status,
        outcome.status.is_success(),
    )
}

/// An open log file.
struct LogFile {
    path: String,
    format: LogFormat,
    writer: BufWriter<File>,
}

impl LogFile {
    /// Create the file, writing a CSV header if needed.
    async fn create(
        path: &str,
        format: LogFormat,
        csv_header: &str,
    ) -> Result<Option<LogFile>, StampedeError> {
        if path.is_empty() {
            return Ok(None);
        }
        let file = File::create(path).await.map_err(|e| StampedeError::InvalidOption {
            option: "log file".to_string(),
            value: path.to_string(),
            detail: format!("Failed to create log file: {}", e),
        })?;
        info!("writing {} log to: {}", format, path);
        let mut log_file = LogFile {
            path: path.to_string(),
            format,
            writer: BufWriter::new(file),
        };
        if format == LogFormat::Csv {
            log_file.write_line(csv_header).await;
        }
        Ok(Some(log_file))
    }

    async fn write_line(&mut self, line: &str) {
        if let Err(e) = self.writer.write_all(format!("{}\n", line).as_bytes()).await {
            warn!("failed to write to {}: {}", self.path, e);
        }
    }

    async fn flush(&mut self) {
        info!("flushing {}", self.path);
        if let Err(e) = self.writer.flush().await {
            warn!("failed to flush {}: {}", self.path, e);
        }
    }
}

// Render a message in the requested format. CSV rows are formatted by the caller.
fn format_log<T: Serialize + fmt::Debug>(message: &T, format: LogFormat, csv: impl Fn() -> String) -> String {
    match format {
        LogFormat::Json => match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize {:?}: {}", message, e);
                format!("{:?}", message)
            }
        },
        LogFormat::Csv => csv(),
        LogFormat::Raw => format!("{:?}", message),
        LogFormat::Pretty => format!("{:#?}", message),
    }
}

impl StampedeConfiguration {
    /// Open any configured log files and, if there are any, spawn the logger task.
    ///
    /// Files are created before the load test starts so a bad path is reported as
    /// a configuration error.
    pub(crate) async fn setup_logger(&self) -> Result<(LoggerJoinHandle, LoggerTx), StampedeError> {
        let request_log = LogFile::create(
            &self.request_log,
            self.request_format.unwrap_or(LogFormat::Json),
            REQUEST_CSV_HEADER,
        )
        .await?;
        let snapshot_log = LogFile::create(
            &self.snapshot_log,
            self.snapshot_format.unwrap_or(LogFormat::Json),
            MetricsSnapshot::csv_header(),
        )
        .await?;

        if request_log.is_none() && snapshot_log.is_none() {
            return Ok((None, None));
        }

        let (logger_tx, logger_rx) = flume::unbounded::<Option<StampedeLog>>();
        let handle = tokio::spawn(logger_main(request_log, snapshot_log, logger_rx));
        Ok((Some(handle), Some(logger_tx)))
    }
}

/// Logger task: writes messages to the matching log file until told to exit.
async fn logger_main(
    mut request_log: Option<LogFile>,
    mut snapshot_log: Option<LogFile>,
    receiver: flume::Receiver<Option<StampedeLog>>,
) -> Result<(), StampedeError> {
    while let Ok(message) = receiver.recv_async().await {
        match message {
            Some(StampedeLog::Request(outcome)) => {
                if let Some(file) = request_log.as_mut() {
                    let line = format_log(&outcome, file.format, || request_csv(&outcome));
                    file.write_line(&line).await;
                }
            }
            Some(StampedeLog::Snapshot(snapshot)) => {
                if let Some(file) = snapshot_log.as_mut() {
                    let line = format_log(&snapshot, file.format, || snapshot.to_csv());
                    file.write_line(&line).await;
                }
            }
            // Empty message means it's time to exit.
            None => break,
        }
    }

    if let Some(file) = request_log.as_mut() {
        file.flush().await;
    }
    if let Some(file) = snapshot_log.as_mut() {
        file.flush().await;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metrics::OutcomeStatus;
    use std::time::Duration;

    #[test]
    fn formats() {
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("CSV").unwrap(), LogFormat::Csv);
        assert_eq!(LogFormat::from_str(" raw ").unwrap(), LogFormat::Raw);
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        match LogFormat::from_str("xml") {
            Err(StampedeError::InvalidOption { detail, .. }) => {
                assert_eq!(detail, "Expected one of: json, csv, raw, pretty.")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn request_lines() {
        let outcome = RequestOutcome::new(
            Duration::from_millis(1_203),
            3,
            "http://localhost:3000/api".to_string(),
            Duration::from_millis(2),
            OutcomeStatus::Success(200),
        );
        assert_eq!(
            format_log(&outcome, LogFormat::Json, || request_csv(&outcome)),
            r#"{"elapsed":1203,"user":3,"url":"http://localhost:3000/api","response_time":2,"status":{"Success":200}}"#
        );
        assert_eq!(
            format_log(&outcome, LogFormat::Csv, || request_csv(&outcome)),
            "1203,3,\"http://localhost:3000/api\",2,200,true"
        );
        assert!(format_log(&outcome, LogFormat::Raw, || request_csv(&outcome))
            .starts_with("RequestOutcome {"));
    }
}
