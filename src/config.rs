//! Functions and structures related to configuring a Stampede load test.
//!
//! Stampede can be configured at run time by passing in the options and flags
//! defined by the [`StampedeConfiguration`] structure.
//!
//! Stampede can be configured programmatically with [`StampedeDefaultType::set_default`].
//! Options passed on the command line always win over programmatic defaults, which
//! in turn win over built-in defaults.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::logger::LogFormat;
use crate::profile::ConcurrencyProfile;
use crate::user::PauseDistribution;
use crate::util;
use crate::{Stampede, StampedeError};

/// How often the scheduler compares active users to the profile, unless configured.
pub(crate) const DEFAULT_TICK: &str = "100ms";
/// How often the metrics collector emits a snapshot, unless configured.
pub(crate) const DEFAULT_SNAPSHOT_INTERVAL: &str = "1s";
/// Per-request timeout in seconds, unless configured.
pub(crate) const DEFAULT_TIMEOUT: f32 = 60.0;

/// Runtime options available when launching a Stampede load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`StampedeDefaultType::set_default`].
///
/// Stampede leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the
/// structure below. Pass `-h` to see it.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede runs an iteration in a pool of concurrent virtual users following a
concurrency profile, and reports windowed metrics about every request.

The following runtime options are available when launching a Stampede load test:"#
)]
pub struct StampedeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V", help = "Prints version information\n")]
    pub version: bool,

    /// Defines host to load test (ie http://localhost:3000)
    #[options(short = "H")]
    pub host: String,
    /// Defines path requested by each iteration (default: /)
    #[options(no_short, meta = "PATH")]
    pub path: String,
    /// Sets concurrent users (default: number of CPUs)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Starts users over (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "s", meta = "TIME")]
    pub startup_time: String,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Defines a concurrency profile ("0,10;30s,10;30s,0")
    #[options(no_short, meta = "\"PROFILE\"")]
    pub profile: Option<ConcurrencyProfile>,
    /// Never runs more than this many users at once
    #[options(short = "m", meta = "USERS")]
    pub max_users: Option<usize>,
    /// Sets how many times each user runs the iteration then exits
    #[options(no_short)]
    pub iterations: usize,
    /// Sets pause after each iteration (none, constant:1s, uniform:0..100ms)
    #[options(no_short, meta = "PAUSE")]
    pub pause: Option<PauseDistribution>,
    /// Sets per-request timeout, in seconds (default: 60)
    #[options(no_short, meta = "VALUE")]
    pub timeout: Option<String>,
    /// Sets how often the scheduler adjusts users (default: 100ms)
    #[options(no_short, meta = "TIME")]
    pub tick: String,
    /// Sets how often metrics snapshots are emitted (default: 1s)
    #[options(no_short, meta = "TIME", help = "Sets how often metrics snapshots are emitted (default: 1s)\n")]
    pub snapshot_interval: String,

    /// Enables Stampede log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub stampede_log: String,
    /// Increases Stampede log level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Stampede verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases Stampede verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Metrics:' header after this option
        help = "Increases Stampede verbosity (-v, -vv, etc)\n\nMetrics:"
    )]
    pub verbose: u8,

    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Sets snapshot log file name
    #[options(no_short, meta = "NAME")]
    pub snapshot_log: String,
    /// Sets snapshot log format (json, csv, raw, pretty)
    #[options(no_short, meta = "FORMAT")]
    pub snapshot_format: Option<LogFormat>,
    /// Sets request log file name
    #[options(no_short, meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (json, csv, raw, pretty)
    #[options(
        no_short,
        meta = "FORMAT",
        help = "Sets request log format (json, csv, raw, pretty)\n\nAdvanced:"
    )]
    pub request_format: Option<LogFormat>,

    /// Doesn't set the gzip Accept-Encoding header
    #[options(no_short)]
    pub no_gzip: bool,
    /// Disables validation of https certificates
    #[options(no_short)]
    pub accept_invalid_certs: bool,
}

/// Optional default values for Stampede run-time options.
///
/// These custom defaults can be configured using [`StampedeDefaultType::set_default()`].
#[derive(Clone, Debug, Default)]
pub(crate) struct StampedeDefaults {
    pub host: Option<String>,
    pub path: Option<String>,
    pub users: Option<usize>,
    pub startup_time: Option<String>,
    pub run_time: Option<String>,
    pub profile: Option<ConcurrencyProfile>,
    pub max_users: Option<usize>,
    pub iterations: Option<usize>,
    pub pause: Option<PauseDistribution>,
    pub timeout: Option<String>,
    pub tick: Option<String>,
    pub snapshot_interval: Option<String>,
    pub stampede_log: Option<String>,
    pub log_level: Option<u8>,
    pub quiet: Option<u8>,
    pub verbose: Option<u8>,
    pub no_print_metrics: Option<bool>,
    pub snapshot_log: Option<String>,
    pub snapshot_format: Option<LogFormat>,
    pub request_log: Option<String>,
    pub request_format: Option<LogFormat>,
    pub no_gzip: Option<bool>,
    pub accept_invalid_certs: Option<bool>,
}

/// All run-time options that can be configured with custom defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StampedeDefault {
    /// The host to load test.
    Host,
    /// The path requested by the built-in iteration.
    Path,
    /// How many users to run when no profile is configured.
    Users,
    /// How long to take starting users.
    StartupTime,
    /// How long to run the load test.
    RunTime,
    /// A concurrency profile.
    Profile,
    /// The most users allowed to run at once.
    MaxUsers,
    /// How many iterations each user runs before exiting.
    Iterations,
    /// The pause after each iteration.
    Pause,
    /// The per-request timeout, in seconds.
    Timeout,
    /// How often the scheduler adjusts users.
    Tick,
    /// How often snapshots are emitted.
    SnapshotInterval,
    /// The Stampede log file name.
    StampedeLog,
    /// The Stampede log file level.
    LogLevel,
    /// How much to reduce verbosity.
    Quiet,
    /// How much to increase verbosity.
    Verbose,
    /// Don't print metrics when the load test finishes.
    NoPrintMetrics,
    /// The snapshot log file name.
    SnapshotLog,
    /// The snapshot log format.
    SnapshotFormat,
    /// The request log file name.
    RequestLog,
    /// The request log format.
    RequestFormat,
    /// Don't set the gzip Accept-Encoding header.
    NoGzip,
    /// Don't validate https certificates.
    AcceptInvalidCerts,
}

impl StampedeDefault {
    // The type `set_default` expects for this option, used in error messages.
    fn expects(&self) -> &'static str {
        match self {
            StampedeDefault::Host
            | StampedeDefault::Path
            | StampedeDefault::Timeout
            | StampedeDefault::Tick
            | StampedeDefault::SnapshotInterval
            | StampedeDefault::StampedeLog
            | StampedeDefault::SnapshotLog
            | StampedeDefault::RequestLog => "&str",
            StampedeDefault::StartupTime | StampedeDefault::RunTime => "&str or usize",
            StampedeDefault::Users
            | StampedeDefault::MaxUsers
            | StampedeDefault::Iterations
            | StampedeDefault::LogLevel
            | StampedeDefault::Quiet
            | StampedeDefault::Verbose => "usize",
            StampedeDefault::NoPrintMetrics
            | StampedeDefault::NoGzip
            | StampedeDefault::AcceptInvalidCerts => "bool",
            StampedeDefault::SnapshotFormat | StampedeDefault::RequestFormat => "LogFormat",
            StampedeDefault::Profile => "ConcurrencyProfile or &str",
            StampedeDefault::Pause => "PauseDistribution or &str",
        }
    }

    // Build the error returned when a default is set with the wrong type.
    fn wrong_type<T: fmt::Debug>(self, value: T, received: &str) -> StampedeError {
        StampedeError::InvalidOption {
            option: format!("StampedeDefault::{:?}", self),
            value: format!("{:?}", value),
            detail: format!(
                "set_default(StampedeDefault::{:?}, {:?}) expected {} value, received {}",
                self,
                value,
                self.expects(),
                received
            ),
        }
    }
}

/// Most run-time options can be programmatically configured with custom defaults.
///
/// For example, a load test can default to running against a local development
/// server. The `--host` run-time option still overrides it.
///
/// # Example
/// ```rust
/// use stampede::prelude::*;
///
/// fn main() -> Result<(), StampedeError> {
///     Stampede::initialize_with_config(StampedeConfiguration::default())?
///         .set_default(StampedeDefault::Host, "http://localhost:3000")?
///         .set_default(StampedeDefault::Profile, "0,10;30s,10;30s,0")?
///         .set_default(StampedeDefault::MaxUsers, 10)?
///         .set_default(StampedeDefault::NoPrintMetrics, true)?;
///
///     Ok(())
/// }
/// ```
///
/// The following options are set with a borrowed string slice ([`&str`]): `Host`,
/// `Path`, `StartupTime`, `RunTime`, `Profile`, `Pause`, `Timeout`, `Tick`,
/// `SnapshotInterval`, `StampedeLog`, `SnapshotLog` and `RequestLog`.
///
/// The following options are set with a [`usize`]: `Users`, `StartupTime` and
/// `RunTime` (in seconds), `MaxUsers`, `Iterations`, `LogLevel`, `Quiet` and
/// `Verbose`.
///
/// The following flags are set with a [`bool`]: `NoPrintMetrics`, `NoGzip` and
/// `AcceptInvalidCerts`.
///
/// `SnapshotFormat` and `RequestFormat` are set with a [`LogFormat`], `Profile`
/// with a [`ConcurrencyProfile`] and `Pause` with a [`PauseDistribution`].
pub trait StampedeDefaultType<T> {
    /// Sets a [`StampedeDefault`] to the provided value. The required type of each
    /// option is documented in [`StampedeDefaultType`].
    fn set_default(self, key: StampedeDefault, value: T) -> Result<Box<Self>, StampedeError>;
}

impl StampedeDefaultType<&str> for Stampede {
    /// Sets [`StampedeDefault`] to a [`&str`] value.
    fn set_default(mut self, key: StampedeDefault, value: &str) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::Host => {
                self.defaults.host = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            StampedeDefault::Path => self.defaults.path = Some(value.to_string()),
            StampedeDefault::StartupTime => self.defaults.startup_time = Some(value.to_string()),
            StampedeDefault::RunTime => self.defaults.run_time = Some(value.to_string()),
            StampedeDefault::Profile => {
                self.defaults.profile = Some(value.parse::<ConcurrencyProfile>()?)
            }
            StampedeDefault::Pause => self.defaults.pause = Some(value.parse::<PauseDistribution>()?),
            StampedeDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            StampedeDefault::Tick => self.defaults.tick = Some(value.to_string()),
            StampedeDefault::SnapshotInterval => {
                self.defaults.snapshot_interval = Some(value.to_string())
            }
            StampedeDefault::StampedeLog => self.defaults.stampede_log = Some(value.to_string()),
            StampedeDefault::SnapshotLog => self.defaults.snapshot_log = Some(value.to_string()),
            StampedeDefault::RequestLog => self.defaults.request_log = Some(value.to_string()),
            _ => return Err(key.wrong_type(value, "&str")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<usize> for Stampede {
    /// Sets [`StampedeDefault`] to a [`usize`] value.
    fn set_default(mut self, key: StampedeDefault, value: usize) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::Users => self.defaults.users = Some(value),
            StampedeDefault::StartupTime => self.defaults.startup_time = Some(value.to_string()),
            StampedeDefault::RunTime => self.defaults.run_time = Some(value.to_string()),
            StampedeDefault::MaxUsers => self.defaults.max_users = Some(value),
            StampedeDefault::Iterations => self.defaults.iterations = Some(value),
            StampedeDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            StampedeDefault::Quiet => self.defaults.quiet = Some(value as u8),
            StampedeDefault::Verbose => self.defaults.verbose = Some(value as u8),
            _ => return Err(key.wrong_type(value, "usize")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<bool> for Stampede {
    /// Sets [`StampedeDefault`] to a [`bool`] value.
    fn set_default(mut self, key: StampedeDefault, value: bool) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            StampedeDefault::NoGzip => self.defaults.no_gzip = Some(value),
            StampedeDefault::AcceptInvalidCerts => self.defaults.accept_invalid_certs = Some(value),
            _ => return Err(key.wrong_type(value, "bool")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<LogFormat> for Stampede {
    /// Sets [`StampedeDefault`] to a [`LogFormat`] value.
    fn set_default(
        mut self,
        key: StampedeDefault,
        value: LogFormat,
    ) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::SnapshotFormat => self.defaults.snapshot_format = Some(value),
            StampedeDefault::RequestFormat => self.defaults.request_format = Some(value),
            _ => return Err(key.wrong_type(value, "LogFormat")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<ConcurrencyProfile> for Stampede {
    /// Sets [`StampedeDefault::Profile`] to a [`ConcurrencyProfile`].
    fn set_default(
        mut self,
        key: StampedeDefault,
        value: ConcurrencyProfile,
    ) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::Profile => {
                value.validate()?;
                self.defaults.profile = Some(value)
            }
            _ => return Err(key.wrong_type(value, "ConcurrencyProfile")),
        }
        Ok(Box::new(self))
    }
}
impl StampedeDefaultType<PauseDistribution> for Stampede {
    /// Sets [`StampedeDefault::Pause`] to a [`PauseDistribution`].
    fn set_default(
        mut self,
        key: StampedeDefault,
        value: PauseDistribution,
    ) -> Result<Box<Self>, StampedeError> {
        match key {
            StampedeDefault::Pause => self.defaults.pause = Some(value),
            _ => return Err(key.wrong_type(value, "PauseDistribution")),
        }
        Ok(Box::new(self))
    }
}

/// Used internally to configure [`StampedeConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct StampedeValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Skip this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait StampedeConfigure<T> {
    /// Return the first value that is set and not filtered.
    fn get_value(&self, values: Vec<StampedeValue<T>>) -> Option<T>;
}

impl<T: fmt::Debug> StampedeConfigure<T> for StampedeConfiguration {
    fn get_value(&self, values: Vec<StampedeValue<T>>) -> Option<T> {
        for value in values {
            if value.filter {
                continue;
            }
            if let Some(v) = value.value {
                if !value.message.is_empty() {
                    info!("{} = {:?}", value.message, v)
                }
                return Some(v);
            }
        }
        None
    }
}

impl StampedeConfiguration {
    /// Implement precedence rules for all [`StampedeConfiguration`] values.
    pub(crate) fn configure(&mut self, defaults: &StampedeDefaults) {
        // Configure `quiet`.
        self.quiet = self
            .get_value(vec![
                // Use --quiet if set.
                StampedeValue {
                    value: Some(self.quiet),
                    filter: self.quiet == 0,
                    message: "",
                },
                // Otherwise use StampedeDefault if set.
                StampedeValue {
                    value: defaults.quiet,
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.verbose),
                    filter: self.verbose == 0,
                    message: "",
                },
                StampedeValue {
                    value: defaults.verbose,
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.log_level),
                    filter: self.log_level == 0,
                    message: "",
                },
                StampedeValue {
                    value: defaults.log_level,
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `stampede_log`.
        self.stampede_log = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.stampede_log.to_string()),
                    filter: self.stampede_log.is_empty(),
                    message: "",
                },
                StampedeValue {
                    value: defaults.stampede_log.clone(),
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or_default();

        // Initialize the logger before anything else is configured so the rest is logged.
        self.initialize_logger();

        // Configure `host`.
        self.host = self
            .get_value(vec![
                // Use --host if set.
                StampedeValue {
                    value: Some(self.host.to_string()),
                    filter: self.host.is_empty(),
                    message: "host",
                },
                // Otherwise use StampedeDefault if set.
                StampedeValue {
                    value: defaults.host.clone(),
                    filter: false,
                    message: "host",
                },
            ])
            .unwrap_or_default();

        // Configure `path`.
        self.path = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.path.to_string()),
                    filter: self.path.is_empty(),
                    message: "path",
                },
                StampedeValue {
                    value: defaults.path.clone(),
                    filter: false,
                    message: "path",
                },
            ])
            .unwrap_or_else(|| "/".to_string());

        // Configure `profile` before `users` so users doesn't get assigned a default
        // when using a profile.
        self.profile = self.get_value(vec![
            StampedeValue {
                value: self.profile.clone(),
                filter: self.profile.is_none(),
                message: "profile",
            },
            StampedeValue {
                value: defaults.profile.clone(),
                filter: false,
                message: "profile",
            },
        ]);

        // Determine how many CPUs are available.
        let default_users = match std::thread::available_parallelism() {
            Ok(ap) => Some(ap.get()),
            Err(e) => {
                info!("failed to detect available_parallelism: {}", e);
                Some(1)
            }
        };

        // Configure `users`.
        self.users = self.get_value(vec![
            // Use --users if set.
            StampedeValue {
                value: self.users,
                filter: false,
                message: "users",
            },
            // Otherwise use StampedeDefault if set and not using a profile.
            StampedeValue {
                value: defaults.users,
                filter: self.profile.is_some(),
                message: "users",
            },
            // Otherwise use detected number of CPUs if not using a profile.
            StampedeValue {
                value: default_users,
                filter: self.profile.is_some(),
                message: "users defaulted to number of CPUs",
            },
        ]);

        // Configure `startup_time`.
        self.startup_time = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.startup_time.to_string()),
                    filter: self.startup_time.is_empty(),
                    message: "startup_time",
                },
                StampedeValue {
                    value: defaults.startup_time.clone(),
                    filter: false,
                    message: "startup_time",
                },
            ])
            .unwrap_or_default();

        // Configure `run_time`.
        self.run_time = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.run_time.to_string()),
                    filter: self.run_time.is_empty(),
                    message: "run_time",
                },
                StampedeValue {
                    value: defaults.run_time.clone(),
                    filter: false,
                    message: "run_time",
                },
            ])
            .unwrap_or_default();

        // Configure `max_users`.
        self.max_users = self.get_value(vec![
            StampedeValue {
                value: self.max_users,
                filter: false,
                message: "max_users",
            },
            StampedeValue {
                value: defaults.max_users,
                filter: false,
                message: "max_users",
            },
        ]);

        // Configure `iterations`.
        self.iterations = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.iterations),
                    filter: self.iterations == 0,
                    message: "iterations",
                },
                StampedeValue {
                    value: defaults.iterations,
                    filter: false,
                    message: "iterations",
                },
            ])
            .unwrap_or(0);

        // Configure `pause`.
        self.pause = self.get_value(vec![
            StampedeValue {
                value: self.pause.clone(),
                filter: false,
                message: "pause",
            },
            StampedeValue {
                value: defaults.pause.clone(),
                filter: false,
                message: "pause",
            },
            StampedeValue {
                value: Some(PauseDistribution::default()),
                filter: false,
                message: "",
            },
        ]);

        // Configure `timeout`.
        self.timeout = self.get_value(vec![
            StampedeValue {
                value: self.timeout.clone(),
                filter: false,
                message: "timeout",
            },
            StampedeValue {
                value: defaults.timeout.clone(),
                filter: false,
                message: "timeout",
            },
        ]);

        // Configure `tick`.
        self.tick = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.tick.to_string()),
                    filter: self.tick.is_empty(),
                    message: "tick",
                },
                StampedeValue {
                    value: defaults.tick.clone(),
                    filter: false,
                    message: "tick",
                },
            ])
            .unwrap_or_else(|| DEFAULT_TICK.to_string());

        // Configure `snapshot_interval`.
        self.snapshot_interval = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.snapshot_interval.to_string()),
                    filter: self.snapshot_interval.is_empty(),
                    message: "snapshot_interval",
                },
                StampedeValue {
                    value: defaults.snapshot_interval.clone(),
                    filter: false,
                    message: "snapshot_interval",
                },
            ])
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_INTERVAL.to_string());

        // Configure boolean flags: the command line can only turn them on.
        let flag = |cli: bool, default: Option<bool>| cli || default.unwrap_or(false);
        self.no_print_metrics = flag(self.no_print_metrics, defaults.no_print_metrics);
        self.no_gzip = flag(self.no_gzip, defaults.no_gzip);
        self.accept_invalid_certs = flag(self.accept_invalid_certs, defaults.accept_invalid_certs);

        // Configure log files and their formats.
        self.configure_logs(defaults);
    }

    fn configure_logs(&mut self, defaults: &StampedeDefaults) {
        self.snapshot_log = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.snapshot_log.to_string()),
                    filter: self.snapshot_log.is_empty(),
                    message: "snapshot_log",
                },
                StampedeValue {
                    value: defaults.snapshot_log.clone(),
                    filter: false,
                    message: "snapshot_log",
                },
            ])
            .unwrap_or_default();
        self.snapshot_format = self.get_value(vec![
            StampedeValue {
                value: self.snapshot_format,
                filter: false,
                message: "snapshot_format",
            },
            StampedeValue {
                value: defaults.snapshot_format,
                filter: false,
                message: "snapshot_format",
            },
        ]);

        self.request_log = self
            .get_value(vec![
                StampedeValue {
                    value: Some(self.request_log.to_string()),
                    filter: self.request_log.is_empty(),
                    message: "request_log",
                },
                StampedeValue {
                    value: defaults.request_log.clone(),
                    filter: false,
                    message: "request_log",
                },
            ])
            .unwrap_or_default();
        self.request_format = self.get_value(vec![
            StampedeValue {
                value: self.request_format,
                filter: false,
                message: "request_format",
            },
            StampedeValue {
                value: defaults.request_format,
                filter: false,
                message: "request_format",
            },
        ]);
    }

    /// Validate that all options are sane and don't conflict. Always invoked after
    /// [`StampedeConfiguration::configure`], before any user is launched.
    pub(crate) fn validate(&self) -> Result<(), StampedeError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // A host is required, and must be a valid URL.
        if self.host.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.host`".to_string(),
                value: "".to_string(),
                detail: "A host must be defined via the --host option or the StampedeDefault::Host default.".to_string(),
            });
        }
        util::is_valid_host(&self.host)?;

        // Can't combine --users with --profile.
        if self.profile.is_some() {
            if let Some(users) = self.users {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` can not be set together with `configuration.profile`.".to_string(),
                });
            }
            if !self.startup_time.is_empty() {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.startup_time`".to_string(),
                    value: self.startup_time.to_string(),
                    detail: "`configuration.startup_time` can not be set together with `configuration.profile`.".to_string(),
                });
            }
        } else if let Some(users) = self.users {
            if users == 0 {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` must be set to at least 1.".to_string(),
                });
            }
        }

        if let Some(max_users) = self.max_users {
            if max_users == 0 {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.max_users`".to_string(),
                    value: max_users.to_string(),
                    detail: "`configuration.max_users` must be set to at least 1.".to_string(),
                });
            }
        }

        // Timespans must parse when set.
        for (option, value) in [
            ("`configuration.startup_time`", &self.startup_time),
            ("`configuration.run_time`", &self.run_time),
        ] {
            if !value.is_empty() && util::parse_timespan(value).is_none() {
                return Err(StampedeError::InvalidOption {
                    option: option.to_string(),
                    value: value.to_string(),
                    detail: format!("{} must be a time span such as 30s, 20m or 1h30m.", option),
                });
            }
        }

        // Intervals must parse and be non-zero.
        for (option, value) in [
            ("`configuration.tick`", &self.tick),
            ("`configuration.snapshot_interval`", &self.snapshot_interval),
        ] {
            match util::parse_timespan(value) {
                Some(interval) if !interval.is_zero() => (),
                _ => {
                    return Err(StampedeError::InvalidOption {
                        option: option.to_string(),
                        value: value.to_string(),
                        detail: format!("{} must be greater than 0.", option),
                    })
                }
            }
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match util::get_float_from_string(Some(timeout.to_string())) {
                // Also rejects values too large for a Duration.
                Some(t) if t > 0.0 && Duration::try_from_secs_f32(t).is_ok() => (),
                _ => {
                    return Err(StampedeError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be greater than 0.".to_string(),
                    })
                }
            }
        }

        // Log formats require a log file.
        if self.snapshot_format.is_some() && self.snapshot_log.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.snapshot_format`".to_string(),
                value: format!("{:?}", self.snapshot_format),
                detail: "`configuration.snapshot_format` can not be set without also setting `configuration.snapshot_log`.".to_string(),
            });
        }
        if self.request_format.is_some() && self.request_log.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.request_format`".to_string(),
                value: format!("{:?}", self.request_format),
                detail: "`configuration.request_format` can not be set without also setting `configuration.request_log`.".to_string(),
            });
        }

        Ok(())
    }

    /// The concurrency profile to follow, from `--profile` or built from `--users`.
    pub(crate) fn concurrency_profile(&self) -> Result<ConcurrencyProfile, StampedeError> {
        if let Some(profile) = self.profile.as_ref() {
            return Ok(profile.clone());
        }
        ConcurrencyProfile::from_users(self)?.ok_or_else(|| StampedeError::InvalidOption {
            option: "`configuration.users`".to_string(),
            value: "".to_string(),
            detail: "Either `configuration.users` or `configuration.profile` must be set.".to_string(),
        })
    }

    /// How often the scheduler adjusts users.
    pub(crate) fn tick(&self) -> Duration {
        util::parse_timespan(&self.tick)
            .or_else(|| util::parse_timespan(DEFAULT_TICK))
            .unwrap_or_default()
    }

    /// How often the metrics collector emits a snapshot.
    pub(crate) fn snapshot_interval(&self) -> Duration {
        util::parse_timespan(&self.snapshot_interval)
            .or_else(|| util::parse_timespan(DEFAULT_SNAPSHOT_INTERVAL))
            .unwrap_or_default()
    }

    /// Upper bound on the load test when using a profile, `None` if unbounded.
    ///
    /// With the `--users` shorthand `--run-time` is already part of the profile.
    pub(crate) fn run_time_limit(&self) -> Option<Duration> {
        if self.profile.is_none() {
            return None;
        }
        util::parse_timespan(&self.run_time).filter(|r| !r.is_zero())
    }

    /// The per-request timeout.
    pub(crate) fn request_timeout(&self) -> Duration {
        util::get_float_from_string(self.timeout.clone())
            .and_then(|seconds| Duration::try_from_secs_f32(seconds).ok())
            .unwrap_or_else(|| Duration::from_secs_f32(DEFAULT_TIMEOUT))
    }

    /// Configure the logger: a SimpleLogger to stdout, and optionally a WriteLogger
    /// to the `--stampede-log` file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure Stampede log level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];

        // Open the log file if configured.
        let stampede_log: Option<PathBuf> = if !self.stampede_log.is_empty() {
            Some(PathBuf::from(&self.stampede_log))
        } else {
            None
        };
        if let Some(log_to_file) = stampede_log.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }

        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }
        if let Some(log_to_file) = stampede_log {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn configuration(args: &[&str]) -> StampedeConfiguration {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        StampedeConfiguration::parse_args_default(&args).unwrap()
    }

    #[test]
    fn set_defaults() {
        let stampede = Stampede::initialize_with_config(StampedeConfiguration::default())
            .unwrap()
            .set_default(StampedeDefault::Host, "http://example.com/")
            .unwrap()
            .set_default(StampedeDefault::Path, "/api")
            .unwrap()
            .set_default(StampedeDefault::Users, 10)
            .unwrap()
            .set_default(StampedeDefault::RunTime, 10)
            .unwrap()
            .set_default(StampedeDefault::StartupTime, "5s")
            .unwrap()
            .set_default(StampedeDefault::MaxUsers, 20)
            .unwrap()
            .set_default(StampedeDefault::Iterations, 3)
            .unwrap()
            .set_default(StampedeDefault::Pause, "constant:10ms")
            .unwrap()
            .set_default(StampedeDefault::Timeout, "45")
            .unwrap()
            .set_default(StampedeDefault::Tick, "50ms")
            .unwrap()
            .set_default(StampedeDefault::SnapshotInterval, "2s")
            .unwrap()
            .set_default(StampedeDefault::LogLevel, 1)
            .unwrap()
            .set_default(StampedeDefault::StampedeLog, "custom-stampede.log")
            .unwrap()
            .set_default(StampedeDefault::Quiet, 1)
            .unwrap()
            .set_default(StampedeDefault::NoPrintMetrics, true)
            .unwrap()
            .set_default(StampedeDefault::SnapshotLog, "custom-snapshots.log")
            .unwrap()
            .set_default(StampedeDefault::SnapshotFormat, LogFormat::Csv)
            .unwrap()
            .set_default(StampedeDefault::RequestLog, "custom-requests.log")
            .unwrap()
            .set_default(StampedeDefault::RequestFormat, LogFormat::Raw)
            .unwrap()
            .set_default(StampedeDefault::NoGzip, true)
            .unwrap()
            .set_default(StampedeDefault::AcceptInvalidCerts, true)
            .unwrap();

        assert_eq!(stampede.defaults.host, Some("http://example.com/".to_string()));
        assert_eq!(stampede.defaults.path, Some("/api".to_string()));
        assert_eq!(stampede.defaults.users, Some(10));
        assert_eq!(stampede.defaults.run_time, Some("10".to_string()));
        assert_eq!(stampede.defaults.startup_time, Some("5s".to_string()));
        assert_eq!(stampede.defaults.max_users, Some(20));
        assert_eq!(stampede.defaults.iterations, Some(3));
        assert_eq!(
            stampede.defaults.pause,
            Some(PauseDistribution::Constant(Duration::from_millis(10)))
        );
        assert_eq!(stampede.defaults.timeout, Some("45".to_string()));
        assert_eq!(stampede.defaults.tick, Some("50ms".to_string()));
        assert_eq!(stampede.defaults.snapshot_interval, Some("2s".to_string()));
        assert_eq!(stampede.defaults.log_level, Some(1));
        assert_eq!(
            stampede.defaults.stampede_log,
            Some("custom-stampede.log".to_string())
        );
        assert_eq!(stampede.defaults.quiet, Some(1));
        assert_eq!(stampede.defaults.no_print_metrics, Some(true));
        assert_eq!(
            stampede.defaults.snapshot_log,
            Some("custom-snapshots.log".to_string())
        );
        assert_eq!(stampede.defaults.snapshot_format, Some(LogFormat::Csv));
        assert_eq!(
            stampede.defaults.request_log,
            Some("custom-requests.log".to_string())
        );
        assert_eq!(stampede.defaults.request_format, Some(LogFormat::Raw));
        assert_eq!(stampede.defaults.no_gzip, Some(true));
        assert_eq!(stampede.defaults.accept_invalid_certs, Some(true));
    }

    #[test]
    fn wrong_default_types() {
        let stampede = Stampede::initialize_with_config(StampedeConfiguration::default()).unwrap();
        match stampede.set_default(StampedeDefault::Users, "10") {
            Err(StampedeError::InvalidOption { option, detail, .. }) => {
                assert_eq!(option, "StampedeDefault::Users");
                assert!(detail.contains("expected usize value, received &str"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let stampede = Stampede::initialize_with_config(StampedeConfiguration::default()).unwrap();
        assert!(stampede.set_default(StampedeDefault::Host, true).is_err());

        let stampede = Stampede::initialize_with_config(StampedeConfiguration::default()).unwrap();
        assert!(stampede
            .set_default(StampedeDefault::Profile, "30s,1;10s,0")
            .is_err());
    }

    #[test]
    fn precedence() {
        let defaults = StampedeDefaults {
            host: Some("http://default.example.com".to_string()),
            users: Some(4),
            tick: Some("250ms".to_string()),
            max_users: Some(3),
            ..Default::default()
        };

        // Defaults fill in what the command line didn't set.
        let mut config = configuration(&[]);
        config.configure(&defaults);
        assert_eq!(config.host, "http://default.example.com");
        assert_eq!(config.path, "/");
        assert_eq!(config.users, Some(4));
        assert_eq!(config.max_users, Some(3));
        assert_eq!(config.tick(), Duration::from_millis(250));
        assert_eq!(config.snapshot_interval(), Duration::from_secs(1));
        assert_eq!(config.pause, Some(PauseDistribution::default()));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));

        // The command line wins.
        let mut config = configuration(&[
            "--host",
            "http://cli.example.com",
            "--users",
            "2",
            "--tick",
            "1s",
            "--pause",
            "none",
            "--timeout",
            "1.5",
        ]);
        config.configure(&defaults);
        assert_eq!(config.host, "http://cli.example.com");
        assert_eq!(config.users, Some(2));
        assert_eq!(config.tick(), Duration::from_secs(1));
        assert_eq!(config.pause, Some(PauseDistribution::None));
        assert_eq!(config.request_timeout(), Duration::from_millis(1_500));

        // A profile suppresses the users default.
        let mut config = configuration(&["--profile", "0,1;1s,0"]);
        config.configure(&defaults);
        assert_eq!(config.users, None);
        assert_eq!(config.concurrency_profile().unwrap().peak_users(), 1);
    }

    #[test]
    fn validation() {
        let valid = |args: &[&str]| {
            let mut config = configuration(args);
            config.configure(&StampedeDefaults::default());
            config.validate()
        };
        let invalid_option = |args: &[&str]| match valid(args) {
            Err(StampedeError::InvalidOption { option, .. }) => option,
            other => panic!("unexpected result for {:?}: {:?}", args, other),
        };

        assert!(valid(&["--host", "http://localhost", "--users", "1"]).is_ok());
        assert!(valid(&["--host", "http://localhost", "--profile", "0,1", "-t", "1s"]).is_ok());

        assert_eq!(invalid_option(&["--users", "1"]), "`configuration.host`");
        assert!(matches!(
            valid(&["--host", "localhost"]),
            Err(StampedeError::InvalidHost { .. })
        ));
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "-v", "-q"]),
            "`configuration.verbose`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--users", "0"]),
            "`configuration.users`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--users", "2", "--profile", "0,1"]),
            "`configuration.users`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--max-users", "0"]),
            "`configuration.max_users`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--snapshot-interval", "0"]),
            "`configuration.snapshot_interval`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--tick", "soon"]),
            "`configuration.tick`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--timeout", "0"]),
            "`configuration.timeout`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--timeout", "1e30"]),
            "`configuration.timeout`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--run-time", "1e30"]),
            "`configuration.run_time`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--tick", "9999999999999999999h"]),
            "`configuration.tick`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--run-time", "later"]),
            "`configuration.run_time`"
        );
        assert_eq!(
            invalid_option(&["-H", "http://localhost", "--request-format", "csv"]),
            "`configuration.request_format`"
        );
    }

    #[test]
    fn parse_errors() {
        let args: Vec<String> = vec!["--profile".to_string(), "10s;5".to_string()];
        assert!(StampedeConfiguration::parse_args_default(&args).is_err());

        let args: Vec<String> = vec!["--pause".to_string(), "uniform:1s..0".to_string()];
        assert!(StampedeConfiguration::parse_args_default(&args).is_err());

        let args: Vec<String> = vec!["--snapshot-format".to_string(), "xml".to_string()];
        assert!(StampedeConfiguration::parse_args_default(&args).is_err());

        // Time spans too large for a Duration.
        let args: Vec<String> = vec!["--profile".to_string(), "1e30,5".to_string()];
        assert!(StampedeConfiguration::parse_args_default(&args).is_err());

        let args: Vec<String> = vec!["--pause".to_string(), "constant:1e30".to_string()];
        assert!(StampedeConfiguration::parse_args_default(&args).is_err());
    }

    #[test]
    fn run_time_limit() {
        let mut config = configuration(&["-H", "http://localhost", "--users", "2", "-t", "10s"]);
        config.configure(&StampedeDefaults::default());
        // The shorthand puts the run time in the profile itself.
        assert_eq!(config.run_time_limit(), None);
        assert_eq!(
            config.concurrency_profile().unwrap().end(),
            Duration::from_secs(10)
        );

        let mut config = configuration(&["-H", "http://localhost", "--profile", "0,2", "-t", "10s"]);
        config.configure(&StampedeDefaults::default());
        assert_eq!(config.run_time_limit(), Some(Duration::from_secs(10)));

        // Each option is valid, but together they overflow.
        let mut config = configuration(&[
            "-H",
            "http://localhost",
            "--users",
            "2",
            "-s",
            "18446744073709551615s",
            "-t",
            "1s",
        ]);
        config.configure(&StampedeDefaults::default());
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.concurrency_profile(),
            Err(StampedeError::InvalidOption { .. })
        ));

        // An invalid timeout falls back to the default rather than panicking.
        config.timeout = Some("1e30".to_string());
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }
}
