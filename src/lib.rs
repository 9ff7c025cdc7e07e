//! # Stampede
//!
//! Stampede is a small load generation engine written in Rust. It runs an iteration
//! function across a pool of concurrent virtual users whose size follows a
//! time-indexed concurrency profile, and aggregates the outcome of every request
//! into periodic metrics snapshots.
//!
//! The built-in iteration requests a single path and then pauses for a random
//! duration, as a k6 style script might:
//!
//! ```js
//! export default function () {
//!   http.get('http://localhost:3000/api');
//!   sleep(0.1 * Math.random());
//! }
//! ```
//!
//! The same load test with the `stampede` binary:
//!
//! ```bash
//! stampede --host http://localhost:3000 --path /api --profile "0,10;30s,10;30s,0"
//! ```
//!
//! ## Writing iterations
//!
//! An iteration is an async function taking a [`VirtualUser`](user/struct.VirtualUser.html)
//! and returning an [`IterationResult`](user/type.IterationResult.html). Requests
//! made through the user are timed and reported to the metrics collector.
//!
//! ```rust,no_run
//! use stampede::prelude::*;
//!
//! fn main() -> Result<(), StampedeError> {
//!     let metrics = Stampede::initialize()?
//!         .register_iteration(iteration!(load_api))
//!         .set_default(StampedeDefault::Host, "http://localhost:3000")?
//!         .set_default(StampedeDefault::Profile, "0,10;30s,10;30s,0")?
//!         .execute()?;
//!     metrics.print();
//!
//!     Ok(())
//! }
//!
//! async fn load_api(user: &VirtualUser) -> IterationResult {
//!     let _response = user.get("/api").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency profiles
//!
//! A profile is a list of `{elapsed},{users}` steps: `"0,10;30s,10;30s,0"` starts
//! ten users immediately, holds them for thirty seconds, then stops them all. The
//! target is interpolated linearly between steps, so `"1m,100"` ramps up to one
//! hundred users over a minute. `--users`, `--startup-time` and `--run-time` build
//! the same kind of profile.
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0.

#[macro_use]
extern crate log;

mod client;
pub mod config;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod profile;
mod scheduler;
pub mod user;
pub mod util;

use gumdrop::Options;
use std::{fmt, io};

use crate::config::{StampedeConfiguration, StampedeDefaults};
use crate::metrics::StampedeMetrics;
use crate::scheduler::Scheduler;
use crate::user::Iteration;

/// An enumeration of all errors a [`Stampede`](./struct.Stampede.html) can return.
#[derive(Debug)]
pub enum StampedeError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`Stampede`](./struct.Stampede.html) has no [`Iteration`](./user/struct.Iteration.html) registered.
    NoIteration {
        /// An optional explanation of the error.
        detail: String,
    },
    /// The metrics collector or a virtual user failed, ending the load test.
    Internal {
        /// An explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl StampedeError {
    fn describe(&self) -> &str {
        match *self {
            StampedeError::Io(_) => "io::Error",
            StampedeError::Reqwest(_) => "reqwest::Error",
            StampedeError::TokioJoin(_) => "tokio::task::JoinError",
            StampedeError::InvalidHost { .. } => "failed to parse hostname",
            StampedeError::InvalidOption { .. } => "invalid option or value specified",
            StampedeError::NoIteration { .. } => "no iteration registered",
            StampedeError::Internal { .. } => "internal failure",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for StampedeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StampedeError::Io(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Reqwest(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::TokioJoin(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::InvalidHost {
                ref host,
                ref parse_error,
                ..
            } => write!(
                f,
                "StampedeError: {} {} ({})",
                self.describe(),
                host,
                parse_error
            ),
            StampedeError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "StampedeError: {} {}={:?}: {}",
                self.describe(),
                option,
                value,
                detail
            ),
            StampedeError::NoIteration { ref detail } | StampedeError::Internal { ref detail } => {
                write!(f, "StampedeError: {}: {}", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for StampedeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StampedeError::Io(ref source) => Some(source),
            StampedeError::Reqwest(ref source) => Some(source),
            StampedeError::TokioJoin(ref source) => Some(source),
            StampedeError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for StampedeError {
    fn from(err: reqwest::Error) -> StampedeError {
        StampedeError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for StampedeError {
    fn from(err: io::Error) -> StampedeError {
        StampedeError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for StampedeError {
    fn from(err: tokio::task::JoinError) -> StampedeError {
        StampedeError::TokioJoin(err)
    }
}

/// A load test: an iteration, a configuration, and any programmatic defaults.
pub struct Stampede {
    /// The iteration every virtual user runs.
    iteration: Option<Iteration>,
    /// Custom defaults set with [`StampedeDefaultType::set_default`](config/trait.StampedeDefaultType.html).
    pub(crate) defaults: StampedeDefaults,
    /// Configuration from the command line, or provided to `initialize_with_config`.
    pub(crate) configuration: StampedeConfiguration,
}

impl Stampede {
    /// Load configuration from the command line and initialize a [`Stampede`].
    ///
    /// # Example
    /// ```rust,no_run
    /// use stampede::prelude::*;
    ///
    /// let stampede = Stampede::initialize();
    /// ```
    pub fn initialize() -> Result<Stampede, StampedeError> {
        Stampede::initialize_with_config(StampedeConfiguration::parse_args_default_or_exit())
    }

    /// Initialize a [`Stampede`] with an already loaded configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// let stampede = Stampede::initialize_with_config(StampedeConfiguration::default());
    /// ```
    pub fn initialize_with_config(
        configuration: StampedeConfiguration,
    ) -> Result<Stampede, StampedeError> {
        Ok(Stampede {
            iteration: None,
            defaults: StampedeDefaults::default(),
            configuration,
        })
    }

    /// Register the iteration every virtual user runs. Registering again replaces
    /// the previous iteration.
    ///
    /// # Example
    /// ```rust
    /// use stampede::prelude::*;
    ///
    /// let stampede = Stampede::initialize_with_config(StampedeConfiguration::default())
    ///     .unwrap()
    ///     .register_iteration(iteration!(http_get));
    /// ```
    pub fn register_iteration(mut self, iteration: Iteration) -> Self {
        if let Some(previous) = self.iteration.as_ref() {
            debug!("replacing iteration {} with {}", previous.name, iteration.name);
        }
        self.iteration = Some(iteration);
        self
    }

    /// Execute the load test, blocking until it completes.
    ///
    /// Configuration errors are returned before any virtual user is launched.
    /// Failed requests never cause an error: they are counted in the returned
    /// metrics.
    pub fn execute(mut self) -> Result<StampedeMetrics, StampedeError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // An iteration is required.
        let iteration = match self.iteration.take() {
            Some(iteration) => iteration,
            None => {
                return Err(StampedeError::NoIteration {
                    detail: "No iteration is registered.".to_string(),
                })
            }
        };

        // Configure and validate StampedeConfiguration.
        self.configuration.configure(&self.defaults);
        self.configuration.validate()?;
        let profile = self.configuration.concurrency_profile()?;
        let scheduler = Scheduler::new(self.configuration, profile, iteration)?;

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(scheduler.run())
    }
}
