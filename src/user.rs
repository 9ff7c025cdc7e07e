//! Virtual users and the runner loop that drives them.
//!
//! Each [`VirtualUser`] runs in its own tokio task, repeatedly invoking the
//! registered [`Iteration`] and pausing between iterations. A runner moves through
//! the [`UserState`] machine `Starting -> Running -> Stopping -> Stopped`, checking
//! for a [`UserCommand::Exit`] at every iteration boundary and while pausing.
//! In-flight requests are never interrupted.

use rand::Rng;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::logger::{LoggerTx, StampedeLog};
use crate::metrics::{CollectorMessage, OutcomeStatus, RequestOutcome};
use crate::util;
use crate::StampedeError;

/// The result of one invocation of an [`Iteration`].
pub type IterationResult = Result<(), Box<IterationError>>;

/// The function invoked by a [`VirtualUser`] once per iteration.
pub type IterationFunction = Arc<
    dyn for<'r> Fn(&'r VirtualUser) -> Pin<Box<dyn Future<Output = IterationResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// iteration!(foo) expands to Iteration::new("foo", Arc::new(move |s| Box::pin(foo(s)))).
#[macro_export]
macro_rules! iteration {
    ($iteration_func:ident) => {
        $crate::user::Iteration::new(
            stringify!($iteration_func),
            std::sync::Arc::new(move |s| std::boxed::Box::pin($iteration_func(s))),
        )
    };
}

/// A named iteration function.
#[derive(Clone)]
pub struct Iteration {
    /// A name used in log messages.
    pub name: String,
    pub(crate) function: IterationFunction,
}
impl Iteration {
    pub fn new(name: &str, function: IterationFunction) -> Self {
        trace!("new iteration: {}", name);
        Iteration {
            name: name.to_string(),
            function,
        }
    }
}
impl fmt::Debug for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iteration")
            .field("name", &self.name)
            .finish()
    }
}

/// Errors an iteration can return.
///
/// Errors never stop a virtual user. Request failures have already been recorded as
/// outcomes by the time they are returned.
#[derive(Debug)]
pub enum IterationError {
    /// The request failed before a response was received.
    Reqwest(reqwest::Error),
    /// The server responded with a non-2xx status code.
    Status(u16),
    /// Failed to build a URL from the configured host and a path.
    Url(url::ParseError),
    /// Any other failure, described by the iteration itself.
    Custom(String),
}
impl fmt::Display for IterationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IterationError::Reqwest(source) => write!(f, "IterationError: request failed ({})", source),
            IterationError::Status(status) => {
                write!(f, "IterationError: unexpected status code ({})", status)
            }
            IterationError::Url(source) => write!(f, "IterationError: invalid url ({})", source),
            IterationError::Custom(detail) => write!(f, "IterationError: {}", detail),
        }
    }
}
impl std::error::Error for IterationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IterationError::Reqwest(source) => Some(source),
            IterationError::Url(source) => Some(source),
            _ => None,
        }
    }
}
impl From<reqwest::Error> for Box<IterationError> {
    fn from(err: reqwest::Error) -> Box<IterationError> {
        Box::new(IterationError::Reqwest(err))
    }
}
impl From<url::ParseError> for Box<IterationError> {
    fn from(err: url::ParseError) -> Box<IterationError> {
        Box::new(IterationError::Url(err))
    }
}

/// How long a virtual user pauses after each iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseDistribution {
    /// Never pause.
    None,
    /// Always pause for the same duration.
    Constant(Duration),
    /// Pause for a duration drawn uniformly from `[min, max)`.
    Uniform { min: Duration, max: Duration },
}
impl Default for PauseDistribution {
    fn default() -> Self {
        PauseDistribution::Uniform {
            min: Duration::from_millis(0),
            max: Duration::from_millis(100),
        }
    }
}
impl PauseDistribution {
    /// Draw one pause from the distribution.
    pub fn sample(&self) -> Duration {
        match self {
            PauseDistribution::None => Duration::from_millis(0),
            PauseDistribution::Constant(pause) => *pause,
            PauseDistribution::Uniform { min, max } => {
                let min = min.as_micros() as u64;
                let max = max.as_micros() as u64;
                if max <= min {
                    Duration::from_micros(min)
                } else {
                    Duration::from_micros(rand::rng().random_range(min..max))
                }
            }
        }
    }

    /// The longest pause this distribution can produce.
    pub fn max(&self) -> Duration {
        match self {
            PauseDistribution::None => Duration::from_millis(0),
            PauseDistribution::Constant(pause) => *pause,
            PauseDistribution::Uniform { max, .. } => *max,
        }
    }
}

/// Implement [`FromStr`] so the pause can be configured from the command line.
///
/// Accepted formats: `none`, `constant:250ms`, `uniform:0..100ms`, or a bare timespan
/// such as `100ms` meaning uniform from zero to that value.
impl FromStr for PauseDistribution {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| StampedeError::InvalidOption {
            option: "`configuration.pause`".to_string(),
            value: s.to_string(),
            detail: detail.to_string(),
        };
        let value = s.trim().to_lowercase();

        if value == "none" {
            return Ok(PauseDistribution::None);
        }
        if let Some(constant) = value.strip_prefix("constant:") {
            return util::parse_timespan(constant)
                .map(PauseDistribution::Constant)
                .ok_or_else(|| invalid("Expected format: constant:{timespan}."));
        }
        if let Some(range) = value.strip_prefix("uniform:") {
            let (min, max) = range
                .split_once("..")
                .ok_or_else(|| invalid("Expected format: uniform:{min}..{max}."))?;
            let min = util::parse_timespan(min)
                .ok_or_else(|| invalid("Invalid minimum pause."))?;
            let max = util::parse_timespan(max)
                .ok_or_else(|| invalid("Invalid maximum pause."))?;
            if min > max {
                return Err(invalid("The minimum pause can not be larger than the maximum."));
            }
            return Ok(PauseDistribution::Uniform { min, max });
        }
        util::parse_timespan(&value)
            .map(|max| PauseDistribution::Uniform {
                min: Duration::from_millis(0),
                max,
            })
            .ok_or_else(|| invalid("Expected none, constant:{timespan}, uniform:{min}..{max} or {timespan}."))
    }
}

/// Commands sent from the scheduler to a running virtual user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Finish the current iteration, then exit.
    Exit,
}

/// Lifecycle of a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum UserState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Returned by a virtual user's task once it has stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    /// The user's sequence number.
    pub id: usize,
    /// How many iterations completed.
    pub iterations: usize,
    /// The state the user finished in, always [`UserState::Stopped`].
    pub state: UserState,
}

/// One simulated client.
///
/// A virtual user owns its own HTTP client and shares no state with other users:
/// every request it makes is reported to the metrics collector over a channel.
pub struct VirtualUser {
    /// Sequence number, starting at 1, never reused during a load test.
    pub id: usize,
    /// Requests are relative to this URL.
    pub base_url: Url,
    /// The path requested by the built-in [`http_get`] iteration.
    pub path: String,
    /// The HTTP client used for every request.
    pub client: Client,
    /// When the load test started, used to timestamp outcomes.
    pub(crate) started: Instant,
    /// Channel to the metrics collector.
    pub(crate) metrics: Option<flume::Sender<CollectorMessage>>,
    /// Channel to the logger task, if a request log is enabled.
    pub(crate) logger: LoggerTx,
}

impl VirtualUser {
    /// Create a user that isn't attached to a collector, mainly useful in tests.
    pub fn new(id: usize, base_url: Url, client: Client) -> Self {
        VirtualUser {
            id,
            base_url,
            path: "/".to_string(),
            client,
            started: Instant::now(),
            metrics: None,
            logger: None,
        }
    }

    /// Build an absolute URL from a path relative to the configured host.
    ///
    /// If `path` already includes a host it is used as is.
    pub fn build_url(&self, path: &str) -> Result<Url, url::ParseError> {
        if let Ok(url) = Url::parse(path) {
            if url.host().is_some() {
                return Ok(url);
            }
        }
        self.base_url.join(path)
    }

    /// Prepare a `GET` request of a path, for when headers or a timeout need to be
    /// changed before calling [`VirtualUser::send`].
    pub fn get_request_builder(&self, path: &str) -> Result<RequestBuilder, Box<IterationError>> {
        let url = self.build_url(path)?;
        Ok(self.client.get(url))
    }

    /// Make a `GET` request of a path and record its outcome.
    ///
    /// Returns an error for transport failures and non-2xx responses, both of which
    /// have already been recorded.
    pub async fn get(&self, path: &str) -> Result<Response, Box<IterationError>> {
        let request_builder = self.get_request_builder(path)?;
        self.send(request_builder).await
    }

    /// Send a request and record its outcome.
    pub async fn send(&self, request_builder: RequestBuilder) -> Result<Response, Box<IterationError>> {
        let request = request_builder.build()?;
        let url = request.url().to_string();

        let elapsed = self.started.elapsed();
        let started = Instant::now();
        let response = self.client.execute(request).await;
        let response_time = started.elapsed();

        let status = OutcomeStatus::from_response(&response);
        match &response {
            Ok(r) => debug!("user {}: {} returned {}", self.id, url, r.status()),
            Err(e) => debug!("user {}: {} failed: {}", self.id, url, e),
        }
        self.record(RequestOutcome::new(
            elapsed,
            self.id,
            url,
            response_time,
            status,
        ));

        let response = response?;
        if status.is_success() {
            Ok(response)
        } else {
            Err(Box::new(IterationError::Status(response.status().as_u16())))
        }
    }

    /// Hand an outcome to the request log and the metrics collector.
    fn record(&self, outcome: RequestOutcome) {
        if let Some(logger) = self.logger.as_ref() {
            if let Err(e) = logger.send(Some(StampedeLog::Request(outcome.clone()))) {
                debug!("user {}: failed to send outcome to logger: {}", self.id, e);
            }
        }
        if let Some(metrics) = self.metrics.as_ref() {
            if let Err(e) = metrics.send(CollectorMessage::Outcome(outcome)) {
                warn!("user {}: metrics collector is gone: {}", self.id, e);
            }
        }
    }
}

/// The built-in iteration: one `GET` of the configured path.
pub async fn http_get(user: &VirtualUser) -> IterationResult {
    let _response = user.get(&user.path).await?;
    Ok(())
}

/// Run a virtual user until told to stop, or until `iterations` have completed if
/// non-zero.
pub(crate) async fn user_main(
    user: VirtualUser,
    iteration: Iteration,
    pause: PauseDistribution,
    iterations: usize,
    receiver: flume::Receiver<UserCommand>,
) -> UserSummary {
    let mut state = UserState::Starting;
    let mut completed: usize = 0;

    loop {
        state = match state {
            UserState::Starting => {
                info!("launching user {} running {}...", user.id, iteration.name);
                if received_exit(&receiver) {
                    UserState::Stopping
                } else {
                    UserState::Running
                }
            }
            UserState::Running => {
                if let Err(e) = (iteration.function)(&user).await {
                    debug!("user {}: {} failed: {}", user.id, iteration.name, e);
                }
                completed += 1;

                if iterations > 0 && completed >= iterations {
                    debug!("user {}: completed {} iterations", user.id, completed);
                    UserState::Stopping
                } else if received_exit(&receiver) || pause_or_exit(&user, &pause, &receiver).await {
                    UserState::Stopping
                } else {
                    UserState::Running
                }
            }
            UserState::Stopping => {
                info!("exiting user {} running {}...", user.id, iteration.name);
                UserState::Stopped
            }
            UserState::Stopped => break,
        };
        trace!("user {}: {}", user.id, state);
    }

    UserSummary {
        id: user.id,
        iterations: completed,
        state,
    }
}

// Determine if the scheduler has sent a UserCommand::Exit message, or went away.
fn received_exit(receiver: &flume::Receiver<UserCommand>) -> bool {
    match receiver.try_recv() {
        Ok(UserCommand::Exit) => true,
        Err(flume::TryRecvError::Empty) => false,
        Err(flume::TryRecvError::Disconnected) => true,
    }
}

// Pause between iterations, returning true if told to exit while pausing.
async fn pause_or_exit(
    user: &VirtualUser,
    pause: &PauseDistribution,
    receiver: &flume::Receiver<UserCommand>,
) -> bool {
    let pause = pause.sample();
    if pause.is_zero() {
        return false;
    }
    trace!("user {} pausing {:?}...", user.id, pause);
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = receiver.recv_async() => true,
    }
}
