//! Concurrency profile structures and functions.
//!
//! Internally, Stampede represents every load test as a concurrency profile: an
//! ordered series of `(elapsed, users)` steps describing how many
//! [`VirtualUser`](../user/struct.VirtualUser.html)s should be active at any moment.
//!
//! Between two steps the target is linearly interpolated. Two consecutive steps
//! sharing a timestamp describe an instantaneous change. Before the first step the
//! target ramps up from zero, and after the last step the final target holds.

use chrono::prelude::*;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::StampedeConfiguration;
use crate::util;
use crate::StampedeError;

lazy_static! {
    static ref PROFILE_STEP: Regex = Regex::new(r"^\s*([^,\s]+)\s*,\s*(\d+)\s*$")
        .expect("profile step regex is valid");
}

/// A single profile entry: `users` should be active once `at` has elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStep {
    /// Time elapsed since the start of the load test.
    pub at: Duration,
    /// Target number of concurrently active users.
    pub users: usize,
}

/// Time-indexed target for how many virtual users should be active.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyProfile {
    pub(crate) steps: Vec<ProfileStep>,
}

impl ConcurrencyProfile {
    /// Build a profile from `(elapsed, users)` pairs, validating the ordering.
    ///
    /// # Example
    /// ```rust
    /// use std::time::Duration;
    /// use stampede::profile::ConcurrencyProfile;
    ///
    /// let profile = ConcurrencyProfile::new(vec![
    ///     (Duration::from_secs(0), 10),
    ///     (Duration::from_secs(30), 10),
    ///     (Duration::from_secs(30), 0),
    /// ])
    /// .unwrap();
    /// assert_eq!(profile.target_at(Duration::from_secs(15)), 10);
    /// assert_eq!(profile.target_at(Duration::from_secs(30)), 0);
    /// ```
    pub fn new(steps: Vec<(Duration, usize)>) -> Result<Self, StampedeError> {
        let profile = ConcurrencyProfile {
            steps: steps
                .into_iter()
                .map(|(at, users)| ProfileStep { at, users })
                .collect(),
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Build a profile from the `--users`, `--startup-time` and `--run-time` options.
    ///
    /// Returns `None` if `--users` isn't set.
    pub(crate) fn from_users(
        configuration: &StampedeConfiguration,
    ) -> Result<Option<Self>, StampedeError> {
        let users = match configuration.users {
            Some(users) => users,
            None => return Ok(None),
        };
        let startup_time = util::parse_timespan(&configuration.startup_time).unwrap_or_default();
        let mut steps = vec![ProfileStep {
            at: startup_time,
            users,
        }];

        // Maintain the configured number of users for the configured run-time, then stop.
        if let Some(run_time) = util::parse_timespan(&configuration.run_time) {
            if !run_time.is_zero() {
                let stop_at = startup_time.checked_add(run_time).ok_or_else(|| {
                    StampedeError::InvalidOption {
                        option: "`configuration.run_time`".to_string(),
                        value: configuration.run_time.to_string(),
                        detail: "`configuration.startup_time` plus `configuration.run_time` is too long."
                            .to_string(),
                    }
                })?;
                steps.push(ProfileStep { at: stop_at, users });
                steps.push(ProfileStep {
                    at: stop_at,
                    users: 0,
                });
            }
        }

        Ok(Some(ConcurrencyProfile { steps }))
    }

    /// Confirm the profile is usable: at least one step, and timestamps never go
    /// backwards.
    pub(crate) fn validate(&self) -> Result<(), StampedeError> {
        if self.steps.is_empty() {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.profile`".to_string(),
                value: "".to_string(),
                detail: "A concurrency profile requires at least one step.".to_string(),
            });
        }
        for pair in self.steps.windows(2) {
            if pair[1].at < pair[0].at {
                return Err(StampedeError::InvalidOption {
                    option: "`configuration.profile`".to_string(),
                    value: format!("{:?},{}", pair[1].at, pair[1].users),
                    detail: format!(
                        "Profile timestamps must not decrease ({:?} follows {:?}).",
                        pair[1].at, pair[0].at
                    ),
                });
            }
        }
        Ok(())
    }

    /// All steps, in order.
    pub fn steps(&self) -> &[ProfileStep] {
        &self.steps
    }

    /// The elapsed time of the final step.
    pub fn end(&self) -> Duration {
        self.steps.last().map(|s| s.at).unwrap_or_default()
    }

    /// The target of the final step, held once the profile has ended.
    pub fn final_users(&self) -> usize {
        self.steps.last().map(|s| s.users).unwrap_or(0)
    }

    /// The largest target anywhere in the profile.
    pub fn peak_users(&self) -> usize {
        self.steps.iter().map(|s| s.users).max().unwrap_or(0)
    }

    /// How many users should be active once `elapsed` has passed.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        // The last step at or before `elapsed` wins, so equal timestamps behave
        // like an instantaneous change.
        let next = self.steps.partition_point(|s| s.at <= elapsed);
        let previous = if next == 0 {
            ProfileStep {
                at: Duration::from_secs(0),
                users: 0,
            }
        } else {
            self.steps[next - 1]
        };

        match self.steps.get(next) {
            // Past the end of the profile, hold the final target.
            None => previous.users,
            Some(upcoming) => {
                let span = upcoming.at.saturating_sub(previous.at).as_secs_f64();
                if span <= 0.0 {
                    return upcoming.users;
                }
                let progress = elapsed.saturating_sub(previous.at).as_secs_f64() / span;
                let delta = upcoming.users as f64 - previous.users as f64;
                (previous.users as f64 + delta * progress).floor().max(0.0) as usize
            }
        }
    }
}

/// Implement [`FromStr`] to convert `"elapsed,users;elapsed,users"` strings into a
/// [`ConcurrencyProfile`].
///
/// Elapsed time accepts anything [`util::parse_timespan`] accepts: 0, 30s, 1m30s,
/// 500ms, etc. Users are integers.
impl FromStr for ConcurrencyProfile {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut steps: Vec<(Duration, usize)> = Vec::new();
        for line in s.split(';') {
            let step = PROFILE_STEP.captures(line).and_then(|cap| {
                let at = util::parse_timespan(&cap[1])?;
                let users = usize::from_str(&cap[2]).ok()?;
                Some((at, users))
            });
            match step {
                Some(step) => steps.push(step),
                None => {
                    // Logger isn't initialized yet, provide helpful debug output.
                    eprintln!("ERROR: invalid `configuration.profile` value: '{}'", line);
                    eprintln!("  Expected format: --profile \"{{elapsed}},{{users}};{{elapsed}},{{users}}\"");
                    eprintln!("    {{elapsed}} can be integer seconds or \"30s\", \"500ms\", \"1m30s\", etc");
                    eprintln!("    {{users}} must be an integer, ie \"100\"");
                    return Err(StampedeError::InvalidOption {
                        option: "`configuration.profile`".to_string(),
                        value: line.to_string(),
                        detail: "invalid `configuration.profile` value.".to_string(),
                    });
                }
            }
        }
        ConcurrencyProfile::new(steps)
    }
}

/// What the scheduler was doing during a stretch of the load test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileAction {
    /// The target number of users is going up.
    Increasing,
    /// The target number of users is steady.
    Maintaining,
    /// The target number of users is going down.
    Decreasing,
    /// The load test is over.
    Finished,
}

/// A historical record of a change in the scheduler's direction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileHistory {
    /// What happened from this point on.
    pub action: ProfileAction,
    /// When the change was observed.
    pub timestamp: DateTime<Utc>,
    /// The target number of users when the change was observed.
    pub users: usize,
}

impl ProfileHistory {
    pub(crate) fn step(action: ProfileAction, users: usize) -> ProfileHistory {
        ProfileHistory {
            action,
            timestamp: Utc::now(),
            users,
        }
    }
}
