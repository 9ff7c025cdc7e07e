//! The scheduler drives a load test.
//!
//! Every tick it compares the number of active [`VirtualUser`]s to the
//! [`ConcurrencyProfile`] target for the elapsed time, never allowing more than
//! `--max-users` runner tasks to be alive at once. Excess users are retired newest
//! first, so long running iterations on older users finish naturally.

use chrono::prelude::*;
use futures::future::join_all;
use std::time::Instant;
use tokio::task::JoinHandle;
use url::Url;

use crate::client::build_client;
use crate::config::StampedeConfiguration;
use crate::logger::{LoggerJoinHandle, LoggerTx};
use crate::metrics::{collector_main, CollectorMessage, CollectorReport, StampedeMetrics};
use crate::profile::{ConcurrencyProfile, ProfileAction, ProfileHistory};
use crate::user::{user_main, Iteration, PauseDistribution, UserCommand, UserSummary, VirtualUser};
use crate::util;
use crate::StampedeError;

/// A launched virtual user, as seen by the scheduler.
struct RunningUser {
    id: usize,
    sender: flume::Sender<UserCommand>,
    handle: JoinHandle<UserSummary>,
    /// Set once the user has been told to exit.
    stopping: bool,
}

/// Internal state of a running load test.
pub(crate) struct Scheduler {
    configuration: StampedeConfiguration,
    profile: ConcurrencyProfile,
    iteration: Iteration,
    pause: PauseDistribution,
    max_users: usize,
    base_url: Url,
    started: Instant,
    /// Every live runner task, in launch order.
    users: Vec<RunningUser>,
    /// Runners that stopped after completing `--iterations`, never replaced.
    completed_users: usize,
    users_launched: usize,
    iterations: usize,
    max_users_observed: usize,
    reported_users: Option<usize>,
    previous_target: usize,
    history: Vec<ProfileHistory>,
    metrics_tx: Option<flume::Sender<CollectorMessage>>,
    logger_tx: LoggerTx,
}

impl Scheduler {
    pub(crate) fn new(
        configuration: StampedeConfiguration,
        profile: ConcurrencyProfile,
        iteration: Iteration,
    ) -> Result<Scheduler, StampedeError> {
        let base_url = Url::parse(&configuration.host).map_err(|parse_error| {
            StampedeError::InvalidHost {
                host: configuration.host.to_string(),
                detail: "Invalid host.".to_string(),
                parse_error,
            }
        })?;
        let pause = configuration.pause.clone().unwrap_or_default();
        let max_users = configuration
            .max_users
            .unwrap_or_else(|| profile.peak_users().max(1));
        info!(
            "following {} step profile, at most {} users",
            profile.steps().len(),
            max_users
        );

        Ok(Scheduler {
            configuration,
            profile,
            iteration,
            pause,
            max_users,
            base_url,
            started: Instant::now(),
            users: Vec::new(),
            completed_users: 0,
            users_launched: 0,
            iterations: 0,
            max_users_observed: 0,
            reported_users: None,
            previous_target: 0,
            history: Vec::new(),
            metrics_tx: None,
            logger_tx: None,
        })
    }

    /// Run the load test to completion, returning its metrics.
    pub(crate) async fn run(mut self) -> Result<StampedeMetrics, StampedeError> {
        // Log files are opened before anything starts, so a bad path fails early.
        let (logger_handle, logger_tx) = self.configuration.setup_logger().await?;
        self.logger_tx = logger_tx;

        let started_at = Utc::now();
        self.started = Instant::now();

        let (metrics_tx, metrics_rx) = flume::unbounded();
        self.metrics_tx = Some(metrics_tx);
        let collector = tokio::spawn(collector_main(
            metrics_rx,
            self.configuration.snapshot_interval(),
            self.started,
            self.logger_tx.clone(),
        ));

        // Catch ctrl-c to allow clean shutdown to display metrics.
        util::setup_ctrlc_handler();

        let result = self.schedule(&collector).await;

        // Tell every remaining user to exit, and wait for them.
        self.stop_running_users().await;
        self.history.push(ProfileHistory::step(ProfileAction::Finished, 0));
        let duration = self.started.elapsed();

        // Dropping the last sender closes the channel: the collector drains and returns.
        self.report_users(0);
        self.metrics_tx = None;
        let report = match collector.await {
            Ok(report) => report,
            Err(e) => {
                return Err(StampedeError::Internal {
                    detail: format!("metrics collector failed: {}", e),
                })
            }
        };

        stop_logger(logger_handle, self.logger_tx.take()).await;
        result?;

        Ok(self.into_metrics(report, started_at, duration))
    }

    // The tick loop: returns once the profile is complete, the run time expires or
    // ctrl-c is caught.
    async fn schedule(&mut self, collector: &JoinHandle<CollectorReport>) -> Result<(), StampedeError> {
        let tick = self.configuration.tick();
        let run_time = self.configuration.run_time_limit();
        let mut drift_timer = tokio::time::Instant::now();

        loop {
            if util::canceled() {
                info!("load test canceled");
                return Ok(());
            }
            if let Some(run_time) = run_time {
                if util::timer_expired(self.started, run_time) {
                    info!("run time of {:?} expired, stopping", run_time);
                    return Ok(());
                }
            }
            if collector.is_finished() {
                return Err(StampedeError::Internal {
                    detail: "metrics collector exited before the load test finished".to_string(),
                });
            }

            self.reap_finished_users().await?;

            let elapsed = self.started.elapsed();
            let target = self.profile.target_at(elapsed).min(self.max_users);
            self.record_direction(target);
            self.adjust_users(target)?;
            self.report_users(self.active_users());

            if self.users.is_empty() {
                if target == 0 && elapsed >= self.profile.end() {
                    info!("profile complete, all users stopped");
                    return Ok(());
                }
                // Every user the profile will ever run has finished its iterations.
                if self.configuration.iterations > 0
                    && self.completed_users >= self.profile.peak_users().min(self.max_users)
                {
                    info!("all users completed {} iterations", self.configuration.iterations);
                    return Ok(());
                }
            }

            drift_timer = util::sleep_minus_drift(tick, drift_timer).await;
        }
    }

    // Users not yet told to stop.
    fn active_users(&self) -> usize {
        self.users.iter().filter(|u| !u.stopping).count()
    }

    // Spawn or retire users to move toward `target`.
    fn adjust_users(&mut self, target: usize) -> Result<(), StampedeError> {
        // Users that completed their iterations are never replaced.
        while self.users.len() + self.completed_users < target {
            self.spawn_user()?;
        }
        self.max_users_observed = self.max_users_observed.max(self.users.len());

        let mut active = self.active_users();
        if active > target {
            // Newest first.
            for user in self.users.iter_mut().rev().filter(|u| !u.stopping) {
                if active <= target {
                    break;
                }
                debug!("telling user {} to exit", user.id);
                if let Err(e) = user.sender.send(UserCommand::Exit) {
                    debug!("user {} already exited: {}", user.id, e);
                }
                user.stopping = true;
                active -= 1;
            }
        }
        Ok(())
    }

    fn spawn_user(&mut self) -> Result<(), StampedeError> {
        self.users_launched += 1;
        let id = self.users_launched;

        let mut user = VirtualUser::new(id, self.base_url.clone(), build_client(&self.configuration)?);
        user.path = self.configuration.path.to_string();
        user.started = self.started;
        user.metrics = self.metrics_tx.clone();
        user.logger = self.logger_tx.clone();

        let (sender, receiver) = flume::unbounded();
        let handle = tokio::spawn(user_main(
            user,
            self.iteration.clone(),
            self.pause.clone(),
            self.configuration.iterations,
            receiver,
        ));
        self.users.push(RunningUser {
            id,
            sender,
            handle,
            stopping: false,
        });
        Ok(())
    }

    // Join every user whose task has finished.
    async fn reap_finished_users(&mut self) -> Result<(), StampedeError> {
        let (finished, running): (Vec<RunningUser>, Vec<RunningUser>) = std::mem::take(&mut self.users)
            .into_iter()
            .partition(|u| u.handle.is_finished());
        self.users = running;

        for user in finished {
            let stopping = user.stopping;
            let summary = self.join_user(user).await?;
            if !stopping {
                self.completed_users += 1;
            }
            trace!("reaped user {}: {}", summary.id, summary.state);
        }
        Ok(())
    }

    async fn join_user(&mut self, user: RunningUser) -> Result<UserSummary, StampedeError> {
        match user.handle.await {
            Ok(summary) => {
                self.iterations += summary.iterations;
                Ok(summary)
            }
            Err(e) => Err(StampedeError::Internal {
                detail: format!("user {} failed: {}", user.id, e),
            }),
        }
    }

    async fn stop_running_users(&mut self) {
        if self.users.is_empty() {
            return;
        }
        info!("stopping {} users...", self.users.len());
        for user in self.users.iter_mut().filter(|u| !u.stopping) {
            if let Err(e) = user.sender.send(UserCommand::Exit) {
                debug!("user {} already exited: {}", user.id, e);
            }
            user.stopping = true;
        }

        let users = std::mem::take(&mut self.users);
        let ids: Vec<usize> = users.iter().map(|u| u.id).collect();
        let results = join_all(users.into_iter().map(|u| u.handle)).await;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(summary) => self.iterations += summary.iterations,
                Err(e) => warn!("user {} failed: {}", id, e),
            }
        }
    }

    // Keep the collector informed of how many users are active.
    fn report_users(&mut self, users: usize) {
        if self.reported_users == Some(users) {
            return;
        }
        self.reported_users = Some(users);
        if let Some(metrics_tx) = self.metrics_tx.as_ref() {
            if let Err(e) = metrics_tx.send(CollectorMessage::Users(users)) {
                warn!("failed to report users to metrics collector: {}", e);
            }
        }
    }

    // Record a history entry whenever the direction of the profile changes.
    fn record_direction(&mut self, target: usize) {
        let action = if target > self.previous_target {
            ProfileAction::Increasing
        } else if target < self.previous_target {
            ProfileAction::Decreasing
        } else {
            ProfileAction::Maintaining
        };
        self.previous_target = target;

        if self.history.last().map(|h| &h.action) != Some(&action) {
            match action {
                ProfileAction::Increasing => info!("increasing to {} users", target),
                ProfileAction::Decreasing => info!("decreasing to {} users", target),
                _ => info!("maintaining {} users", target),
            }
            self.history.push(ProfileHistory::step(action, target));
        }
    }

    fn into_metrics(
        self,
        report: CollectorReport,
        started_at: DateTime<Utc>,
        duration: std::time::Duration,
    ) -> StampedeMetrics {
        StampedeMetrics {
            started: Some(started_at),
            stopped: Some(Utc::now()),
            duration,
            snapshots: report.snapshots,
            total: report.total,
            history: self.history,
            users_launched: self.users_launched,
            max_users_observed: self.max_users_observed,
            iterations: self.iterations,
            display_metrics: !self.configuration.no_print_metrics,
        }
    }
}

// If the logger task is enabled, tell it to flush and exit.
async fn stop_logger(logger_handle: LoggerJoinHandle, logger_tx: LoggerTx) {
    if let Some(logger_tx) = logger_tx {
        if let Err(e) = logger_tx.send(None) {
            warn!("unexpected error telling logger to exit: {}", e);
        }
    }
    if let Some(handle) = logger_handle {
        match handle.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => warn!("logger failed: {}", e),
            Err(e) => warn!("logger task failed: {}", e),
        }
    }
}
