//! Per-job state machine
//!
//! A [`JobOrchestrator`] owns exactly one [`GenerationJob`] and drives it
//! from `CREATED` to a terminal state:
//!
//! ```text
//! CREATED --submit--> SUBMITTED --first status--> RUNNING --complete+fetch--> SUCCEEDED
//!    |                    |                          |
//!    +--------------------+--------------------------+--> FAILED | TIMED_OUT
//! ```
//!
//! Submits are retried with exponential backoff while the failure is
//! transient. Polling backs off geometrically up to a cap. The whole run is
//! bounded by one deadline, and every suspension point also races the job's
//! [`CancelSignal`].

use crate::cancel::CancelSignal;
use crate::error::{FailureReason, FetchError, PollError, SubmitError};
use crate::models::{GenerationJob, JobState, RemoteStatus};
use crate::transport::JobTransport;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

/// Retry, polling and deadline knobs for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorPolicy {
    /// Total submit attempts, including the first.
    pub submit_max_attempts: usize,
    pub submit_backoff_base: Duration,
    pub submit_backoff_factor: u32,
    pub submit_backoff_max: Duration,
    pub poll_interval: Duration,
    pub poll_interval_max: Duration,
    pub poll_backoff_factor: f64,
    pub poll_max_consecutive_errors: usize,
    pub job_timeout: Duration,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            submit_max_attempts: 5,
            submit_backoff_base: Duration::from_secs(1),
            submit_backoff_factor: 2,
            submit_backoff_max: Duration::from_secs(16),
            poll_interval: Duration::from_secs(2),
            poll_interval_max: Duration::from_secs(10),
            poll_backoff_factor: 1.5,
            poll_max_consecutive_errors: 5,
            job_timeout: Duration::from_secs(120),
        }
    }
}

impl OrchestratorPolicy {
    /// Delays between submit attempts; one fewer than the attempt count.
    pub fn submit_backoff(&self) -> Vec<Duration> {
        (0..self.submit_max_attempts.saturating_sub(1))
            .map(|i| {
                let factor = self.submit_backoff_factor.saturating_pow(i as u32);
                self.submit_backoff_base
                    .saturating_mul(factor)
                    .min(self.submit_backoff_max)
            })
            .collect()
    }

    pub fn next_poll_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.poll_backoff_factor)
            .min(self.poll_interval_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(FailureReason),
    TimedOut,
}

/// What a finished orchestrator hands back.
#[derive(Debug)]
pub struct JobReport {
    pub job: GenerationJob,
    pub outcome: JobOutcome,
    /// Every state entered after `CREATED`, in order.
    pub history: Vec<JobState>,
}

impl JobReport {
    /// Take the image out of a successful job.
    pub fn into_image(self) -> Option<Vec<u8>> {
        match self.outcome {
            JobOutcome::Succeeded => self.job.result,
            _ => None,
        }
    }
}

pub struct JobOrchestrator {
    transport: Arc<dyn JobTransport>,
    job: GenerationJob,
    policy: OrchestratorPolicy,
    cancel: CancelSignal,
    state_tx: watch::Sender<JobState>,
    history: Vec<JobState>,
    deadline: Option<Instant>,
}

impl JobOrchestrator {
    pub fn new(
        transport: Arc<dyn JobTransport>,
        job: GenerationJob,
        policy: OrchestratorPolicy,
        cancel: CancelSignal,
    ) -> Self {
        let (state_tx, _) = watch::channel(job.state());
        Self {
            transport,
            job,
            policy,
            cancel,
            state_tx,
            history: Vec::new(),
            deadline: None,
        }
    }

    /// Finish by `deadline` instead of `job_timeout` from the start of `run`,
    /// for callers that already spent part of the budget waiting.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Live view of the job state for observers such as a chat typing indicator.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn request_id(&self) -> &str {
        self.job.request_id()
    }

    /// Drive the job to a terminal state. Never panics on remote failure;
    /// every failure ends up in the report's outcome.
    pub async fn run(mut self) -> JobReport {
        let started = Instant::now();
        let deadline = self
            .deadline
            .unwrap_or(started + self.policy.job_timeout);
        info!(
            "[{}] Starting generation job (timeout {:?})",
            self.job.request_id(),
            deadline.saturating_duration_since(started)
        );

        let outcome = match tokio::time::timeout_at(deadline, self.drive()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "[{}] Job timed out in state {} after {:?}",
                    self.job.request_id(),
                    self.job.state(),
                    started.elapsed()
                );
                JobOutcome::TimedOut
            }
        };

        self.finish(outcome)
    }

    async fn drive(&mut self) -> JobOutcome {
        let remote_id = match self.submit().await {
            Ok(id) => id,
            Err(reason) => return JobOutcome::Failed(reason),
        };

        self.job.remote_job_id = Some(remote_id.clone());
        self.job.submitted_at = Some(Utc::now());
        self.transition(JobState::Submitted);

        match self.poll_until_terminal(&remote_id).await {
            Ok(RemoteStatus::Completed) => {}
            Ok(status) => {
                error!(
                    "[{}] Remote job {} ended as {:?}",
                    self.job.request_id(),
                    remote_id,
                    status
                );
                return JobOutcome::Failed(FailureReason::GenerationFailed);
            }
            Err(reason) => return JobOutcome::Failed(reason),
        }

        self.fetch(&remote_id).await
    }

    async fn submit(&self) -> Result<String, FailureReason> {
        let transport = &self.transport;
        let job = &self.job;
        let cancel = &self.cancel;
        let max_attempts = self.policy.submit_max_attempts.max(1);
        let mut attempt = 0;

        let action = || {
            attempt += 1;
            let attempt = attempt;
            async move {
                if cancel.is_cancelled() {
                    return Err(SubmitError::Cancelled);
                }
                debug!(
                    "[{}] Submit attempt {}/{}",
                    job.request_id(),
                    attempt,
                    max_attempts
                );
                transport.submit(job, cancel).await.map_err(|e| {
                    if e.is_transient() {
                        warn!(
                            "[{}] Submit attempt {}/{} failed: {}. Will retry...",
                            job.request_id(),
                            attempt,
                            max_attempts,
                            e
                        );
                    }
                    e
                })
            }
        };

        let submission = RetryIf::spawn(self.policy.submit_backoff(), action, |e: &SubmitError| {
            e.is_transient()
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SubmitError::Cancelled),
            result = submission => result,
        };

        match result {
            Ok(remote_id) => {
                info!(
                    "[{}] Submitted as remote job {}",
                    self.job.request_id(),
                    remote_id
                );
                Ok(remote_id)
            }
            Err(SubmitError::Transient(message)) => {
                error!(
                    "[{}] Submit failed after {} attempts: {}",
                    self.job.request_id(),
                    max_attempts,
                    message
                );
                Err(FailureReason::ServiceUnavailable)
            }
            Err(SubmitError::Permanent { reason, message }) => {
                error!(
                    "[{}] Submit rejected ({}): {}",
                    self.job.request_id(),
                    reason,
                    message
                );
                Err(reason)
            }
            Err(SubmitError::Cancelled) => {
                info!("[{}] Cancelled before submission", self.job.request_id());
                Err(FailureReason::Cancelled)
            }
        }
    }

    async fn poll_until_terminal(&mut self, remote_id: &str) -> Result<RemoteStatus, FailureReason> {
        let mut interval = self.policy.poll_interval;
        let mut consecutive_errors = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FailureReason::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
            if self.cancel.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }

            let result = self
                .transport
                .poll_status(self.job.request_id(), remote_id, &self.cancel)
                .await;
            self.job.last_polled_at = Some(Utc::now());

            match result {
                Ok(report) => {
                    consecutive_errors = 0;
                    if report.progress.is_some() {
                        self.job.progress = report.progress;
                    }
                    debug!(
                        "[{}] Remote job {} is {:?} (progress {:?})",
                        self.job.request_id(),
                        remote_id,
                        report.status,
                        report.progress
                    );
                    self.transition(JobState::Running);

                    if report.status.is_terminal() {
                        if let Some(message) = &report.message {
                            debug!("[{}] Remote message: {}", self.job.request_id(), message);
                        }
                        return Ok(report.status);
                    }
                }
                Err(PollError::Transient(message)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.policy.poll_max_consecutive_errors {
                        error!(
                            "[{}] Giving up after {} consecutive poll errors: {}",
                            self.job.request_id(),
                            consecutive_errors,
                            message
                        );
                        return Err(FailureReason::ServiceUnavailable);
                    }
                    warn!(
                        "[{}] Poll failed ({}/{}): {}",
                        self.job.request_id(),
                        consecutive_errors,
                        self.policy.poll_max_consecutive_errors,
                        message
                    );
                }
                Err(PollError::Permanent { reason, message }) => {
                    error!(
                        "[{}] Poll rejected ({}): {}",
                        self.job.request_id(),
                        reason,
                        message
                    );
                    return Err(reason);
                }
                Err(PollError::Cancelled) => return Err(FailureReason::Cancelled),
            }

            interval = self.policy.next_poll_interval(interval);
        }
    }

    async fn fetch(&mut self, remote_id: &str) -> JobOutcome {
        if self.cancel.is_cancelled() {
            return JobOutcome::Failed(FailureReason::Cancelled);
        }

        match self
            .transport
            .fetch_result(self.job.request_id(), remote_id, &self.cancel)
            .await
        {
            Ok(bytes) => {
                info!(
                    "[{}] Received {} byte image",
                    self.job.request_id(),
                    bytes.len()
                );
                self.job.result = Some(bytes);
                JobOutcome::Succeeded
            }
            Err(FetchError::Cancelled) => JobOutcome::Failed(FailureReason::Cancelled),
            Err(e) => {
                error!("[{}] Could not fetch result: {}", self.job.request_id(), e);
                JobOutcome::Failed(FailureReason::ResultUnavailable)
            }
        }
    }

    fn transition(&mut self, next: JobState) -> bool {
        let previous = self.job.state();
        if !self.job.advance(next) {
            return false;
        }
        info!("[{}] {} -> {}", self.job.request_id(), previous, next);
        self.history.push(next);
        self.state_tx.send_replace(next);
        true
    }

    fn finish(mut self, outcome: JobOutcome) -> JobReport {
        let terminal = match outcome {
            JobOutcome::Succeeded => JobState::Succeeded,
            JobOutcome::Failed(reason) => {
                self.job.error = Some(reason);
                JobState::Failed
            }
            JobOutcome::TimedOut => JobState::TimedOut,
        };
        self.transition(terminal);

        JobReport {
            job: self.job,
            outcome,
            history: self.history,
        }
    }
}
