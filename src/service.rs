//! Caller-facing generation facade.

use crate::cancel::CancelSignal;
use crate::error::{FailureReason, GenerationError};
use crate::models::{GenerationJob, GenerationParams};
use crate::orchestrator::{JobOrchestrator, JobOutcome, OrchestratorPolicy};
use crate::prompt::PromptRules;
use crate::transport::JobTransport;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Validates prompts and runs one [`JobOrchestrator`] per request, with a
/// bound on how many generations may be in flight at once.
pub struct ImagineService {
    transport: Arc<dyn JobTransport>,
    policy: OrchestratorPolicy,
    rules: PromptRules,
    defaults: GenerationParams,
    in_flight: Arc<Semaphore>,
    timeout_retries: usize,
}

impl ImagineService {
    pub fn new(transport: Arc<dyn JobTransport>, policy: OrchestratorPolicy) -> Self {
        Self {
            transport,
            policy,
            rules: PromptRules::default(),
            defaults: GenerationParams::default(),
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            timeout_retries: 0,
        }
    }

    pub fn with_prompt_rules(mut self, rules: PromptRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_default_params(mut self, params: GenerationParams) -> Self {
        self.defaults = params;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.in_flight = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    /// Extra attempts, each with a fresh request id, after a job times out.
    pub fn with_timeout_retries(mut self, retries: usize) -> Self {
        self.timeout_retries = retries;
        self
    }

    pub fn default_params(&self) -> GenerationParams {
        self.defaults.clone()
    }

    pub async fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<Vec<u8>, GenerationError> {
        self.generate_with_cancel(prompt, params, CancelSignal::never())
            .await
    }

    pub async fn generate_with_cancel(
        &self,
        prompt: &str,
        params: GenerationParams,
        cancel: CancelSignal,
    ) -> Result<Vec<u8>, GenerationError> {
        let prompt = self.rules.validate(prompt)?;

        // The wait for a slot counts against the first attempt's budget.
        let deadline = Instant::now() + self.policy.job_timeout;
        let _slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            slot = tokio::time::timeout_at(deadline, self.in_flight.acquire()) => match slot {
                Ok(slot) => slot.map_err(|_| GenerationError::Failed {
                    reason: FailureReason::ServiceUnavailable,
                })?,
                Err(_) => {
                    warn!(
                        "Timed out waiting for a generation slot for prompt: {}",
                        preview(&prompt)
                    );
                    return Err(GenerationError::Timeout);
                }
            },
        };

        let attempts = self.timeout_retries + 1;
        for attempt in 1..=attempts {
            let job = GenerationJob::new(prompt.clone(), params.clone());
            info!(
                "[{}] Generating image for prompt: {} (attempt {}/{})",
                job.request_id(),
                preview(&prompt),
                attempt,
                attempts
            );

            let orchestrator = JobOrchestrator::new(
                self.transport.clone(),
                job,
                self.policy.clone(),
                cancel.clone(),
            );
            let report = if attempt == 1 {
                orchestrator.with_deadline(deadline).run().await
            } else {
                orchestrator.run().await
            };

            match report.outcome {
                JobOutcome::Succeeded => {
                    return report.into_image().ok_or(GenerationError::Failed {
                        reason: FailureReason::ResultUnavailable,
                    })
                }
                JobOutcome::Failed(FailureReason::Cancelled) => {
                    return Err(GenerationError::Cancelled)
                }
                JobOutcome::Failed(reason) => return Err(GenerationError::Failed { reason }),
                JobOutcome::TimedOut if attempt < attempts => {
                    warn!(
                        "[{}] Timed out, retrying with a fresh job",
                        report.job.request_id()
                    );
                }
                JobOutcome::TimedOut => {}
            }
        }

        Err(GenerationError::Timeout)
    }
}

fn preview(prompt: &str) -> String {
    const MAX: usize = 50;
    if prompt.chars().count() > MAX {
        format!("{}...", prompt.chars().take(MAX).collect::<String>())
    } else {
        prompt.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::error::{InvalidPromptError, SubmitError};
    use crate::models::RemoteStatus;
    use crate::transport::mock::MOCK_PNG;
    use crate::transport::MockTransport;
    use std::time::Duration;
    use tokio::time::Instant;

    fn service(transport: Arc<MockTransport>) -> ImagineService {
        ImagineService::new(transport, OrchestratorPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_returns_image() {
        let transport = Arc::new(
            MockTransport::new()
                .with_statuses(vec![RemoteStatus::Running, RemoteStatus::Completed]),
        );
        let service = service(transport.clone());

        let image = service
            .generate("a red fox in snow", service.default_params())
            .await
            .unwrap();

        assert_eq!(image, MOCK_PNG.to_vec());
        assert_eq!(transport.get_remote_job_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_prompt_makes_no_calls() {
        let transport = Arc::new(MockTransport::new());
        let service = service(transport.clone());

        let err = service
            .generate("  ", GenerationParams::default())
            .await
            .unwrap_err();

        assert_eq!(err, GenerationError::InvalidPrompt(InvalidPromptError::Empty));
        assert_eq!(transport.get_total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_surfaces_reason() {
        let transport = Arc::new(MockTransport::new().with_submit_results(vec![Err(
            SubmitError::Permanent {
                reason: FailureReason::InsufficientCredits,
                message: "status 402".to_string(),
            },
        )]));
        let service = service(transport.clone());

        let err = service
            .generate("a lighthouse at dusk", GenerationParams::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            GenerationError::Failed {
                reason: FailureReason::InsufficientCredits
            }
        );
        assert_eq!(transport.get_submit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_retries() {
        let transport =
            Arc::new(MockTransport::new().with_statuses(vec![RemoteStatus::Queued]));
        let service = service(transport.clone());

        let started = Instant::now();
        let err = service
            .generate("a slow painting", GenerationParams::default())
            .await
            .unwrap_err();

        assert_eq!(err, GenerationError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(121));
        assert_eq!(transport.get_remote_job_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retry_uses_fresh_request_id() {
        let transport =
            Arc::new(MockTransport::new().with_statuses(vec![RemoteStatus::Queued]));
        let service = service(transport.clone()).with_timeout_retries(1);

        let started = Instant::now();
        let err = service
            .generate("a slow painting", GenerationParams::default())
            .await
            .unwrap_err();

        assert_eq!(err, GenerationError::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(240));
        assert_eq!(transport.get_remote_job_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_slot() {
        let transport =
            Arc::new(MockTransport::new().with_statuses(vec![RemoteStatus::Queued]));
        let service = service(transport.clone()).with_max_in_flight(1);
        let (handle, signal) = cancel_pair();

        let (first, second) = tokio::join!(
            service.generate("first prompt", GenerationParams::default()),
            async {
                let pending =
                    service.generate_with_cancel("second prompt", GenerationParams::default(), signal);
                tokio::pin!(pending);
                tokio::select! {
                    result = &mut pending => result,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        handle.cancel();
                        pending.await
                    }
                }
            }
        );

        assert_eq!(first.unwrap_err(), GenerationError::Timeout);
        assert_eq!(second.unwrap_err(), GenerationError::Cancelled);
        assert_eq!(transport.get_remote_job_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_wait_counts_against_job_timeout() {
        let transport =
            Arc::new(MockTransport::new().with_statuses(vec![RemoteStatus::Queued]));
        let service = service(transport.clone()).with_max_in_flight(1);

        let started = Instant::now();
        let (first, second) = tokio::join!(
            service.generate("first stuck prompt", GenerationParams::default()),
            service.generate("second stuck prompt", GenerationParams::default()),
        );

        assert_eq!(first.unwrap_err(), GenerationError::Timeout);
        assert_eq!(second.unwrap_err(), GenerationError::Timeout);
        assert!(started.elapsed() <= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bound_serializes_jobs() {
        let transport = Arc::new(MockTransport::new());
        let service = service(transport.clone()).with_max_in_flight(1);
        let params = GenerationParams::default;

        let started = Instant::now();
        let (a, b, c, d) = tokio::join!(
            service.generate("prompt one", params()),
            service.generate("prompt two", params()),
            service.generate("prompt three", params()),
            service.generate("prompt four", params()),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
        // Each job needs one 2s poll; one at a time means 8s.
        assert_eq!(started.elapsed(), Duration::from_secs(8));

        let service = self::service(transport).with_max_in_flight(4);
        let started = Instant::now();
        let (a, b) = tokio::join!(
            service.generate("prompt five", params()),
            service.generate("prompt six", params()),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }
}
