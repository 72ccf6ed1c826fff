//! Signed transport to the remote generation service
//!
//! [`JobTransport`] is the seam between the orchestrator and the network:
//! [`TamsClient`] speaks the real API, [`MockTransport`] replays scripted
//! responses for tests and local harnesses.

pub mod client;
pub mod mock;

pub use client::TamsClient;
pub use mock::MockTransport;

use crate::cancel::CancelSignal;
use crate::error::{FetchError, PollError, SubmitError};
use crate::models::{GenerationJob, RemoteStatus};
use async_trait::async_trait;

/// One observation of a remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: RemoteStatus,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl StatusReport {
    pub fn new(status: RemoteStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
        }
    }
}

/// Every call carries the job's request id so the service can deduplicate,
/// and every call gives up when `cancel` fires.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Create the remote job; returns the remote job id.
    async fn submit(&self, job: &GenerationJob, cancel: &CancelSignal)
        -> Result<String, SubmitError>;

    async fn poll_status(
        &self,
        request_id: &str,
        remote_job_id: &str,
        cancel: &CancelSignal,
    ) -> Result<StatusReport, PollError>;

    /// Download the finished image. Only valid once the job reports completion.
    async fn fetch_result(
        &self,
        request_id: &str,
        remote_job_id: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>, FetchError>;
}
