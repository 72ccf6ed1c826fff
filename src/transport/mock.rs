use super::{JobTransport, StatusReport};
use crate::cancel::CancelSignal;
use crate::error::{FetchError, PollError, SubmitError};
use crate::models::{GenerationJob, RemoteStatus};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Smallest payload `detect_image_mime` accepts as a PNG.
pub const MOCK_PNG: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Scripted transport. Submit outcomes are consumed in order (success once
/// the script runs dry), status reports likewise with the last one repeating.
pub struct MockTransport {
    submit_script: Arc<Mutex<VecDeque<Result<(), SubmitError>>>>,
    status_script: Arc<Mutex<VecDeque<Result<StatusReport, PollError>>>>,
    last_status: Arc<Mutex<Result<StatusReport, PollError>>>,
    fetch_result: Arc<Mutex<Result<Vec<u8>, FetchError>>>,
    remote_jobs: Arc<Mutex<HashMap<String, String>>>,
    submit_count: Arc<Mutex<usize>>,
    poll_count: Arc<Mutex<usize>>,
    fetch_count: Arc<Mutex<usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            submit_script: Arc::new(Mutex::new(VecDeque::new())),
            status_script: Arc::new(Mutex::new(VecDeque::new())),
            last_status: Arc::new(Mutex::new(Ok(StatusReport::new(RemoteStatus::Completed)))),
            fetch_result: Arc::new(Mutex::new(Ok(MOCK_PNG.to_vec()))),
            remote_jobs: Arc::new(Mutex::new(HashMap::new())),
            submit_count: Arc::new(Mutex::new(0)),
            poll_count: Arc::new(Mutex::new(0)),
            fetch_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_submit_results(self, results: Vec<Result<(), SubmitError>>) -> Self {
        *self.submit_script.lock().unwrap() = results.into();
        self
    }

    pub fn with_statuses(self, statuses: Vec<RemoteStatus>) -> Self {
        self.with_status_results(
            statuses
                .into_iter()
                .map(|s| Ok(StatusReport::new(s)))
                .collect(),
        )
    }

    pub fn with_status_results(self, results: Vec<Result<StatusReport, PollError>>) -> Self {
        let mut script: VecDeque<_> = results.into();
        if let Some(last) = script.pop_back() {
            *self.last_status.lock().unwrap() = last;
        }
        *self.status_script.lock().unwrap() = script;
        self
    }

    pub fn with_fetch_result(self, result: Result<Vec<u8>, FetchError>) -> Self {
        *self.fetch_result.lock().unwrap() = result;
        self
    }

    pub fn get_submit_count(&self) -> usize {
        *self.submit_count.lock().unwrap()
    }

    pub fn get_poll_count(&self) -> usize {
        *self.poll_count.lock().unwrap()
    }

    pub fn get_fetch_count(&self) -> usize {
        *self.fetch_count.lock().unwrap()
    }

    /// Number of distinct remote jobs created, one per request id.
    pub fn get_remote_job_count(&self) -> usize {
        self.remote_jobs.lock().unwrap().len()
    }

    pub fn get_total_calls(&self) -> usize {
        self.get_submit_count() + self.get_poll_count() + self.get_fetch_count()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTransport for MockTransport {
    async fn submit(&self, job: &GenerationJob, cancel: &CancelSignal) -> Result<String, SubmitError> {
        if cancel.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }
        *self.submit_count.lock().unwrap() += 1;

        if let Some(Err(e)) = self.submit_script.lock().unwrap().pop_front() {
            return Err(e);
        }

        let mut jobs = self.remote_jobs.lock().unwrap();
        let next = jobs.len() + 1;
        let remote_id = jobs
            .entry(job.request_id().to_string())
            .or_insert_with(|| format!("mock-job-{}", next))
            .clone();
        Ok(remote_id)
    }

    async fn poll_status(
        &self,
        _request_id: &str,
        _remote_job_id: &str,
        cancel: &CancelSignal,
    ) -> Result<StatusReport, PollError> {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        *self.poll_count.lock().unwrap() += 1;

        match self.status_script.lock().unwrap().pop_front() {
            Some(next) => next,
            None => self.last_status.lock().unwrap().clone(),
        }
    }

    async fn fetch_result(
        &self,
        _request_id: &str,
        _remote_job_id: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        *self.fetch_count.lock().unwrap() += 1;
        self.fetch_result.lock().unwrap().clone()
    }
}
