use super::{JobTransport, StatusReport};
use crate::cancel::CancelSignal;
use crate::error::{FailureReason, FetchError, PollError, SubmitError};
use crate::mime::detect_image_mime;
use crate::models::{ApiErrorBody, GenerationJob, JobEnvelope, ModelInfo, ModelList};
use crate::rate_limit::{RateLimiter, RateToken};
use crate::signer::Signer;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const JOBS_PATH: &str = "/v1/jobs";
const MODELS_PATH: &str = "/v1/models";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// How a single API call went wrong, before it is narrowed to the
/// operation-specific error.
#[derive(Debug, Clone, PartialEq)]
enum CallFailure {
    Transient(String),
    Permanent {
        reason: FailureReason,
        message: String,
    },
    Cancelled,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Transient(message) => write!(f, "transient failure: {}", message),
            CallFailure::Permanent { reason, message } => write!(f, "{}: {}", reason, message),
            CallFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<CallFailure> for SubmitError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Transient(message) => SubmitError::Transient(message),
            CallFailure::Permanent { reason, message } => SubmitError::Permanent { reason, message },
            CallFailure::Cancelled => SubmitError::Cancelled,
        }
    }
}

impl From<CallFailure> for PollError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Transient(message) => PollError::Transient(message),
            CallFailure::Permanent { reason, message } => PollError::Permanent { reason, message },
            CallFailure::Cancelled => PollError::Cancelled,
        }
    }
}

impl From<CallFailure> for FetchError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Permanent {
                reason: FailureReason::InvalidRequest,
                message,
            } => FetchError::Expired(message),
            CallFailure::Cancelled => FetchError::Cancelled,
            other => FetchError::Unavailable(other.to_string()),
        }
    }
}

impl From<CallFailure> for Error {
    fn from(failure: CallFailure) -> Self {
        Error::Remote(failure.to_string())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

fn classify(status: StatusCode, body: &str) -> CallFailure {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| truncate(body, 200));
    let message = format!("status {}: {}", status.as_u16(), detail);

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        CallFailure::Transient(message)
    } else {
        CallFailure::Permanent {
            reason: FailureReason::from_status(status.as_u16()),
            message,
        }
    }
}

/// TAMS REST client. Every API call takes a rate permit, is signed over its
/// exact body bytes, and races the caller's cancellation signal.
pub struct TamsClient {
    client: Client,
    signer: Arc<Signer>,
    limiter: Arc<RateLimiter>,
    api_key: Option<SecretString>,
    base_url: String,
}

impl TamsClient {
    pub fn new(
        signer: Arc<Signer>,
        limiter: Arc<RateLimiter>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::new_with_client(client, signer, limiter, base_url))
    }

    pub fn new_with_client(
        client: Client,
        signer: Arc<Signer>,
        limiter: Arc<RateLimiter>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            signer,
            limiter,
            api_key: None,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn permit(&self, cancel: &CancelSignal) -> std::result::Result<RateToken, CallFailure> {
        self.limiter
            .acquire(Some(cancel))
            .await
            .map_err(|_| CallFailure::Cancelled)
    }

    /// Sign and send one API call. The caller must already hold a permit.
    async fn send_signed<Resp: DeserializeOwned>(
        &self,
        _permit: &RateToken,
        method: Method,
        path: &str,
        body: Vec<u8>,
        request_id: Option<&str>,
        cancel: &CancelSignal,
    ) -> std::result::Result<Resp, CallFailure> {
        if cancel.is_cancelled() {
            return Err(CallFailure::Cancelled);
        }

        let signed = self
            .signer
            .sign_request(method.as_str(), path, &body)
            .map_err(|e| CallFailure::Permanent {
                reason: FailureReason::InvalidRequest,
                message: e.to_string(),
            })?;
        let authorization = self.signer.authorization(&signed);
        let url = format!("{}{}", self.base_url, path);

        tracing::debug!("Sending {} {} ({:?})", method, url, signed);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, "application/json");
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key.expose_secret());
        }
        if let Some(request_id) = request_id {
            request = request.header(REQUEST_ID_HEADER, request_id);
        }
        if !signed.body.is_empty() {
            request = request.body(signed.body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
            result = exchange => result.map_err(|e| {
                tracing::error!("Failed to send request to TAMS ({} {}): {}", method, path, e);
                CallFailure::Transient(e.to_string())
            })?,
        };

        tracing::debug!("TAMS responded {} for {} {}", status, method, path);

        if !status.is_success() {
            let failure = classify(status, &text);
            tracing::error!("TAMS API error on {} {}: {}", method, path, failure);
            return Err(failure);
        }

        serde_json::from_str(&text).map_err(|e| {
            tracing::error!(
                "Failed to parse TAMS response: {}\nBody: {}",
                e,
                truncate(&text, 200)
            );
            CallFailure::Transient(format!("unparseable response: {}", e))
        })
    }

    async fn download(&self, url: &str, cancel: &CancelSignal) -> std::result::Result<Vec<u8>, FetchError> {
        let url = if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            url.to_string()
        };

        let exchange = async {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };

        let (status, bytes) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = exchange => result.map_err(|e| {
                tracing::error!("Failed to download result image: {}", e);
                FetchError::Unavailable(e.to_string())
            })?,
        };

        match status {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(FetchError::Expired(format!(
                    "result download returned {}",
                    status
                )))
            }
            s if !s.is_success() => {
                return Err(FetchError::Unavailable(format!(
                    "result download returned {}",
                    s
                )))
            }
            _ => {}
        }

        if bytes.is_empty() {
            return Err(FetchError::Malformed("empty image body".to_string()));
        }
        let mime = detect_image_mime(&bytes)
            .ok_or_else(|| FetchError::Malformed("payload is not a recognised image".to_string()))?;
        tracing::debug!("Downloaded {} byte {} result", bytes.len(), mime);

        Ok(bytes.to_vec())
    }

    /// List models available to the account.
    pub async fn list_models(
        &self,
        page: u32,
        page_size: u32,
        model_type: &str,
    ) -> Result<Vec<ModelInfo>> {
        if !model_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Config(format!("invalid model type '{}'", model_type)));
        }

        tracing::info!("Listing models of type {}, page {}", model_type, page);
        let cancel = CancelSignal::never();
        let path = format!(
            "{}?page={}&pageSize={}&modelType={}",
            MODELS_PATH, page, page_size, model_type
        );
        let permit = self.permit(&cancel).await?;
        let list: ModelList = self
            .send_signed(&permit, Method::GET, &path, Vec::new(), None, &cancel)
            .await?;
        Ok(list.models)
    }

    pub async fn model_details(&self, model_id: &str) -> Result<ModelInfo> {
        if model_id.is_empty() || model_id.contains(['/', '?', '#']) {
            return Err(Error::Config(format!("invalid model id '{}'", model_id)));
        }

        tracing::info!("Getting details for model: {}", model_id);
        let cancel = CancelSignal::never();
        let path = format!("{}/{}", MODELS_PATH, model_id);
        let permit = self.permit(&cancel).await?;
        Ok(self
            .send_signed(&permit, Method::GET, &path, Vec::new(), None, &cancel)
            .await?)
    }
}

#[async_trait]
impl JobTransport for TamsClient {
    async fn submit(
        &self,
        job: &GenerationJob,
        cancel: &CancelSignal,
    ) -> std::result::Result<String, SubmitError> {
        let body = serde_json::to_vec(&job.to_request()).map_err(|e| SubmitError::Permanent {
            reason: FailureReason::InvalidRequest,
            message: e.to_string(),
        })?;

        tracing::info!(
            "Creating text-to-image job with request ID: {} (model {})",
            job.request_id(),
            job.params.model_id
        );

        let permit = self.permit(cancel).await?;
        let envelope: JobEnvelope = self
            .send_signed(
                &permit,
                Method::POST,
                JOBS_PATH,
                body,
                Some(job.request_id()),
                cancel,
            )
            .await?;

        let remote = envelope.into_job();
        if remote.job_id.is_empty() {
            return Err(SubmitError::Permanent {
                reason: FailureReason::Rejected,
                message: "response carried no job id".to_string(),
            });
        }
        Ok(remote.job_id)
    }

    async fn poll_status(
        &self,
        request_id: &str,
        remote_job_id: &str,
        cancel: &CancelSignal,
    ) -> std::result::Result<StatusReport, PollError> {
        tracing::debug!("Checking status of job: {}", remote_job_id);

        let permit = self.permit(cancel).await?;
        let path = format!("{}/{}", JOBS_PATH, remote_job_id);
        let envelope: JobEnvelope = self
            .send_signed(&permit, Method::GET, &path, Vec::new(), Some(request_id), cancel)
            .await?;

        let job = envelope.into_job();
        Ok(StatusReport {
            status: job.status,
            progress: job.progress,
            message: job.message,
        })
    }

    async fn fetch_result(
        &self,
        request_id: &str,
        remote_job_id: &str,
        cancel: &CancelSignal,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let permit = self.permit(cancel).await?;
        let path = format!("{}/{}", JOBS_PATH, remote_job_id);
        let envelope: JobEnvelope = self
            .send_signed(&permit, Method::GET, &path, Vec::new(), Some(request_id), cancel)
            .await?;

        let job = envelope.into_job();
        let url = job.image_url().ok_or_else(|| {
            FetchError::Expired(format!("job {} reported no result image", remote_job_id))
        })?;

        tracing::info!("Fetching result image for job {}", remote_job_id);
        self.download(url, cancel).await
    }
}
