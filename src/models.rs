//! Data models and structures
//!
//! Defines the job lifecycle types driven by the orchestrator and the
//! request/response payloads exchanged with the TAMS API.

use crate::error::FailureReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_MODEL_ID: &str = "600423083519508503";
pub const DEFAULT_SAMPLER: &str = "DPM++ 2M Karras";

/// Tunable generation settings. Defaults mirror what the bot has always sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model_id: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub sampler: String,
    /// `None` asks the service for a random seed.
    pub seed: Option<u64>,
    pub negative_prompt: String,
    pub cfg_scale: f32,
    pub clip_skip: u32,
    pub sd_vae: String,
    pub count: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            width: 768,
            height: 768,
            steps: 25,
            sampler: DEFAULT_SAMPLER.to_string(),
            seed: None,
            negative_prompt: String::new(),
            cfg_scale: 7.0,
            clip_skip: 2,
            sd_vae: "Automatic".to_string(),
            count: 1,
        }
    }
}

/// Lifecycle of one generation job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            JobState::Created => 0,
            JobState::Submitted => 1,
            JobState::Running => 2,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Created => "CREATED",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// One remote generation request and everything observed about it.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    request_id: String,
    pub prompt: String,
    pub params: GenerationParams,
    state: JobState,
    pub remote_job_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub progress: Option<f64>,
    pub result: Option<Vec<u8>>,
    pub error: Option<FailureReason>,
}

impl GenerationJob {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            prompt: prompt.into(),
            params,
            state: JobState::Created,
            remote_job_id: None,
            submitted_at: None,
            last_polled_at: None,
            progress: None,
            result: None,
            error: None,
        }
    }

    /// Idempotency key; fixed for the life of the job.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move forward to `next`. Returns `false` (and leaves the job alone)
    /// for any backward, sideways, or post-terminal move.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            if self.state != next {
                tracing::warn!(
                    "Refusing job {} transition {} -> {}",
                    self.request_id,
                    self.state,
                    next
                );
            }
            return false;
        }
        self.state = next;
        true
    }

    /// Wire payload for `POST /v1/jobs`.
    pub fn to_request(&self) -> TextToImageRequest {
        let params = &self.params;
        let negative_prompts = if params.negative_prompt.is_empty() {
            Vec::new()
        } else {
            vec![TextPrompt {
                text: params.negative_prompt.clone(),
            }]
        };

        TextToImageRequest {
            request_id: self.request_id.clone(),
            stages: vec![
                Stage::InputInitialize {
                    input_initialize: InputInitialize {
                        seed: params
                            .seed
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-1".to_string()),
                        count: params.count,
                    },
                },
                Stage::Diffusion {
                    diffusion: Diffusion {
                        width: params.width,
                        height: params.height,
                        prompts: vec![TextPrompt {
                            text: self.prompt.clone(),
                        }],
                        negative_prompts,
                        sd_model: params.model_id.clone(),
                        sd_vae: params.sd_vae.clone(),
                        sampler: params.sampler.clone(),
                        steps: params.steps,
                        cfg_scale: params.cfg_scale,
                        clip_skip: params.clip_skip,
                    },
                },
            ],
        }
    }
}

// TAMS API Request/Response models
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPrompt {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputInitialize {
    pub seed: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diffusion {
    pub width: u32,
    pub height: u32,
    pub prompts: Vec<TextPrompt>,
    pub negative_prompts: Vec<TextPrompt>,
    pub sd_model: String,
    pub sd_vae: String,
    pub sampler: String,
    pub steps: u32,
    pub cfg_scale: f32,
    pub clip_skip: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    InputInitialize {
        #[serde(rename = "inputInitialize")]
        input_initialize: InputInitialize,
    },
    Diffusion {
        diffusion: Diffusion,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextToImageRequest {
    pub request_id: String,
    pub stages: Vec<Stage>,
}

/// Remote job status as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    #[serde(alias = "CREATED", alias = "PENDING", alias = "WAITING")]
    Queued,
    Running,
    #[serde(alias = "SUCCESS")]
    Completed,
    Failed,
    #[serde(alias = "CANCELLED")]
    Canceled,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Completed | RemoteStatus::Failed | RemoteStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JobResource {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SuccessInfo {
    #[serde(default)]
    pub images: Vec<JobResource>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    #[serde(alias = "id")]
    pub job_id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub credits: Option<f64>,
    #[serde(default)]
    pub resources: Vec<JobResource>,
    #[serde(default)]
    pub success_info: Option<SuccessInfo>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl JobResponse {
    /// First downloadable image, wherever the service put it.
    pub fn image_url(&self) -> Option<&str> {
        self.resources
            .iter()
            .chain(self.success_info.iter().flat_map(|s| s.images.iter()))
            .map(|r| r.url.as_str())
            .find(|url| !url.is_empty())
    }
}

/// The service answers either `{"job": {...}}` or the bare job object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JobEnvelope {
    Wrapped { job: JobResponse },
    Flat(JobResponse),
}

impl JobEnvelope {
    pub fn into_job(self) -> JobResponse {
        match self {
            JobEnvelope::Wrapped { job } | JobEnvelope::Flat(job) => job,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_serialization_matches_wire_contract() {
        let job = GenerationJob::new("a horse on cloud", GenerationParams::default());
        let value = serde_json::to_value(job.to_request()).unwrap();

        assert_eq!(value["requestId"], job.request_id());
        assert_eq!(value["stages"][0]["type"], "INPUT_INITIALIZE");
        assert_eq!(value["stages"][0]["inputInitialize"]["seed"], "-1");
        assert_eq!(value["stages"][0]["inputInitialize"]["count"], 1);
        assert_eq!(value["stages"][1]["type"], "DIFFUSION");

        let diffusion = &value["stages"][1]["diffusion"];
        assert_eq!(diffusion["width"], 768);
        assert_eq!(diffusion["prompts"][0]["text"], "a horse on cloud");
        assert_eq!(diffusion["negativePrompts"], serde_json::json!([]));
        assert_eq!(diffusion["sdModel"], DEFAULT_MODEL_ID);
        assert_eq!(diffusion["sdVae"], "Automatic");
        assert_eq!(diffusion["sampler"], DEFAULT_SAMPLER);
        assert_eq!(diffusion["clipSkip"], 2);
    }

    #[test]
    fn test_explicit_seed_and_negative_prompt() {
        let params = GenerationParams {
            seed: Some(1234),
            negative_prompt: "blurry".to_string(),
            ..GenerationParams::default()
        };
        let request = GenerationJob::new("a cat", params).to_request();

        match &request.stages[0] {
            Stage::InputInitialize { input_initialize } => {
                assert_eq!(input_initialize.seed, "1234")
            }
            other => panic!("unexpected stage {:?}", other),
        }
        match &request.stages[1] {
            Stage::Diffusion { diffusion } => {
                assert_eq!(diffusion.negative_prompts[0].text, "blurry")
            }
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = GenerationJob::new("x", GenerationParams::default());
        let b = GenerationJob::new("x", GenerationParams::default());
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn test_state_transitions_only_move_forward() {
        let mut job = GenerationJob::new("x", GenerationParams::default());
        assert!(job.advance(JobState::Submitted));
        assert!(job.advance(JobState::Running));
        assert!(!job.advance(JobState::Submitted));
        assert!(!job.advance(JobState::Created));
        assert!(!job.advance(JobState::Running));
        assert!(job.advance(JobState::Succeeded));
        assert!(!job.advance(JobState::Failed));
        assert_eq!(job.state(), JobState::Succeeded);
    }

    #[test]
    fn test_any_live_state_can_fail_or_time_out() {
        for start in [JobState::Created, JobState::Submitted, JobState::Running] {
            assert!(start.can_transition_to(JobState::Failed));
            assert!(start.can_transition_to(JobState::TimedOut));
        }
    }

    #[test]
    fn test_job_response_flat_and_wrapped() {
        let flat: JobEnvelope = serde_json::from_str(
            r#"{"jobId":"j1","status":"COMPLETED","resources":[{"url":"https://img/1.png","type":"IMAGE","name":"1"}]}"#,
        )
        .unwrap();
        let flat = flat.into_job();
        assert_eq!(flat.job_id, "j1");
        assert_eq!(flat.status, RemoteStatus::Completed);
        assert_eq!(flat.image_url(), Some("https://img/1.png"));

        let wrapped: JobEnvelope = serde_json::from_str(
            r#"{"job":{"id":"j2","status":"SUCCESS","successInfo":{"images":[{"url":"https://img/2.png"}]}}}"#,
        )
        .unwrap();
        let wrapped = wrapped.into_job();
        assert_eq!(wrapped.job_id, "j2");
        assert_eq!(wrapped.status, RemoteStatus::Completed);
        assert_eq!(wrapped.image_url(), Some("https://img/2.png"));
    }

    #[test]
    fn test_remote_status_aliases() {
        let parse = |s: &str| -> RemoteStatus {
            serde_json::from_value(serde_json::Value::String(s.to_string())).unwrap()
        };
        assert_eq!(parse("PENDING"), RemoteStatus::Queued);
        assert_eq!(parse("WAITING"), RemoteStatus::Queued);
        assert_eq!(parse("RUNNING"), RemoteStatus::Running);
        assert_eq!(parse("CANCELLED"), RemoteStatus::Canceled);
        assert_eq!(parse("SOMETHING_NEW"), RemoteStatus::Unknown);
        assert!(parse("FAILED").is_terminal());
        assert!(!parse("QUEUED").is_terminal());
    }
}
