//! Error handling and custom error types
//!
//! Provides unified error handling across the crate using thiserror. The
//! crate-level [`Error`] covers bootstrap and catalog failures; the job path
//! uses the narrower per-stage errors below so the orchestrator can tell
//! retryable conditions from final ones.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TAMS API error: {0}")]
    Remote(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Key or canonicalization failure. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("cannot canonicalize request: {0}")]
    Canonicalization(String),

    #[error("signature failed: {0}")]
    Signature(String),
}

/// Returned by the rate limiter when the caller gave up while waiting.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("rate permit acquisition cancelled")]
pub struct AcquireCancelled;

/// Stable, user-presentable category of a failed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    InvalidRequest,
    Unauthorized,
    InsufficientCredits,
    Rejected,
    ServiceUnavailable,
    GenerationFailed,
    ResultUnavailable,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidRequest => "invalid request",
            FailureReason::Unauthorized => "authentication failed",
            FailureReason::InsufficientCredits => "insufficient credits",
            FailureReason::Rejected => "request rejected",
            FailureReason::ServiceUnavailable => "service unavailable",
            FailureReason::GenerationFailed => "generation failed",
            FailureReason::ResultUnavailable => "result unavailable",
            FailureReason::Cancelled => "cancelled",
        }
    }

    /// Classify a non-retryable HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 404 | 422 => FailureReason::InvalidRequest,
            401 | 403 => FailureReason::Unauthorized,
            402 => FailureReason::InsufficientCredits,
            _ => FailureReason::Rejected,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("transient submit failure: {0}")]
    Transient(String),

    #[error("submit rejected ({reason}): {message}")]
    Permanent {
        reason: FailureReason,
        message: String,
    },

    #[error("submit cancelled")]
    Cancelled,
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Transient(_))
    }
}

impl From<AcquireCancelled> for SubmitError {
    fn from(_: AcquireCancelled) -> Self {
        SubmitError::Cancelled
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("transient poll failure: {0}")]
    Transient(String),

    #[error("poll rejected ({reason}): {message}")]
    Permanent {
        reason: FailureReason,
        message: String,
    },

    #[error("poll cancelled")]
    Cancelled,
}

impl From<AcquireCancelled> for PollError {
    fn from(_: AcquireCancelled) -> Self {
        PollError::Cancelled
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("result expired: {0}")]
    Expired(String),

    #[error("malformed result: {0}")]
    Malformed(String),

    #[error("result unavailable: {0}")]
    Unavailable(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl From<AcquireCancelled> for FetchError {
    fn from(_: AcquireCancelled) -> Self {
        FetchError::Cancelled
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidPromptError {
    #[error("Prompt cannot be empty. Please provide a description.")]
    Empty,

    #[error("Prompt is too short. Please provide at least {min} characters.")]
    TooShort { min: usize },

    #[error("Prompt is too long. Please keep it under {max} characters.")]
    TooLong { max: usize },

    #[error("Your prompt contains inappropriate content. Please try a different prompt.")]
    Blocked,
}

/// Terminal, caller-facing outcome of a failed `generate` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error(transparent)]
    InvalidPrompt(#[from] InvalidPromptError),

    #[error("generation failed: {reason}")]
    Failed { reason: FailureReason },

    #[error("generation timed out")]
    Timeout,

    #[error("generation cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Short message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            GenerationError::InvalidPrompt(e) => e.to_string(),
            GenerationError::Failed { reason } => match reason {
                FailureReason::Unauthorized => {
                    "Authentication error. Please contact the bot administrator.".to_string()
                }
                FailureReason::InsufficientCredits => {
                    "The image service is out of credits. Please try again later.".to_string()
                }
                FailureReason::ServiceUnavailable => {
                    "The image service is unavailable. Please try again later.".to_string()
                }
                other => format!("Failed to generate image: {}", other),
            },
            GenerationError::Timeout => {
                "The server took too long to respond. Please try again later.".to_string()
            }
            GenerationError::Cancelled => "Image generation was cancelled.".to_string(),
        }
    }

    /// Whether submitting the same prompt again could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout => true,
            GenerationError::Failed { reason } => matches!(
                reason,
                FailureReason::ServiceUnavailable
                    | FailureReason::GenerationFailed
                    | FailureReason::ResultUnavailable
            ),
            _ => false,
        }
    }
}
