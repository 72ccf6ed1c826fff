//! Signed job orchestration client for the Tensor Art TAMS image API
//!
//! A prompt goes through validation, becomes a [`models::GenerationJob`],
//! and is driven by a [`orchestrator::JobOrchestrator`] through submit, poll
//! and fetch. Every outbound call is signed by [`signer::Signer`] and gated
//! by one shared [`rate_limit::RateLimiter`].

pub mod app;
pub mod cancel;
pub mod config;
pub mod error;
pub mod image;
pub mod mime;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod rate_limit;
pub mod service;
pub mod signer;
pub mod transport;

pub use error::{Error, Result};
