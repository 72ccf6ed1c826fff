//! Environment-driven configuration.

use crate::models::{GenerationParams, DEFAULT_MODEL_ID};
use crate::orchestrator::OrchestratorPolicy;
use crate::service::DEFAULT_MAX_IN_FLIGHT;
use crate::signer::Credential;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_ENDPOINT: &str = "https://ap-east-1.tensorart.cloud";

/// Where the signing key comes from.
#[derive(Debug)]
pub enum PrivateKeySource {
    Path(PathBuf),
    Base64(SecretString),
}

#[derive(Debug)]
pub struct Config {
    pub app_id: String,
    pub api_key: Option<SecretString>,
    pub api_endpoint: String,
    pub private_key: PrivateKeySource,
    pub model_id: String,
    pub rate_limit_per_sec: usize,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    pub job_timeout: Duration,
    pub submit_max_attempts: usize,
    pub max_in_flight: usize,
    pub timeout_retries: usize,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` plugs in the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut missing = Vec::new();

        let app_id = get("TAMS_APP_ID");
        if app_id.is_none() {
            missing.push("TAMS_APP_ID");
        }

        let private_key = match (get("TAMS_PRIVATE_KEY_PATH"), get("TAMS_PRIVATE_KEY_BASE64")) {
            (Some(path), _) => Some(PrivateKeySource::Path(PathBuf::from(path))),
            (None, Some(encoded)) => Some(PrivateKeySource::Base64(SecretString::from(encoded))),
            (None, None) => {
                missing.push("TAMS_PRIVATE_KEY_PATH or TAMS_PRIVATE_KEY_BASE64");
                None
            }
        };

        let (Some(app_id), Some(private_key)) = (app_id, private_key) else {
            return Err(Error::Config(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        };

        let defaults = OrchestratorPolicy::default();

        Ok(Self {
            app_id,
            api_key: get("TAMS_API_KEY").map(SecretString::from),
            api_endpoint: get("TAMS_API_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            private_key,
            model_id: get("TAMS_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            rate_limit_per_sec: parse_or(&get, "TAMS_RATE_LIMIT_PER_SEC", 5)?,
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "TAMS_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            poll_max_interval: Duration::from_millis(parse_or(
                &get,
                "TAMS_POLL_MAX_INTERVAL_MS",
                defaults.poll_interval_max.as_millis() as u64,
            )?),
            job_timeout: Duration::from_secs(parse_or(
                &get,
                "TAMS_JOB_TIMEOUT_SECS",
                defaults.job_timeout.as_secs(),
            )?),
            submit_max_attempts: parse_or(
                &get,
                "TAMS_SUBMIT_MAX_ATTEMPTS",
                defaults.submit_max_attempts,
            )?,
            max_in_flight: parse_or(&get, "TAMS_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?,
            timeout_retries: parse_or(&get, "TAMS_TIMEOUT_RETRIES", 0)?,
            request_timeout: Duration::from_secs(parse_or(&get, "TAMS_REQUEST_TIMEOUT_SECS", 30)?),
        })
    }

    /// Load the signing credential. Never logs key material.
    pub fn credential(&self) -> Result<Credential> {
        let credential = match &self.private_key {
            PrivateKeySource::Path(path) => Credential::from_pem_file(self.app_id.clone(), path)?,
            PrivateKeySource::Base64(encoded) => {
                Credential::from_base64_pem(self.app_id.clone(), encoded.expose_secret())?
            }
        };
        Ok(credential)
    }

    pub fn policy(&self) -> OrchestratorPolicy {
        OrchestratorPolicy {
            submit_max_attempts: self.submit_max_attempts.max(1),
            poll_interval: self.poll_interval,
            poll_interval_max: self.poll_max_interval.max(self.poll_interval),
            job_timeout: self.job_timeout,
            ..OrchestratorPolicy::default()
        }
    }

    pub fn default_params(&self) -> GenerationParams {
        GenerationParams {
            model_id: self.model_id.clone(),
            ..GenerationParams::default()
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
