//! Application wiring: configuration to signer, limiter, client and service.

use crate::cancel::CancelSignal;
use crate::config::Config;
use crate::error::GenerationError;
use crate::image::{ImageProcessor, ImageService, ProcessedImage};
use crate::models::{GenerationParams, ModelInfo};
use crate::rate_limit::RateLimiter;
use crate::service::ImagineService;
use crate::signer::Signer;
use crate::transport::TamsClient;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// One process-wide set of collaborators. Every job shares the same signer,
/// rate limiter and HTTP connection pool.
pub struct App {
    client: Arc<TamsClient>,
    service: ImagineService,
    image: Box<dyn ImageService>,
}

impl App {
    /// Build an app from concrete service dependencies.
    ///
    /// Integration tests use this to point the client at a local server.
    pub fn with_services(
        client: Arc<TamsClient>,
        service: ImagineService,
        image: Box<dyn ImageService>,
    ) -> Self {
        Self {
            client,
            service,
            image,
        }
    }

    /// Construct an app from environment configuration. Fails fast on a bad
    /// signing key.
    pub fn new(config: Config) -> Result<Self> {
        let signer = Arc::new(Signer::new(config.credential()?)?);
        info!(
            "Loaded signing key for app {} (endpoint {})",
            signer.app_id(),
            config.api_endpoint
        );

        let limiter = Arc::new(RateLimiter::per_second(config.rate_limit_per_sec));
        let policy = config.policy();
        let defaults = config.default_params();

        let mut client = TamsClient::new(
            signer,
            limiter,
            config.api_endpoint.as_str(),
            config.request_timeout,
        )?;
        if let Some(api_key) = config.api_key {
            client = client.with_api_key(api_key);
        }
        let client = Arc::new(client);

        let service = ImagineService::new(client.clone(), policy)
            .with_default_params(defaults)
            .with_max_in_flight(config.max_in_flight)
            .with_timeout_retries(config.timeout_retries);

        Ok(Self::with_services(
            client,
            service,
            Box::new(ImageProcessor::default()),
        ))
    }

    pub fn default_params(&self) -> GenerationParams {
        self.service.default_params()
    }

    /// Generate an image and prepare it for delivery.
    pub async fn imagine(
        &self,
        prompt: &str,
        params: GenerationParams,
        cancel: CancelSignal,
    ) -> std::result::Result<ProcessedImage, GenerationError> {
        let bytes = self
            .service
            .generate_with_cancel(prompt, params, cancel)
            .await?;
        Ok(self.image.prepare(&bytes).await)
    }

    pub async fn list_models(
        &self,
        page: u32,
        page_size: u32,
        model_type: &str,
    ) -> Result<Vec<ModelInfo>> {
        self.client.list_models(page, page_size, model_type).await
    }

    pub async fn model_details(&self, model_id: &str) -> Result<ModelInfo> {
        self.client.model_details(model_id).await
    }
}
