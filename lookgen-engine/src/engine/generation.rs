//! Generation service client
//!
//! **[GEN-EXT-010]** The generation service is an opaque remote procedure:
//! given a reference image and pose/slot parameters it eventually produces
//! zero or one artifact. Latency is arbitrary, transport errors are
//! routine. The trait seam lets tests substitute a scripted service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Slot, ViewKind};

/// Parameters for one generation call
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub output_id: Uuid,
    pub look_id: Uuid,
    pub view: ViewKind,
    pub slot: Slot,
    pub reference_image_url: String,
}

/// How a generation call settled
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    /// Artifact produced
    Completed { artifact_url: String },
    /// The service ran but produced nothing usable
    Failed { reason: String },
}

/// Transport-level failure: the call never settled
///
/// Distinct from [`GenerationOutcome::Failed`]: a transport error leaves
/// the Output retryable by a later dispatch tick, a generation failure
/// marks it failed.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("transport error: {0}")]
    Transport(String),
}

/// Seam between the dispatch loop and the remote generation service
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    status: String,
    artifact_url: Option<String>,
    error: Option<String>,
}

/// HTTP client for the hosted generation service
pub struct HttpGenerationService {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    rate_limiter: governor::DefaultDirectRateLimiter,
}

/// Transport attempts per call, with exponential backoff between them
const TRANSPORT_ATTEMPTS: u32 = 3;
const TRANSPORT_BACKOFF_BASE_MS: u64 = 1000;

impl HttpGenerationService {
    pub fn new(endpoint: String, api_key: String) -> Self {
        // Service rate limit: 2 requests/second on the generate endpoint.
        // Safe: 2 is always non-zero
        let quota = governor::Quota::per_second(std::num::NonZeroU32::new(2).unwrap());
        let rate_limiter = governor::RateLimiter::direct(quota);

        Self {
            endpoint,
            api_key,
            client: reqwest::Client::builder()
                // Generation is slow; the stall detector covers anything
                // beyond this.
                .timeout(Duration::from_secs(600))
                .build()
                .expect("Failed to build HTTP client (system error)"),
            rate_limiter,
        }
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/generate", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GenerationError::Transport(format!(
                "generation service returned {}",
                status
            )));
        }
        if !status.is_success() {
            // 4xx is a generation failure, not a transport problem:
            // retrying the same request will not change the answer.
            return Ok(GenerationOutcome::Failed {
                reason: format!("generation service rejected request: {}", status),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(format!("invalid response body: {}", e)))?;

        match body.status.as_str() {
            "completed" => match body.artifact_url {
                Some(artifact_url) => Ok(GenerationOutcome::Completed { artifact_url }),
                None => Ok(GenerationOutcome::Failed {
                    reason: "service reported completion without an artifact".to_string(),
                }),
            },
            _ => Ok(GenerationOutcome::Failed {
                reason: body
                    .error
                    .unwrap_or_else(|| format!("service status: {}", body.status)),
            }),
        }
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    /// One generation call with bounded transport retry
    ///
    /// Up to [`TRANSPORT_ATTEMPTS`] tries with exponential backoff; a call
    /// that still cannot settle surfaces as a transport error and the
    /// Output goes back to pending for a later tick.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        let mut backoff_ms = TRANSPORT_BACKOFF_BASE_MS;
        let mut last_error = None;

        for attempt in 1..=TRANSPORT_ATTEMPTS {
            match self.generate_once(request).await {
                Ok(outcome) => return Ok(outcome),
                Err(GenerationError::Transport(e)) => {
                    tracing::warn!(
                        output_id = %request.output_id,
                        attempt,
                        error = %e,
                        "Generation transport error"
                    );
                    last_error = Some(e);
                    if attempt < TRANSPORT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms *= 2;
                    }
                }
            }
        }

        Err(GenerationError::Transport(
            last_error.unwrap_or_else(|| "exhausted transport attempts".to_string()),
        ))
    }
}
