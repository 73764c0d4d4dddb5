//! Sub-job execution: one variant of a task against the image provider.
//!
//! `SubJobExecutor::execute` never fails and never panics on provider errors;
//! every failure (including the wall-clock timeout) comes back as
//! `SubJobOutcome::Failure` so the fan-out can count it.

mod error;
mod provider;

pub use error::{classify_http_status, ProviderError, ProviderErrorKind};
pub use provider::{normalize_response, HttpImageProvider, ImageProvider, VariantRequest};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::task::{SubJobOutcome, TaskRequest};

/// Instructions cycled across variant indices so parallel calls diverge.
const VARIATION_INSTRUCTIONS: &[&str] = &[
    "Variant focus: a relaxed pose with a few unique background props.",
    "Variant focus: alternative camera angle and a different lighting mood.",
    "Variant focus: shifted colour saturation and a bolder artistic interpretation.",
    "Variant focus: a dynamic action pose with stronger contrast.",
];

/// Timeout reason reported for sub-jobs that exceed the wall-clock limit.
pub const TIMEOUT_REASON: &str = "timeout";

/// Runs a single variant of a task.
#[async_trait]
pub trait SubJobExecutor: Send + Sync {
    async fn execute(&self, request: &TaskRequest, variant_index: usize) -> SubJobOutcome;
}

/// Variation instruction for a variant index.
pub fn variation_instruction(variant_index: usize) -> &'static str {
    VARIATION_INSTRUCTIONS[variant_index % VARIATION_INSTRUCTIONS.len()]
}

/// Deterministic seed for a variant: SHA-256 over the prompt and the index.
pub fn variant_seed(prompt: &str, variant_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b":");
    hasher.update(variant_index.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Build the provider call for one variant.
pub fn variant_request(request: &TaskRequest, variant_index: usize) -> VariantRequest {
    let base = request.full_prompt();
    VariantRequest {
        prompt: format!("{} {}", base, variation_instruction(variant_index)),
        reference_image: request.reference_image.clone(),
        seed: variant_seed(&base, variant_index),
    }
}

/// Executor backed by an `ImageProvider`, with a hard timeout per sub-job.
pub struct ProviderExecutor {
    provider: Arc<dyn ImageProvider>,
    timeout: Duration,
    /// Extra tries for transient provider errors, inside the timeout
    max_retries: u32,
}

impl ProviderExecutor {
    pub fn new(provider: Arc<dyn ImageProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            max_retries: 1,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn call_with_retry(&self, call: &VariantRequest, variant_index: usize) -> SubJobOutcome {
        let mut attempt = 0;
        loop {
            match self.provider.generate(call).await {
                Ok(result_ref) => return SubJobOutcome::Success(result_ref),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = e.suggested_delay(attempt);
                    tracing::warn!(
                        variant = variant_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient provider error, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(variant = variant_index, "Sub-job failed: {}", e);
                    return SubJobOutcome::Failure(e.reason());
                }
            }
        }
    }
}

#[async_trait]
impl SubJobExecutor for ProviderExecutor {
    async fn execute(&self, request: &TaskRequest, variant_index: usize) -> SubJobOutcome {
        let call = variant_request(request, variant_index);
        match tokio::time::timeout(self.timeout, self.call_with_retry(&call, variant_index)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    variant = variant_index,
                    timeout_secs = self.timeout.as_secs(),
                    "Sub-job timed out"
                );
                SubJobOutcome::Failure(TIMEOUT_REASON.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that fails transiently a fixed number of times, then succeeds.
    struct FlakyProvider {
        failures: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ImageProvider for FlakyProvider {
        async fn generate(&self, request: &VariantRequest) -> Result<String, ProviderError> {
            tokio::time::sleep(self.delay).await;
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ProviderError::from_status(
                    503,
                    "busy".to_string(),
                    Some(Duration::from_millis(1)),
                ))
            } else {
                Ok(format!("https://img/{}.png", request.seed))
            }
        }
    }

    fn flaky(failures: usize, delay: Duration) -> Arc<FlakyProvider> {
        Arc::new(FlakyProvider {
            failures,
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[test]
    fn variants_get_distinct_prompts_and_seeds() {
        let request = TaskRequest::new("a knight", 3);
        let calls: Vec<VariantRequest> = (0..3).map(|i| variant_request(&request, i)).collect();
        assert_ne!(calls[0].prompt, calls[1].prompt);
        assert_ne!(calls[1].seed, calls[2].seed);
        assert_eq!(calls[0].seed, variant_request(&request, 0).seed);
        assert_eq!(calls[0].seed.len(), 32);
    }

    #[tokio::test]
    async fn transient_error_is_retried_once() {
        let provider = flaky(1, Duration::ZERO);
        let executor = ProviderExecutor::new(provider.clone(), Duration::from_secs(5));
        let outcome = executor.execute(&TaskRequest::new("a knight", 1), 0).await;
        assert!(outcome.is_success());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_errors_become_failures() {
        let executor = ProviderExecutor::new(flaky(10, Duration::ZERO), Duration::from_secs(5));
        let outcome = executor.execute(&TaskRequest::new("a knight", 1), 0).await;
        assert_eq!(
            outcome,
            SubJobOutcome::Failure("Server error (HTTP 503)".to_string())
        );
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let executor =
            ProviderExecutor::new(flaky(0, Duration::from_secs(5)), Duration::from_millis(20));
        let outcome = executor.execute(&TaskRequest::new("a knight", 1), 2).await;
        assert_eq!(outcome, SubJobOutcome::Failure(TIMEOUT_REASON.to_string()));
    }
}
