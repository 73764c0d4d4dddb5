//! Image provider boundary and the OpenAI-compatible HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::error::ProviderError;
use crate::config::ProviderConfig;
use crate::task::ReferenceImage;
use crate::util::truncate_for_log;

/// One provider call for a single variant.
#[derive(Debug, Clone)]
pub struct VariantRequest {
    /// Final prompt, including the variation instruction
    pub prompt: String,
    pub reference_image: Option<ReferenceImage>,
    /// Deterministic per-variant seed, sent as the `user` tag
    pub seed: String,
}

/// Produces one image per call.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Returns a result reference: an image URL or a `data:` URL.
    async fn generate(&self, request: &VariantRequest) -> Result<String, ProviderError>;
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    user: &'a str,
}

/// OpenAI-compatible images API client.
pub struct HttpImageProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    size: String,
}

impl HttpImageProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            size: config.output_size.clone(),
        }
    }

    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn edit_form(&self, request: &VariantRequest, image: &ReferenceImage) -> Result<Form, ProviderError> {
        let part = Part::bytes(image.data.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|e| ProviderError::parse_error(format!("Invalid image type: {}", e)))?;
        Ok(Form::new()
            .part("image", part)
            .text("model", self.model.clone())
            .text("prompt", request.prompt.clone())
            .text("n", "1")
            .text("size", self.size.clone())
            .text("user", request.seed.clone()))
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn generate(&self, request: &VariantRequest) -> Result<String, ProviderError> {
        let builder = match &request.reference_image {
            Some(image) => self
                .client
                .post(format!("{}/images/edits", self.base_url))
                .multipart(self.edit_form(request, image)?),
            None => self
                .client
                .post(format!("{}/images/generations", self.base_url))
                .json(&GenerationRequest {
                    model: &self.model,
                    prompt: &request.prompt,
                    n: 1,
                    size: &self.size,
                    user: &request.seed,
                }),
        };

        let response = builder
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ProviderError::network_error(format!("Connection failed: {}", e))
                } else {
                    ProviderError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network_error(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(ProviderError::from_status(
                status.as_u16(),
                truncate_for_log(&body, 500),
                retry_after,
            ));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::parse_error(format!(
                "Failed to parse response: {}, body: {}",
                e,
                truncate_for_log(&body, 200)
            ))
        })?;

        normalize_response(&parsed)
            .ok_or_else(|| ProviderError::parse_error("No image in provider response".to_string()))
    }
}

/// Extract a result reference from a provider response.
///
/// Checked in order: `data[0].url`, top-level `url`, `data[0].b64_json` (as a PNG data URL).
pub fn normalize_response(body: &Value) -> Option<String> {
    let first = body.get("data").and_then(|d| d.get(0));
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    non_empty(first.and_then(|f| f.get("url")))
        .or_else(|| non_empty(body.get("url")))
        .or_else(|| {
            non_empty(first.and_then(|f| f.get("b64_json")))
                .map(|b64| format!("data:image/png;base64,{}", b64))
        })
}
