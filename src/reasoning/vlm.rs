//! OpenAI-compatible vision language model provider.
//!
//! Works against hosted chat-completions APIs and local servers that speak the
//! same protocol (llama.cpp, Ollama, vLLM). The screenshot travels as a base64
//! data URL: the PNG as captured, or a half-size JPEG once it exceeds
//! [`VlmConfig::image_limit`].
//!
//! # Configuration
//!
//! Defaults come from the environment (see [`crate::config`]):
//! - `MOBILE_PILOT_VLM_ENDPOINT`: chat completions URL
//! - `MOBILE_PILOT_VLM_MODEL`: model name
//! - `MOBILE_PILOT_VLM_API_KEY`: bearer token (falls back to `OPENAI_API_KEY`)
//! - `MOBILE_PILOT_VLM_MAX_TOKENS`, `MOBILE_PILOT_VLM_TEMPERATURE`
//! - `MOBILE_PILOT_VLM_CONNECT_TIMEOUT`: connection timeout (seconds)
//! - `MOBILE_PILOT_VLM_IMAGE_LIMIT_KB`: compression threshold

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;

use super::screenshot::compress_screenshot;
use super::{ReasoningProvider, StructuredPrompt, StructuredResponse};
use crate::config;
use crate::error::{ProviderError, ProviderResult};

/// Configuration for one VLM endpoint
#[derive(Debug, Clone)]
pub struct VlmConfig {
    /// Chat completions URL
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub connect_timeout: Duration,
    /// Upper bound for a whole request; the planner applies its own as well
    pub request_timeout: Duration,
    /// Screenshots larger than this many bytes are halved and sent as JPEG
    pub image_limit: usize,
}

impl Default for VlmConfig {
    fn default() -> Self {
        let cfg = config::get();
        Self {
            endpoint: cfg.provider.endpoint.clone(),
            model: cfg.provider.model.clone(),
            api_key: cfg.provider.api_key.clone(),
            max_tokens: cfg.provider.max_tokens,
            temperature: cfg.provider.temperature,
            connect_timeout: Duration::from_secs(cfg.provider.connect_timeout),
            request_timeout: cfg.limits.plan_timeout,
            image_limit: cfg.provider.image_limit_kb * 1024,
        }
    }
}

impl VlmConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn image_limit(mut self, bytes: usize) -> Self {
        self.image_limit = bytes;
        self
    }
}

/// Reasoning provider backed by a chat completions endpoint
#[derive(Debug, Clone)]
pub struct VlmProvider {
    name: String,
    config: VlmConfig,
    client: reqwest::Client,
}

impl VlmProvider {
    pub fn new(config: VlmConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            name: config.model.clone(),
            config,
            client,
        })
    }

    /// Override the name reported in logs (defaults to the model name)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &VlmConfig {
        &self.config
    }

    fn request_body(&self, prompt: &StructuredPrompt) -> Value {
        let mut content = Vec::new();
        let mut text = prompt.text.clone();
        if let Some(image) = &prompt.image {
            let shot = compress_screenshot(image, self.config.image_limit);
            // Element bounds and answers stay in device pixels
            if let Some((width, height)) = shot.scaled_to {
                text.push_str(&format!(
                    "\nThe screenshot is scaled down to {}x{}. Give coordinates in full screen pixels, as in the element list.\n",
                    width, height
                ));
            }
            let encoded = base64::engine::general_purpose::STANDARD.encode(&shot.data);
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", shot.mime, encoded) }
            }));
        }
        content.push(json!({ "type": "text", "text": text }));

        json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": content }
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": false
        })
    }

    fn map_transport(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.config.request_timeout)
        } else {
            ProviderError::from(err)
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Pull the completion text out of a chat completions envelope.
///
/// Thinking models may leave `content` empty and put the answer in
/// `reasoning_content`.
pub(crate) fn completion_text(response: &Value) -> ProviderResult<String> {
    let message = &response["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::InvalidResponse(
            "response has no choices[0].message".to_string(),
        ));
    }
    let content = message["content"].as_str().unwrap_or("").trim();
    let text = if content.is_empty() {
        message["reasoning_content"].as_str().unwrap_or("").trim()
    } else {
        content
    };
    if text.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "completion is empty".to_string(),
        ));
    }
    Ok(text.to_string())
}

#[async_trait]
impl ReasoningProvider for VlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn propose(&self, prompt: &StructuredPrompt) -> ProviderResult<StructuredResponse> {
        let body = self.request_body(prompt);
        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        tracing::debug!(provider = %self.name, endpoint = %self.config.endpoint, "sending completion request");
        let response = request.send().await.map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status.as_u16(), detail.trim());
            return Err(if is_retryable(status) {
                ProviderError::Unavailable(message)
            } else {
                ProviderError::InvalidResponse(message)
            });
        }

        let envelope: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.request_timeout)
            } else {
                ProviderError::InvalidResponse(format!("unreadable completion: {}", e))
            }
        })?;
        Ok(StructuredResponse::new(completion_text(&envelope)?))
    }
}

/// Check whether the server behind `endpoint` accepts connections.
///
/// Any HTTP answer counts as reachable; only transport failures do not.
pub async fn check_health(endpoint: &str, timeout: Duration) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else {
        return false;
    };
    let origin = url.origin().ascii_serialization();
    let Ok(client) = reqwest::Client::builder().timeout(timeout).build() else {
        return false;
    };
    match client.head(&origin).send().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(endpoint = %origin, error = %e, "health check failed");
            false
        }
    }
}
