//! Client for a self-hosted Ollama server.

use crate::config::OllamaConfig;
use crate::genai::error::{api_error, GenAiError, GenAiResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

/// Sampling options, named as Ollama expects them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: &'a OllamaOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
}

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    default_model: String,
    enabled: bool,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, config: &OllamaConfig, timeout: Duration) -> Self {
        Self {
            http,
            endpoint: config.endpoint.trim().trim_end_matches('/').to_string(),
            default_model: config.default_model.clone(),
            enabled: config.enabled,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn require_enabled(&self) -> GenAiResult<()> {
        if !self.enabled {
            return Err(GenAiError::NotConfigured("ollama.enabled is false".to_string()));
        }
        Ok(())
    }

    async fn check(response: reqwest::Response) -> GenAiResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &body))
    }

    /// Models installed on the server (`GET /api/tags`).
    pub async fn list_models(&self) -> GenAiResult<Vec<OllamaModel>> {
        self.require_enabled()?;
        let response = self
            .http
            .get(format!("{}/api/tags", self.endpoint))
            .timeout(self.timeout)
            .send()
            .await?;
        let tags: TagsResponse = Self::check(response).await?.json().await?;
        debug!(count = tags.models.len(), "Listed Ollama models");
        Ok(tags.models)
    }

    /// Single non-streaming completion (`POST /api/generate`).
    pub async fn generate(
        &self,
        prompt: &str,
        model: Option<&str>,
        system: Option<&str>,
        options: &OllamaOptions,
    ) -> GenAiResult<String> {
        self.require_enabled()?;
        let model = model.filter(|m| !m.trim().is_empty()).unwrap_or(&self.default_model);
        let body = generate_body(prompt, model, system, options);

        let response = self
            .http
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to query Ollama: {}", e);
                GenAiError::from(e)
            })?;
        let reply: GenerateReply = Self::check(response).await?.json().await?;
        Ok(reply.response)
    }
}

pub(crate) fn generate_body<'a>(
    prompt: &'a str,
    model: &'a str,
    system: Option<&'a str>,
    options: &'a OllamaOptions,
) -> GenerateBody<'a> {
    GenerateBody {
        model,
        prompt,
        system: system.filter(|s| !s.trim().is_empty()),
        stream: false,
        options,
    }
}
