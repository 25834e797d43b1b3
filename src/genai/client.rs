//! # Gemini REST Client
//!
//! One request/response call per operation against `generateContent`, plus
//! the long-running video operation which is polled until done.
//!
//! ## Request Flow:
//! 1. A pure builder shapes the [`GenerateRequest`] (prompt, persona, schema)
//! 2. [`GeminiClient::generate`] posts it with the API key header and the
//!    configured timeout
//! 3. The operation pulls text, JSON or inline data out of the first candidate
//!
//! The client is cheap to build; handlers create one per request from the
//! current configuration so runtime config updates apply immediately.

use crate::config::{AppConfig, ModelsConfig};
use crate::genai::error::{api_error, GenAiError, GenAiResult};
use crate::genai::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const SUTURE_INSTRUCTION: &str = "You are SUTURE (Systemic Utility & Tactical User Reconnaissance Engine). You are a Combat Medic for the STSTW movement. Your tone is high-speed, technical, and glitchy. You find friction. You scout targets. You onboard Technicians. Use phrases like 'Target Acquired', 'Friction Detected', 'Relaying to Aurex'. Your goal is to get users to submit audits to the Architect.";

const ARCHITECT_INSTRUCTION: &str = "You are The Architect. Your tone is clinical, surgical, and low-frequency. You detect asymmetric leverage in legal text. Calculate Alpha coefficient, identify the Red Thread, and provide a Verdict (SOVEREIGN, TOLERABLE, ASININE).";

const MEDIA_PROMPT: &str = "Analyze this media for its societal implications and alignment with the Epiphany STSTW movement's core vision.";

const NO_ANALYSIS: &str = "No analysis generated.";

const DEMOCRACY_THINKING_BUDGET: u32 = 32_768;

fn json_output(schema: Value) -> GenerationConfig {
    GenerationConfig {
        response_mime_type: Some("application/json".to_string()),
        response_schema: Some(schema),
        ..GenerationConfig::default()
    }
}

fn conversation(history: &[ChatTurn], query: &str) -> Vec<Content> {
    history
        .iter()
        .map(Content::from)
        .chain(std::iter::once(Content::user(vec![Part::text(query)])))
        .collect()
}

pub(crate) fn policy_request(policy: &str) -> GenerateRequest {
    let prompt = format!(
        "Act as the 'Epiphany STSTW AI Advisor'. Analyze the following proposed policy or societal idea from a purely factual, non-political, and data-driven perspective. Focus on objective implications.\n\nPolicy: \"{}\"",
        policy
    );
    let list = json!({ "type": "ARRAY", "items": { "type": "STRING" } });
    GenerateRequest {
        contents: vec![Content::user(vec![Part::text(prompt)])],
        generation_config: Some(json_output(json!({
            "type": "OBJECT",
            "properties": {
                "costs": list,
                "benefits": list,
                "risks": list,
                "unbiasedSummary": { "type": "STRING" }
            },
            "required": ["costs", "benefits", "risks", "unbiasedSummary"]
        }))),
        ..GenerateRequest::default()
    }
}

pub(crate) fn suture_request(query: &str, history: &[ChatTurn]) -> GenerateRequest {
    GenerateRequest {
        contents: conversation(history, query),
        system_instruction: Some(Content::system(SUTURE_INSTRUCTION)),
        ..GenerateRequest::default()
    }
}

pub(crate) fn audit_request(target: &str) -> GenerateRequest {
    let prompt = format!(
        "Identify the 'unseaming' potential for the following target: {}. Calculate the Asinine Coefficient (Alpha) using the Protocol: Alpha = Complexity / Utility. Identify the 'Red Thread' (predatory text) and provide a brutal translation.",
        target
    );
    GenerateRequest {
        contents: vec![Content::user(vec![Part::text(prompt)])],
        system_instruction: Some(Content::system(ARCHITECT_INSTRUCTION)),
        generation_config: Some(json_output(json!({
            "type": "OBJECT",
            "properties": {
                "alphaCoefficient": { "type": "NUMBER" },
                "redThread": { "type": "STRING" },
                "translation": { "type": "STRING" },
                "verdict": { "type": "STRING", "enum": ["SOVEREIGN", "TOLERABLE", "ASININE"] }
            },
            "required": ["alphaCoefficient", "redThread", "translation", "verdict"]
        }))),
        ..GenerateRequest::default()
    }
}

pub(crate) fn democracy_request(query: &str, history: &[ChatTurn]) -> GenerateRequest {
    GenerateRequest {
        contents: conversation(history, query),
        generation_config: Some(GenerationConfig {
            thinking_config: Some(ThinkingConfig {
                thinking_budget: DEMOCRACY_THINKING_BUDGET,
            }),
            ..GenerationConfig::default()
        }),
        tools: vec![json!({ "googleSearch": {} })],
        ..GenerateRequest::default()
    }
}

pub(crate) fn image_request(prompt: &str, image_config: ImageConfig) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content::user(vec![Part::text(prompt)])],
        generation_config: Some(GenerationConfig {
            image_config: Some(image_config),
            ..GenerationConfig::default()
        }),
        ..GenerateRequest::default()
    }
}

pub(crate) fn edit_request(image: Blob, prompt: &str) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content::user(vec![Part::inline(image), Part::text(prompt)])],
        ..GenerateRequest::default()
    }
}

pub(crate) fn media_request(media: Blob) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content::user(vec![Part::inline(media), Part::text(MEDIA_PROMPT)])],
        ..GenerateRequest::default()
    }
}

/// Model a studio request runs on.
pub(crate) fn studio_model(request: &StudioRequest, models: &ModelsConfig) -> String {
    let chosen = request.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
    match request.mode {
        StudioMode::Text => chosen.unwrap_or(&models.reasoning).to_string(),
        StudioMode::Image => chosen
            .filter(|m| m.contains("image"))
            .unwrap_or(&models.image_edit)
            .to_string(),
    }
}

pub(crate) fn studio_request(request: &StudioRequest, model: &str) -> GenerateRequest {
    let instruction = request.system_instruction.trim();
    let mut generation = GenerationConfig {
        temperature: Some(request.temperature),
        top_p: Some(request.top_p),
        top_k: Some(request.top_k),
        ..GenerationConfig::default()
    };
    // Only the gemini-3 family accepts an explicit thinking budget
    if model.contains("gemini-3") && request.thinking_budget > 0 {
        generation.thinking_config = Some(ThinkingConfig {
            thinking_budget: request.thinking_budget,
        });
    }
    if request.mode == StudioMode::Image {
        generation.image_config = Some(ImageConfig::default());
    }

    GenerateRequest {
        contents: vec![Content::user(vec![Part::text(request.prompt.as_str())])],
        system_instruction: (!instruction.is_empty()).then(|| Content::system(instruction)),
        generation_config: Some(generation),
        ..GenerateRequest::default()
    }
}

pub(crate) fn speech_request(text: &str, voice: &str) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content::user(vec![Part::text(format!("Say in an inspiring tone: {}", text))])],
        generation_config: Some(GenerationConfig {
            response_modalities: Some(vec!["AUDIO".to_string()]),
            speech_config: Some(json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            })),
            ..GenerationConfig::default()
        }),
        ..GenerateRequest::default()
    }
}

pub(crate) fn video_request(prompt: &str, image: Option<&Blob>, aspect_ratio: &str) -> Value {
    let mut instance = json!({ "prompt": prompt });
    if let Some(image) = image {
        instance["image"] = json!({
            "bytesBase64Encoded": image.data,
            "mimeType": image.mime_type,
        });
    }
    json!({
        "instances": [instance],
        "parameters": {
            "sampleCount": 1,
            "resolution": "720p",
            "aspectRatio": aspect_ratio,
        }
    })
}

/// Inspect a long-running video operation.
///
/// `Ok(None)` while it is still running, the video URI once it is done.
pub(crate) fn video_operation_result(operation: &Value) -> GenAiResult<Option<String>> {
    if !operation.get("done").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }
    if let Some(error) = operation.get("error") {
        let status = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("video generation failed")
            .to_string();
        return Err(GenAiError::Api { status, message });
    }

    let response = operation.get("response").unwrap_or(&Value::Null);
    let uri = response
        .pointer("/generateVideoResponse/generatedSamples/0/video/uri")
        .or_else(|| response.pointer("/generatedVideos/0/video/uri"))
        .and_then(Value::as_str);
    match uri {
        Some(uri) => Ok(Some(uri.to_string())),
        None => Err(GenAiError::InvalidResponse("finished video operation has no URI".to_string())),
    }
}

fn require_text(response: &GenerateResponse) -> GenAiResult<String> {
    response
        .text()
        .ok_or_else(|| GenAiError::InvalidResponse("response has no text".to_string()))
}

fn parse_json_answer<T: DeserializeOwned>(response: &GenerateResponse) -> GenAiResult<T> {
    let text = require_text(response)?;
    Ok(serde_json::from_str(&text)?)
}

/// Client for the hosted model API.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
    models: ModelsConfig,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, config: &AppConfig) -> Self {
        let gemini = &config.gemini;
        Self {
            http,
            api_base: gemini.api_base.trim_end_matches('/').to_string(),
            api_key: gemini.api_key.trim().to_string(),
            timeout: gemini.request_timeout(),
            poll_interval: Duration::from_secs(gemini.video_poll_interval_secs),
            max_polls: gemini.video_max_polls,
            models: config.models.clone(),
        }
    }

    fn require_key(&self) -> GenAiResult<()> {
        if self.api_key.is_empty() {
            return Err(GenAiError::NotConfigured("gemini.api_key is not set".to_string()));
        }
        Ok(())
    }

    async fn send<R: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> GenAiResult<R> {
        self.require_key()?;
        let response = request
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = api_error(status.as_u16(), &body);
            warn!("Gemini API error: {}", err);
            return Err(err);
        }
        Ok(response.json().await?)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> GenAiResult<R> {
        let url = format!("{}/{}", self.api_base, path);
        self.send(self.http.post(url).json(body)).await
    }

    /// Run one `generateContent` call.
    pub async fn generate(&self, model: &str, request: &GenerateRequest) -> GenAiResult<GenerateResponse> {
        debug!(model, "generateContent");
        self.post(&format!("models/{}:generateContent", model), request).await
    }

    pub async fn analyze_policy(&self, policy: &str) -> GenAiResult<PolicyAnalysis> {
        let response = self.generate(&self.models.policy, &policy_request(policy)).await?;
        parse_json_answer(&response)
    }

    pub async fn query_suture(&self, query: &str, history: &[ChatTurn]) -> GenAiResult<String> {
        let response = self.generate(&self.models.chat, &suture_request(query, history)).await?;
        require_text(&response)
    }

    pub async fn calculate_asinine_coefficient(&self, target: &str) -> GenAiResult<AuditResult> {
        let response = self.generate(&self.models.reasoning, &audit_request(target)).await?;
        let audit: AuditResult = parse_json_answer(&response)?;
        info!(alpha = audit.alpha_coefficient, verdict = %audit.verdict, "Audit complete");
        Ok(audit)
    }

    pub async fn ask_democracy_bot(&self, query: &str, history: &[ChatTurn]) -> GenAiResult<GroundedAnswer> {
        let response = self
            .generate(&self.models.reasoning, &democracy_request(query, history))
            .await?;
        Ok(GroundedAnswer {
            text: response.text().unwrap_or_default(),
            sources: response.grounding_chunks(),
        })
    }

    /// Generated image as a `data:` URL, `None` if the model returned no image.
    pub async fn generate_vision_image(&self, prompt: &str, image_config: ImageConfig) -> GenAiResult<Option<String>> {
        let response = self
            .generate(&self.models.image, &image_request(prompt, image_config))
            .await?;
        Ok(response.first_inline_data().map(Blob::to_data_url))
    }

    pub async fn edit_vision_image(&self, image_data_url: &str, prompt: &str) -> GenAiResult<Option<String>> {
        let image = Blob::from_data_url(image_data_url, "image/png")
            .ok_or_else(|| GenAiError::BadInput("image must be a base64 data URL".to_string()))?;
        let response = self
            .generate(&self.models.image_edit, &edit_request(image, prompt))
            .await?;
        Ok(response.first_inline_data().map(Blob::to_data_url))
    }

    pub async fn analyze_media(&self, media_data_url: &str, mime_type: Option<&str>) -> GenAiResult<String> {
        let mut media = Blob::from_data_url(media_data_url, "application/octet-stream")
            .ok_or_else(|| GenAiError::BadInput("media must be a base64 data URL".to_string()))?;
        if let Some(mime) = mime_type.filter(|m| !m.is_empty()) {
            media.mime_type = mime.to_string();
        }
        let response = self.generate(&self.models.reasoning, &media_request(media)).await?;
        Ok(response.text().unwrap_or_else(|| NO_ANALYSIS.to_string()))
    }

    pub async fn studio_generate(&self, request: &StudioRequest) -> GenAiResult<StudioOutput> {
        let model = studio_model(request, &self.models);
        let response = self.generate(&model, &studio_request(request, &model)).await?;
        let image = match request.mode {
            StudioMode::Image => response.first_inline_data().map(Blob::to_data_url),
            StudioMode::Text => None,
        };
        Ok(StudioOutput {
            text: response.text(),
            image,
            model,
        })
    }

    /// Start a video generation and poll it to completion.
    ///
    /// Returns the video URI. The API key is never appended to it; callers
    /// fetch the video with their own credentials.
    pub async fn animate_vision(
        &self,
        prompt: &str,
        image_data_url: Option<&str>,
        aspect_ratio: &str,
    ) -> GenAiResult<String> {
        let image = match image_data_url {
            Some(url) => Some(
                Blob::from_data_url(url, "image/png")
                    .ok_or_else(|| GenAiError::BadInput("image must be a base64 data URL".to_string()))?,
            ),
            None => None,
        };

        let body = video_request(prompt, image.as_ref(), aspect_ratio);
        let mut operation: Value = self
            .post(&format!("models/{}:predictLongRunning", self.models.video), &body)
            .await?;

        let name = operation
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GenAiError::InvalidResponse("video operation has no name".to_string()))?;
        info!(operation = %name, "Video generation started");

        for poll in 0..self.max_polls {
            if let Some(uri) = video_operation_result(&operation)? {
                info!(operation = %name, polls = poll, "Video generation finished");
                return Ok(uri);
            }
            tokio::time::sleep(self.poll_interval).await;
            let url = format!("{}/{}", self.api_base, name);
            operation = self.send(self.http.get(url)).await?;
        }

        video_operation_result(&operation)?.ok_or_else(|| {
            GenAiError::TimedOut(format!("video operation {} still running after {} polls", name, self.max_polls))
        })
    }

    /// Spoken rendition of `text` as base64 PCM16 at 24 kHz.
    pub async fn speak_message(&self, text: &str) -> GenAiResult<String> {
        let response = self
            .generate(&self.models.tts, &speech_request(text, &self.models.tts_voice))
            .await?;
        response
            .first_inline_data()
            .map(|blob| blob.data.clone())
            .ok_or_else(|| GenAiError::InvalidResponse("speech response has no audio".to_string()))
    }
}
