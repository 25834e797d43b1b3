//! Proxies for the hosted model operations.
//!
//! Every handler validates its body, builds a [`crate::genai::GeminiClient`]
//! from the current configuration and makes exactly one backend call (video
//! generation polls until done). Nothing is retried.

use crate::audio::codec;
use crate::error::{AppError, AppResult};
use crate::genai::types::{ChatTurn, ImageConfig, StudioBackend, StudioOutput, StudioRequest};
use crate::genai::OllamaOptions;
use crate::handlers::require_text;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Sample rate of synthesized speech.
const TTS_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Deserialize)]
pub struct PolicyBody {
    pub policy: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationBody {
    pub query: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Deserialize)]
pub struct AuditBody {
    /// URL or pasted terms to audit
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageBody {
    pub prompt: String,
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditBody {
    /// `data:` URL (or bare base64) of the source image
    pub image: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct MediaBody {
    /// `data:` URL (or bare base64) of the media file
    pub data: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VideoBody {
    pub prompt: String,
    pub image: Option<String>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SpeechBody {
    pub text: String,
}

pub async fn analyze_policy(state: web::Data<AppState>, body: web::Json<PolicyBody>) -> AppResult<HttpResponse> {
    let policy = require_text("policy", &body.policy)?;
    let analysis = state.gemini().analyze_policy(policy).await?;
    Ok(HttpResponse::Ok().json(analysis))
}

pub async fn query_suture(state: web::Data<AppState>, body: web::Json<ConversationBody>) -> AppResult<HttpResponse> {
    let query = require_text("query", &body.query)?;
    let text = state.gemini().query_suture(query, &body.history).await?;
    Ok(HttpResponse::Ok().json(json!({ "text": text })))
}

pub async fn audit(state: web::Data<AppState>, body: web::Json<AuditBody>) -> AppResult<HttpResponse> {
    let target = require_text("target", &body.target)?;
    let result = state.gemini().calculate_asinine_coefficient(target).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn ask_democracy_bot(
    state: web::Data<AppState>,
    body: web::Json<ConversationBody>,
) -> AppResult<HttpResponse> {
    let query = require_text("query", &body.query)?;
    let answer = state.gemini().ask_democracy_bot(query, &body.history).await?;
    Ok(HttpResponse::Ok().json(answer))
}

pub async fn generate_image(state: web::Data<AppState>, body: web::Json<ImageBody>) -> AppResult<HttpResponse> {
    let prompt = require_text("prompt", &body.prompt)?;
    let defaults = ImageConfig::default();
    let image_config = ImageConfig {
        aspect_ratio: body.aspect_ratio.clone().unwrap_or(defaults.aspect_ratio),
        image_size: body.image_size.clone().unwrap_or(defaults.image_size),
    };
    let image = state.gemini().generate_vision_image(prompt, image_config).await?;
    Ok(HttpResponse::Ok().json(json!({ "image": image })))
}

pub async fn edit_image(state: web::Data<AppState>, body: web::Json<EditBody>) -> AppResult<HttpResponse> {
    let prompt = require_text("prompt", &body.prompt)?;
    let source = require_text("image", &body.image)?;
    let image = state.gemini().edit_vision_image(source, prompt).await?;
    Ok(HttpResponse::Ok().json(json!({ "image": image })))
}

pub async fn analyze_media(state: web::Data<AppState>, body: web::Json<MediaBody>) -> AppResult<HttpResponse> {
    let data = require_text("data", &body.data)?;
    let text = state.gemini().analyze_media(data, body.mime_type.as_deref()).await?;
    Ok(HttpResponse::Ok().json(json!({ "text": text })))
}

/// Free-form generation on either backend.
pub async fn studio(state: web::Data<AppState>, body: web::Json<StudioRequest>) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    require_text("prompt", &request.prompt)?;

    let output = match request.backend {
        StudioBackend::Gemini => state.gemini().studio_generate(&request).await?,
        StudioBackend::Ollama => {
            let ollama = state.ollama();
            let model = request
                .model
                .clone()
                .unwrap_or_else(|| state.get_config().ollama.default_model);
            let options = OllamaOptions {
                temperature: Some(request.temperature),
                top_p: Some(request.top_p),
                top_k: Some(request.top_k),
            };
            let text = ollama
                .generate(&request.prompt, Some(&model), Some(&request.system_instruction), &options)
                .await?;
            StudioOutput {
                model,
                text: Some(text),
                image: None,
            }
        }
    };
    Ok(HttpResponse::Ok().json(output))
}

/// Generate a short video. Blocks until the operation finishes or the poll
/// budget runs out.
pub async fn animate(state: web::Data<AppState>, body: web::Json<VideoBody>) -> AppResult<HttpResponse> {
    let prompt = require_text("prompt", &body.prompt)?;
    let image = body.image.as_deref().filter(|i| !i.trim().is_empty());
    let uri = state.gemini().animate_vision(prompt, image, &body.aspect_ratio).await?;
    info!(uri = %uri, "Video ready");
    Ok(HttpResponse::Ok().json(json!({ "uri": uri })))
}

/// Speak `text` and decode it to check the payload before returning it.
async fn synthesize(state: &AppState, text: &str) -> AppResult<(String, crate::audio::buffer::AudioBuffer)> {
    let audio = state.gemini().speak_message(text).await?;
    let buffer = codec::decode_base64_pcm(&audio, TTS_SAMPLE_RATE, 1)
        .map_err(|e| AppError::Upstream(format!("speech audio did not decode: {}", e)))?;
    Ok((audio, buffer))
}

pub async fn speak(state: web::Data<AppState>, body: web::Json<SpeechBody>) -> AppResult<HttpResponse> {
    let text = require_text("text", &body.text)?;
    let (audio, buffer) = synthesize(&state, text).await?;
    Ok(HttpResponse::Ok().json(json!({
        "audio": audio,
        "mime_type": format!("audio/pcm;rate={}", TTS_SAMPLE_RATE),
        "sample_rate": TTS_SAMPLE_RATE,
        "duration_seconds": buffer.duration_seconds()
    })))
}

pub async fn speak_wav(state: web::Data<AppState>, body: web::Json<SpeechBody>) -> AppResult<HttpResponse> {
    let text = require_text("text", &body.text)?;
    let (_, buffer) = synthesize(&state, text).await?;
    let wav = codec::wav_bytes(&buffer).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok().content_type("audio/wav").body(wav))
}
