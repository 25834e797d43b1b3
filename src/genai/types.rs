//! Request and response shapes for the `generateContent` REST API, plus the
//! typed results the HTTP layer hands back to clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    pub fn system(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    /// Set on reasoning summaries; these are not part of the answer text
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn inline(blob: Blob) -> Self {
        Self {
            inline_data: Some(blob),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl Blob {
    /// Split a `data:<mime>;base64,<payload>` URL.
    ///
    /// Bare base64 is accepted too and gets `default_mime`.
    pub fn from_data_url(url: &str, default_mime: &str) -> Option<Self> {
        let url = url.trim();
        let Some(rest) = url.strip_prefix("data:") else {
            return (!url.is_empty()).then(|| Self {
                mime_type: default_mime.to_string(),
                data: url.to_string(),
            });
        };
        let (meta, data) = rest.split_once(',')?;
        let mime = meta.split(';').next().filter(|m| !m.is_empty()).unwrap_or(default_mime);
        (!data.is_empty()).then(|| Self {
            mime_type: mime.to_string(),
            data: data.to_string(),
        })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub aspect_ratio: String,
    pub image_size: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: "16:9".to_string(),
            image_size: "1K".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_config: Option<ImageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<Value>,
}

impl GenerateResponse {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .into_iter()
            .flat_map(|content| content.parts.iter())
    }

    /// Answer text of the first candidate, `None` if it has none.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .parts()
            .filter(|part| !part.thought)
            .filter_map(|part| part.text.as_deref())
            .collect();
        (!text.is_empty()).then_some(text)
    }

    pub fn first_inline_data(&self) -> Option<&Blob> {
        self.parts().find_map(|part| part.inline_data.as_ref())
    }

    pub fn grounding_chunks(&self) -> Vec<Value> {
        self.candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref())
            .map(|m| m.grounding_chunks.clone())
            .unwrap_or_default()
    }
}

/// One prior exchange in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// `"user"` or `"model"`
    pub role: String,
    pub text: String,
}

impl From<&ChatTurn> for Content {
    fn from(turn: &ChatTurn) -> Self {
        let role = if turn.role == "model" { "model" } else { "user" };
        Content {
            role: Some(role.to_string()),
            parts: vec![Part::text(turn.text.clone())],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAnalysis {
    pub costs: Vec<String>,
    pub benefits: Vec<String>,
    pub risks: Vec<String>,
    pub unbiased_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum Verdict {
    Sovereign,
    Tolerable,
    Asinine,
}

impl TryFrom<String> for Verdict {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SOVEREIGN" => Ok(Verdict::Sovereign),
            "TOLERABLE" => Ok(Verdict::Tolerable),
            "ASININE" => Ok(Verdict::Asinine),
            _ => Err(format!("unknown verdict '{}'", value)),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Sovereign => "SOVEREIGN",
            Verdict::Tolerable => "TOLERABLE",
            Verdict::Asinine => "ASININE",
        };
        f.write_str(label)
    }
}

/// Alpha = complexity / utility, with the clause that drives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    pub alpha_coefficient: f64,
    pub red_thread: String,
    pub translation: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundedAnswer {
    pub text: String,
    pub sources: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudioMode {
    #[default]
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudioBackend {
    #[default]
    Gemini,
    Ollama,
}

pub const STUDIO_SYSTEM_INSTRUCTION: &str = "You are the Epiphany STSTW Architect Assistant. Provide high-level technical and societal blueprints based on logic and data.";

/// Free-form prompt with tunable sampling. Missing fields take the studio defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StudioRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub system_instruction: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub thinking_budget: u32,
    pub mode: StudioMode,
    pub backend: StudioBackend,
}

impl Default for StudioRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: None,
            system_instruction: STUDIO_SYSTEM_INSTRUCTION.to_string(),
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            thinking_budget: 0,
            mode: StudioMode::Text,
            backend: StudioBackend::Gemini,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StudioOutput {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `data:` URL of a generated image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}
