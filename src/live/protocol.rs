//! # Realtime Voice Wire Protocol
//!
//! JSON messages exchanged with the Gemini Live `BidiGenerateContent`
//! WebSocket.
//!
//! ## Client → Server:
//! - `setup`: model, response modality, system instruction, transcription options
//! - `realtimeInput`: base64 PCM16 microphone chunks
//!
//! ## Server → Client:
//! - `setupComplete`: handshake finished
//! - `serverContent`: model audio, transcriptions, `interrupted`, `turnComplete`
//! - `goAway`: the server will close the connection soon
//!
//! Server messages are flattened into [`ServerEvent`]s in the order the
//! session must apply them: transcription first, then either an interrupt or
//! the audio parts (an interrupted message carries no playable audio).

use crate::audio::capture::EncodedPacket;
use crate::live::error::{LiveError, LiveResult};
use serde::{Deserialize, Serialize};

/// Messages sent to the realtime service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object enabling a transcription stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    /// Session setup for an audio-only conversation.
    pub fn setup(model: &str, system_instruction: Option<&str>, transcribe_input: bool) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
            system_instruction: system_instruction
                .filter(|text| !text.trim().is_empty())
                .map(|text| Content {
                    parts: vec![TextPart { text: text.to_string() }],
                }),
            output_audio_transcription: Some(TranscriptionConfig {}),
            input_audio_transcription: transcribe_input.then(TranscriptionConfig::default),
        })
    }

    /// One captured microphone frame.
    pub fn audio(packet: &EncodedPacket) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: packet.mime_type.clone(),
                data: packet.data.clone(),
            }],
        })
    }

    pub fn to_json(&self) -> LiveResult<String> {
        serde_json::to_string(self).map_err(|e| LiveError::Decode(format!("cannot encode client message: {}", e)))
    }
}

/// Raw server message. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: bool,
    pub turn_complete: bool,
    pub output_transcription: Option<Transcription>,
    pub input_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPart {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The remote model ("Mind")
    Model,
    /// The local microphone ("You")
    User,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Model => "Mind",
            Speaker::User => "You",
        }
    }
}

/// What the session reacts to, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Transcription { speaker: Speaker, text: String },
    Interrupted,
    Audio { data: String, sample_rate: u32 },
    TurnComplete,
    GoAway { time_left: Option<String> },
}

/// Parse the `rate=` parameter of a PCM MIME type such as `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|&rate| rate > 0)
}

impl ServerMessage {
    pub fn parse(text: &str) -> LiveResult<Self> {
        serde_json::from_str(text).map_err(|e| LiveError::Decode(format!("malformed server message: {}", e)))
    }

    /// Flatten into events; audio without a rate falls back to `default_rate`.
    pub fn into_events(self, default_rate: u32) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            let transcriptions = [
                (Speaker::User, content.input_transcription),
                (Speaker::Model, content.output_transcription),
            ];
            for (speaker, transcription) in transcriptions {
                if let Some(text) = transcription.and_then(|t| t.text) {
                    events.push(ServerEvent::Transcription { speaker, text });
                }
            }

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            } else if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    let Some(inline) = part.inline_data else {
                        continue;
                    };
                    let is_audio = inline.mime_type.is_empty() || inline.mime_type.starts_with("audio/");
                    if inline.data.is_empty() || !is_audio {
                        continue;
                    }
                    events.push(ServerEvent::Audio {
                        sample_rate: parse_pcm_rate(&inline.mime_type).unwrap_or(default_rate),
                        data: inline.data,
                    });
                }
            }

            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}
