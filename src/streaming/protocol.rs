//! Live dialogue API protocol types
//!
//! JSON messages exchanged with the bidirectional live endpoint over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the `BidiGenerateContent` WebSocket endpoint
//! 2. Send `setup` (model, voice, system instruction, transcription toggles)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent`: agent audio, `interrupted`, input/output
//!    transcription fragments and `turnComplete`, in any combination
//! 6. `goAway` announces that the server will close the socket soon

use serde::{Deserialize, Serialize};

use crate::audio::pcm::encode_pcm16;

/// Live API WebSocket endpoint (API key appended as `key` query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Puck";

/// Session setup parameters. The core passes these through without
/// interpreting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSessionConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Requested output modality, e.g. "AUDIO"
    pub response_modality: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for LiveSessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: "You are a warm, talkative voice companion. Keep replies \
                                 conversational and never read stage directions aloud."
                .to_string(),
            response_modality: "AUDIO".to_string(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyObject>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`; presence switches a feature on.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyObject {}

/// One captured audio frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    /// Base64-encoded PCM16 little-endian bytes
    pub data: String,
    /// `audio/pcm;rate=<capture_rate>`
    pub mime_type: String,
}

impl MediaChunk {
    pub fn pcm16(samples: &[i16], sample_rate: u32) -> Self {
        Self {
            data: encode_pcm16(samples),
            mime_type: format!("audio/pcm;rate={}", sample_rate),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Messages sent from client to the live service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the setup message with the final system instruction text.
    pub fn setup(config: &LiveSessionConfig, system_instruction: &str) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.clone()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
            input_audio_transcription: config.input_transcription.then(EmptyObject::default),
            output_audio_transcription: config.output_transcription.then(EmptyObject::default),
        })
    }

    pub fn audio(chunk: MediaChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerContent {
    /// Base64 audio payloads carried by the model turn, in order.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .map(|data| data.data.as_str())
    }

    pub fn user_text(&self) -> Option<&str> {
        self.input_transcription.as_ref().map(|t| t.text.as_str())
    }

    pub fn agent_text(&self) -> Option<&str> {
        self.output_transcription.as_ref().map(|t| t.text.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Messages received from the live service. Unknown keys are ignored, so a
/// message with none of these fields deserializes to the default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}
