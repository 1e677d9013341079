//! Wire contract between the engine and the hosted live model.
//!
//! The core types mirror the minimal contract the engine needs:
//!
//! ```text
//! open      { systemInstruction, responseModalities: ["AUDIO"], voice,
//!             inputAudioTranscription, outputAudioTranscription }
//! outbound  { media: { data: <base64>, mimeType: "audio/pcm;rate=16000" } }
//! inbound   { serverContent: { inputTranscription.text, outputTranscription.text,
//!             turnComplete, modelTurn.parts[].inlineData.data, interrupted } }
//! ```
//!
//! `to_wire` functions map the open request and outbound media onto the
//! Gemini Live bidirectional JSON format. Inbound messages already use the
//! same field names, so [`ServerMessage`] deserializes them directly.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audio::pcm::INPUT_MIME_TYPE;
use crate::buffering::frame::AudioFrame;
use crate::error::{NovaError, Result};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Session open request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub model: String,
    pub system_instruction: String,
    pub response_modalities: Vec<String>,
    pub voice: String,
    pub input_audio_transcription: bool,
    pub output_audio_transcription: bool,
}

impl SetupRequest {
    /// Audio-only request with both transcriptions enabled.
    pub fn audio(model: impl Into<String>, system_instruction: String, voice: String) -> Self {
        Self {
            model: model.into(),
            system_instruction,
            response_modalities: vec!["AUDIO".to_owned()],
            voice,
            input_audio_transcription: true,
            output_audio_transcription: true,
        }
    }

    /// Gemini Live `setup` message.
    pub fn to_wire(&self) -> Value {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        let mut setup = json!({
            "model": model,
            "generationConfig": {
                "responseModalities": self.response_modalities,
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": self.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": self.system_instruction }]
            }
        });
        if self.input_audio_transcription {
            setup["inputAudioTranscription"] = json!({});
        }
        if self.output_audio_transcription {
            setup["outputAudioTranscription"] = json!({});
        }
        json!({ "setup": setup })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    /// Base64 payload.
    pub data: String,
    pub mime_type: String,
}

/// One outbound realtime message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub media: MediaBlob,
}

impl OutboundMessage {
    /// Wrap a captured microphone frame. Consumes the frame.
    pub fn audio(frame: AudioFrame) -> Self {
        Self {
            media: MediaBlob {
                data: frame.to_base64(),
                mime_type: INPUT_MIME_TYPE.to_owned(),
            },
        }
    }

    /// Gemini Live `realtimeInput` message.
    pub fn to_wire(&self) -> Value {
        json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": self.media.mime_type,
                    "data": self.media.data,
                }]
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub server_content: Option<ServerContent>,
    /// Present once after the open request is accepted. Informational.
    pub setup_complete: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    pub model_turn: Option<ModelTurn>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub data: String,
    pub mime_type: Option<String>,
}

/// One dispatchable unit extracted from a [`ServerMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    InputTranscript(String),
    OutputTranscript(String),
    Interrupted,
    /// Base64 PCM16 at the output rate.
    Audio(String),
    TurnComplete,
}

impl ServerMessage {
    /// Parse one inbound JSON frame.
    ///
    /// # Errors
    /// `NovaError::Decode` when the frame is not valid JSON for this shape.
    pub fn from_wire(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| NovaError::Decode(format!("server message: {e}")))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into events, in dispatch order: input transcript, output
    /// transcript, interrupted, audio parts, turn complete.
    pub fn into_events(self) -> Vec<LiveEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(LiveEvent::InputTranscript(text));
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(LiveEvent::OutputTranscript(text));
            }
        }
        if content.interrupted == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .filter(|d| !d.data.is_empty())
                    .map(|d| LiveEvent::Audio(d.data)),
            );
        }
        if content.turn_complete == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
        events
    }
}

/// Builders for inbound messages, used by scripted transports and tests.
impl ServerMessage {
    pub fn input_transcript(text: &str) -> Self {
        Self::content(ServerContent {
            input_transcription: Some(Transcription {
                text: Some(text.to_owned()),
            }),
            ..Default::default()
        })
    }

    pub fn output_transcript(text: &str) -> Self {
        Self::content(ServerContent {
            output_transcription: Some(Transcription {
                text: Some(text.to_owned()),
            }),
            ..Default::default()
        })
    }

    pub fn audio(base64_pcm: &str) -> Self {
        Self::content(ServerContent {
            model_turn: Some(ModelTurn {
                parts: vec![Part {
                    text: None,
                    inline_data: Some(InlineData {
                        data: base64_pcm.to_owned(),
                        mime_type: Some("audio/pcm;rate=24000".to_owned()),
                    }),
                }],
            }),
            ..Default::default()
        })
    }

    pub fn interrupted() -> Self {
        Self::content(ServerContent {
            interrupted: Some(true),
            ..Default::default()
        })
    }

    pub fn turn_complete() -> Self {
        Self::content(ServerContent {
            turn_complete: Some(true),
            ..Default::default()
        })
    }

    fn content(content: ServerContent) -> Self {
        Self {
            server_content: Some(content),
            setup_complete: None,
        }
    }
}
