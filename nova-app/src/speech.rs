//! Text-to-speech fetch for turn-based playback.
//!
//! Calls the vendor `generateContent` endpoint with an AUDIO response
//! modality and a prebuilt voice, then turns the first inline audio part
//! (base64 PCM16, 24 kHz mono) into an [`AudioChunk`].

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nova_core::audio::pcm::{self, OUTPUT_SAMPLE_RATE};
use nova_core::AudioChunk;
use serde_json::{json, Value};
use tracing::{debug, info};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SpeechClient {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
}

impl SpeechClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    /// Synthesize `text` with a prebuilt `voice`.
    pub fn synthesize(&self, text: &str, voice: &str) -> Result<AudioChunk> {
        let text = text.trim();
        if text.is_empty() {
            bail!("nothing to say");
        }
        info!(model = %self.model, voice, chars = text.len(), "requesting speech");

        let response = self
            .client
            .post(format!("{API_BASE}/models/{}:generateContent", self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(text, voice))
            .send()
            .context("speech request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("speech request returned {status}: {}", body.trim());
        }

        let payload: Value = response.json().context("speech response was not JSON")?;
        let chunk = decode_audio(&payload)?;
        debug!(seconds = chunk.duration_secs(), "speech decoded");
        Ok(chunk)
    }
}

fn request_body(text: &str, voice: &str) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": text }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": voice }
                }
            }
        }
    })
}

/// Pull `candidates[0].content.parts[0].inlineData.data` out of a response.
fn decode_audio(payload: &Value) -> Result<AudioChunk> {
    let data = payload
        .pointer("/candidates/0/content/parts/0/inlineData/data")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("audio generation failed: response carried no audio"))?;
    let bytes = pcm::decode_base64(data)?;
    let chunk = AudioChunk::from_pcm16_le(&bytes, OUTPUT_SAMPLE_RATE)?;
    if chunk.is_empty() {
        bail!("audio generation failed: empty audio");
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_asks_for_audio_with_voice() {
        let body = request_body("hello", "Kore");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
    }

    #[test]
    fn inline_audio_decodes_at_24k() {
        let samples = vec![16_384i16; 2_400];
        let data = pcm::encode_base64(&pcm::encode_pcm16_le(&samples));
        let payload = json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "audio/L16;rate=24000", "data": data } }
            ]}}]
        });
        let chunk = decode_audio(&payload).unwrap();
        assert_eq!(chunk.sample_rate, 24_000);
        assert!((chunk.duration_secs() - 0.1).abs() < 1e-9);
        assert!((chunk.samples[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn missing_audio_is_an_error() {
        let payload = json!({ "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }] });
        let err = decode_audio(&payload).unwrap_err();
        assert!(err.to_string().contains("audio generation failed"));
    }
}
