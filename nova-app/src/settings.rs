//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use nova_core::engine::DEFAULT_LIVE_MODEL;
use nova_core::transport::ws::DEFAULT_ENDPOINT;
use serde::{Deserialize, Serialize};

use crate::agents::{self, DEFAULT_AGENT_ID};

pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_TTS_VOICE: &str = "Kore";
const MAX_MEMORIES: usize = 64;

/// Environment variables checked, in order, before the stored key.
pub const API_KEY_ENV_VARS: &[&str] = &["NOVA_API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub agent: String,
    /// Live voice override. `None` uses the persona's default voice.
    pub voice: Option<String>,
    pub tts_voice: String,
    pub memories: Vec<String>,
    pub volume: f32,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub live_model: String,
    pub tts_model: String,
    pub endpoint: String,
    pub persist_transcripts: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            agent: DEFAULT_AGENT_ID.into(),
            voice: None,
            tts_voice: DEFAULT_TTS_VOICE.into(),
            memories: Vec::new(),
            volume: 1.0,
            preferred_input_device: None,
            preferred_output_device: None,
            live_model: DEFAULT_LIVE_MODEL.into(),
            tts_model: DEFAULT_TTS_MODEL.into(),
            endpoint: DEFAULT_ENDPOINT.into(),
            persist_transcripts: true,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.api_key = trimmed(self.api_key.take());
        self.agent = agents::normalize_agent_id(&self.agent);
        self.voice = trimmed(self.voice.take());
        self.tts_voice = or_default(&self.tts_voice, DEFAULT_TTS_VOICE);
        self.memories = normalize_memories(&self.memories);
        self.volume = if self.volume.is_finite() {
            self.volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.live_model = or_default(&self.live_model, DEFAULT_LIVE_MODEL);
        self.tts_model = or_default(&self.tts_model, DEFAULT_TTS_MODEL);
        self.endpoint = or_default(&self.endpoint, DEFAULT_ENDPOINT);
    }

    /// Key from the environment, falling back to the stored one.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_api_key_with(self, |name| std::env::var(name).ok())
    }

    /// Voice for live sessions with `agent`.
    pub fn live_voice(&self, agent: &agents::Agent) -> String {
        self.voice
            .clone()
            .unwrap_or_else(|| agent.default_voice.to_string())
    }

    /// Add a memory fact. Returns `false` for blanks and duplicates.
    pub fn add_memory(&mut self, fact: &str) -> bool {
        let fact = fact.trim();
        if fact.is_empty()
            || self.memories.len() >= MAX_MEMORIES
            || self.memories.iter().any(|m| m.eq_ignore_ascii_case(fact))
        {
            return false;
        }
        self.memories.push(fact.to_string());
        true
    }
}

fn resolve_api_key_with(
    settings: &AppSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    API_KEY_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .or_else(|| settings.api_key.clone())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn or_default(raw: &str, default: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        default.into()
    } else {
        value.into()
    }
}

fn normalize_memories(raw: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for fact in raw {
        let normalized = fact.trim();
        if normalized.is_empty() {
            continue;
        }
        if out.iter().any(|m: &String| m.eq_ignore_ascii_case(normalized)) {
            continue;
        }
        out.push(normalized.to_string());
        if out.len() >= MAX_MEMORIES {
            break;
        }
    }
    out
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Nova")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("nova")
            .join("settings.json")
    }
}

/// Missing or unreadable files yield defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
