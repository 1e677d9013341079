use thiserror::Error;

/// All errors produced by nova-core.
#[derive(Debug, Error)]
pub enum NovaError {
    /// No usable access key at session start. The caller should prompt for
    /// configuration; nothing was opened.
    #[error("no API key configured — set one before starting live mode")]
    MissingCredential,

    /// Microphone permission denied or no capture device present.
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),

    /// Any failure on the duplex connection. Always ends the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound audio payload. Recovered locally by dropping the chunk.
    #[error("audio decode error: {0}")]
    Decode(String),

    /// Transport-control call made in a state that does not allow it.
    #[error("invalid playback transition: cannot {action} while {state}")]
    PlaybackState {
        action: &'static str,
        state: &'static str,
    },

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("live session is already running")]
    AlreadyRunning,

    #[error("live session is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NovaError {
    /// Errors the user can fix by reconfiguring and retrying.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            NovaError::MissingCredential | NovaError::DeviceUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NovaError>;
