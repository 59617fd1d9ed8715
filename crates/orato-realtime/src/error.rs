//! Error types for the realtime session engine

use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur in the realtime voice session engine
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("audio playback error: {0}")]
    Playback(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<cpal::DevicesError> for SessionError {
    fn from(err: cpal::DevicesError) -> Self {
        SessionError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for SessionError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        SessionError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for SessionError {
    fn from(err: cpal::BuildStreamError) -> Self {
        SessionError::AudioDevice(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for SessionError {
    fn from(err: cpal::PlayStreamError) -> Self {
        SessionError::AudioDevice(err.to_string())
    }
}
