use thiserror::Error;

/// All errors produced by attune-core.
#[derive(Debug, Error)]
pub enum AttuneError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no usable audio device found")]
    AudioDeviceUnavailable,

    #[error("audio stream lost: {0}")]
    AudioStreamLost(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport failed after repeated reconnect attempts")]
    TransportFailed,

    #[error("handshake timed out waiting for server hello")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AttuneError {
    /// Whether this error should tear down the session.
    ///
    /// Recoverable errors are handled in-component and surfaced as metrics;
    /// only device/transport/config failures propagate to the state machine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AttuneError::Config(_)
                | AttuneError::AudioDeviceUnavailable
                | AttuneError::AudioStreamLost(_)
                | AttuneError::TransportFailed
        )
    }
}

pub type Result<T> = std::result::Result<T, AttuneError>;
