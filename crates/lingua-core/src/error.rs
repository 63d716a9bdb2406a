use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Out-of-order or unexpected client message. The text is sent to the
    /// client verbatim.
    #[error("{0}")]
    ProtocolViolation(String),

    #[error("Failed to start transcoder: {0}")]
    ProcessSpawn(String),

    #[error("Transcoder write failed: {0}")]
    TranscoderWrite(String),

    #[error("Transcoder failure: {0}")]
    TranscoderFailure(String),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Upstream stream error: {0}")]
    UpstreamStream(String),

    #[error("Client disconnected")]
    ClientDisconnect,

    #[error("Server busy: {active} of {max} sessions active")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "malformed_message",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::ProcessSpawn(_) => "process_spawn",
            Self::TranscoderWrite(_) => "transcoder_write",
            Self::TranscoderFailure(_) => "transcoder_failure",
            Self::UpstreamConnect(_) => "upstream_connect",
            Self::UpstreamStream(_) => "upstream_stream",
            Self::ClientDisconnect => "client_disconnect",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether this error ends the session with an `error` message to the
    /// client. A disconnect is the normal termination path.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ClientDisconnect)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
