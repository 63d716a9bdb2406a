//! Session model: per-connection configuration and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How much the tutor intervenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssistMode {
    #[serde(rename = "Assisted", alias = "assisted", alias = "ASSISTED")]
    Assisted,
    #[serde(
        rename = "Non-Assisted",
        alias = "non-assisted",
        alias = "NON-ASSISTED",
        alias = "NonAssisted"
    )]
    NonAssisted,
}

impl AssistMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assisted => "Assisted",
            Self::NonAssisted => "Non-Assisted",
        }
    }
}

/// Audio format the client streams in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw PCM s16le mono 16 kHz, forwarded without transcoding.
    #[default]
    Pcm,
    Webm,
    Ogg,
    Mp4,
    Wav,
    /// Container is detected by the transcoder.
    Auto,
}

impl AudioFormat {
    pub fn needs_transcoding(&self) -> bool {
        !matches!(self, Self::Pcm)
    }

    /// Container name to declare to the transcoder, if any.
    pub fn container(&self) -> Option<&'static str> {
        match self {
            Self::Webm => Some("webm"),
            Self::Ogg => Some("ogg"),
            Self::Mp4 => Some("mp4"),
            Self::Wav => Some("wav"),
            Self::Pcm | Self::Auto => None,
        }
    }
}

/// Session configuration supplied by the client's first message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub language: String,
    pub topic: String,
    pub mode: AssistMode,
    #[serde(default)]
    pub format: AudioFormat,
}

/// Relay session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingConfig,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::AwaitingConfig, Self::Active)
                | (Self::AwaitingConfig, Self::Closed)
                | (Self::Active, Self::Draining)
                | (Self::Draining, Self::Closed)
        )
    }
}

/// One relay instance.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub config: Option<SessionConfig>,
    state: SessionState,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            config: None,
            state: SessionState::AwaitingConfig,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(session_id = %self.id, from = ?self.state, to = ?next, "Illegal session transition");
            return false;
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_happy_path() {
        let mut session = Session::new("s1");
        assert_eq!(session.state(), SessionState::AwaitingConfig);
        assert!(session.transition(SessionState::Active));
        assert!(session.transition(SessionState::Draining));
        assert!(session.transition(SessionState::Closed));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_closed_cannot_be_reentered() {
        let mut session = Session::new("s1");
        assert!(session.transition(SessionState::Closed));
        assert!(!session.transition(SessionState::AwaitingConfig));
        assert!(!session.transition(SessionState::Active));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_active_must_drain_before_close() {
        assert!(!SessionState::Active.can_transition_to(SessionState::Closed));
        assert!(!SessionState::AwaitingConfig.can_transition_to(SessionState::Draining));
    }

    #[test]
    fn test_audio_format_transcoding() {
        assert!(!AudioFormat::Pcm.needs_transcoding());
        assert!(AudioFormat::Webm.needs_transcoding());
        assert!(AudioFormat::Auto.needs_transcoding());
        assert_eq!(AudioFormat::Webm.container(), Some("webm"));
        assert_eq!(AudioFormat::Auto.container(), None);
    }

    #[test]
    fn test_assist_mode_aliases() {
        let mode: AssistMode = serde_json::from_str(r#""assisted""#).unwrap();
        assert_eq!(mode, AssistMode::Assisted);
        let mode: AssistMode = serde_json::from_str(r#""NonAssisted""#).unwrap();
        assert_eq!(mode, AssistMode::NonAssisted);
        assert_eq!(mode.as_str(), "Non-Assisted");
    }
}
