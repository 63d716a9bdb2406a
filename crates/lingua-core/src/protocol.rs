//! Client wire protocol for the audio-chat WebSocket.
//!
//! Text frames carry JSON control messages tagged by `type`. Audio inside a
//! JSON `audio` message is always base64; a binary frame is always raw audio
//! and is treated exactly like an `audio` message. Outbound messages are
//! always JSON text frames.
//!
//! Everything here is pure: no I/O, no state.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::session::{AssistMode, AudioFormat, SessionConfig};

/// A decoded inbound client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Config(SessionConfig),
    Audio(Vec<u8>),
    EndOfTurn,
    Close,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Audio(_) => "audio",
            Self::EndOfTurn => "end_turn",
            Self::Close => "close",
        }
    }
}

/// An outbound message to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Upstream is connected; the client may stream audio.
    Ready,
    Audio(Vec<u8>),
    Text(String),
    /// Fatal condition; the session closes after this.
    Error(String),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Audio(_) => "audio",
            Self::Text(_) => "text",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundWire {
    Config {
        language: String,
        topic: String,
        mode: AssistMode,
        #[serde(default)]
        format: AudioFormat,
    },
    Audio {
        data: String,
    },
    EndTurn,
    Close,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundWire<'a> {
    Ready,
    Audio { data: String },
    Text { data: &'a str },
    Error { message: &'a str },
}

/// Decode a JSON text frame.
pub fn decode_text(text: &str) -> Result<ClientMessage> {
    let wire: InboundWire =
        serde_json::from_str(text).map_err(|e| RelayError::MalformedMessage(e.to_string()))?;

    match wire {
        InboundWire::Config {
            language,
            topic,
            mode,
            format,
        } => {
            let language = language.trim();
            let topic = topic.trim();
            if language.is_empty() {
                return Err(RelayError::MalformedMessage(
                    "config field `language` must not be empty".into(),
                ));
            }
            if topic.is_empty() {
                return Err(RelayError::MalformedMessage(
                    "config field `topic` must not be empty".into(),
                ));
            }
            Ok(ClientMessage::Config(SessionConfig {
                language: language.to_string(),
                topic: topic.to_string(),
                mode,
                format,
            }))
        }
        InboundWire::Audio { data } => {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|e| RelayError::MalformedMessage(format!("invalid base64 audio: {e}")))?;
            Ok(ClientMessage::Audio(bytes))
        }
        InboundWire::EndTurn => Ok(ClientMessage::EndOfTurn),
        InboundWire::Close => Ok(ClientMessage::Close),
    }
}

/// Decode a binary frame. Binary frames are raw audio.
pub fn decode_binary(bytes: impl Into<Vec<u8>>) -> ClientMessage {
    ClientMessage::Audio(bytes.into())
}

/// Encode an outbound message as a JSON text frame.
pub fn encode(message: &ServerMessage) -> Result<String> {
    let wire = match message {
        ServerMessage::Ready => OutboundWire::Ready,
        ServerMessage::Audio(bytes) => OutboundWire::Audio {
            data: STANDARD.encode(bytes),
        },
        ServerMessage::Text(text) => OutboundWire::Text { data: text },
        ServerMessage::Error(message) => OutboundWire::Error { message },
    };
    Ok(serde_json::to_string(&wire)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_config() {
        let msg = decode_text(
            r#"{"type":"config","language":"Spanish","topic":"Travel","mode":"Assisted"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Config(SessionConfig {
                language: "Spanish".into(),
                topic: "Travel".into(),
                mode: AssistMode::Assisted,
                format: AudioFormat::Pcm,
            })
        );
    }

    #[test]
    fn test_decode_config_with_format() {
        let msg = decode_text(
            r#"{"type":"config","language":"French","topic":"Food","mode":"Non-Assisted","format":"webm"}"#,
        )
        .unwrap();
        let ClientMessage::Config(config) = msg else {
            panic!("expected config");
        };
        assert_eq!(config.mode, AssistMode::NonAssisted);
        assert_eq!(config.format, AudioFormat::Webm);
    }

    #[test]
    fn test_config_missing_field_is_malformed() {
        let err = decode_text(r#"{"type":"config","language":"Spanish","mode":"Assisted"}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedMessage(_)));
        assert!(err.to_string().contains("topic"), "got: {err}");
    }

    #[test]
    fn test_config_blank_language_is_malformed() {
        let err = decode_text(r#"{"type":"config","language":"  ","topic":"Travel","mode":"Assisted"}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedMessage(_)));
    }

    #[test]
    fn test_unknown_type_and_bad_json() {
        assert!(matches!(
            decode_text(r#"{"type":"dance"}"#),
            Err(RelayError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_text("not json"),
            Err(RelayError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode_text(r#"{"language":"Spanish"}"#),
            Err(RelayError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_audio_base64() {
        let msg = decode_text(r#"{"type":"audio","data":"AAEC"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Audio(vec![0, 1, 2]));

        let err = decode_text(r#"{"type":"audio","data":"%%%"}"#).unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(
            decode_text(r#"{"type":"end_turn"}"#).unwrap(),
            ClientMessage::EndOfTurn
        );
        assert_eq!(decode_text(r#"{"type":"close"}"#).unwrap(), ClientMessage::Close);
        assert_eq!(decode_binary(vec![9u8, 8]), ClientMessage::Audio(vec![9, 8]));
    }

    #[test]
    fn test_encode_outbound() {
        let ready: serde_json::Value =
            serde_json::from_str(&encode(&ServerMessage::Ready).unwrap()).unwrap();
        assert_eq!(ready, json!({"type": "ready"}));

        let audio: serde_json::Value =
            serde_json::from_str(&encode(&ServerMessage::Audio(vec![0, 1, 2])).unwrap()).unwrap();
        assert_eq!(audio, json!({"type": "audio", "data": "AAEC"}));

        let text: serde_json::Value =
            serde_json::from_str(&encode(&ServerMessage::Text("hola".into())).unwrap()).unwrap();
        assert_eq!(text, json!({"type": "text", "data": "hola"}));

        let error: serde_json::Value = serde_json::from_str(
            &encode(&ServerMessage::Error("First message must be config".into())).unwrap(),
        )
        .unwrap();
        assert_eq!(
            error,
            json!({"type": "error", "message": "First message must be config"})
        );
    }
}
