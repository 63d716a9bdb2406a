//! Upstream live-session abstraction.
//!
//! A [`LiveConnector`] opens one bidirectional streaming session per relay
//! session. The [`LiveSession`] carries PCM audio up and model audio/text
//! back down, in order, one wire message per call.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use lingua_core::error::Result;

pub mod gemini_live;
pub mod prompt;

pub use gemini_live::GeminiLiveConnector;

/// MIME type of the PCM the relay sends upstream.
pub const PCM_INPUT_MIME: &str = "audio/pcm;rate=16000";

/// Events produced by the upstream model, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Audio(Vec<u8>),
    Text(String),
    TurnComplete,
}

pub type UpstreamEventStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent>> + Send>>;

/// Response modalities the model can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

impl Modality {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUDIO" => Some(Self::Audio),
            "TEXT" => Some(Self::Text),
            _ => None,
        }
    }
}

/// Parameters for opening one upstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSessionParams {
    pub model: String,
    pub response_modalities: Vec<Modality>,
    pub voice: String,
    pub system_instruction: String,
    pub input_mime_type: String,
}

/// An open upstream session.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Send one PCM chunk. Empty chunks are not sent; `end_of_turn` adds a
    /// turn-complete message after the chunk.
    async fn send_audio(&self, chunk: &[u8], end_of_turn: bool) -> Result<()>;

    /// Send a client text turn.
    async fn send_text(&self, text: &str, end_of_turn: bool) -> Result<()>;

    /// Take the event stream. Fails on a second call.
    fn receive(&self) -> Result<UpstreamEventStream>;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Opens upstream sessions.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Connector identifier (e.g., "gemini-live").
    fn id(&self) -> &str;

    /// Connect and complete the setup handshake.
    async fn open(&self, params: &LiveSessionParams) -> Result<Arc<dyn LiveSession>>;
}
