//! Google Gemini Live provider.
//!
//! Speaks the `BidiGenerateContent` WebSocket protocol: one `setup` message,
//! then `realtimeInput` audio chunks and `clientContent` turns going up, and
//! `serverContent` model turns coming back. Auth is via API key in the query
//! string.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use lingua_core::config::UpstreamConfig;
use lingua_core::error::{RelayError, Result};

use crate::{LiveConnector, LiveSession, LiveSessionParams, UpstreamEvent, UpstreamEventStream};

const DEFAULT_BASE_URL: &str = "wss://generativelanguage.googleapis.com";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GeminiLiveConnector {
    pub base_url: String,
    api_version: String,
    api_key: Option<String>,
    setup_timeout: Duration,
}

impl GeminiLiveConnector {
    pub fn new(
        base_url: Option<&str>,
        api_version: &str,
        api_key: Option<String>,
        setup_timeout: Duration,
    ) -> Self {
        // wss:// needs a process-level crypto provider; a no-op if one is installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_version: api_version.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            setup_timeout,
        }
    }

    pub fn from_config(upstream: &UpstreamConfig) -> Self {
        Self::new(
            upstream.base_url.as_deref(),
            &upstream.api_version,
            upstream.resolve_api_key(),
            upstream.setup_timeout(),
        )
    }

    fn endpoint(&self, api_key: &str) -> String {
        format!(
            "{}/ws/google.ai.generativelanguage.{}.GenerativeService.BidiGenerateContent?key={}",
            self.base_url, self.api_version, api_key
        )
    }

    async fn handshake(&self, url: &str, params: &LiveSessionParams) -> Result<WsStream> {
        let (mut ws, _response) = connect_async(url)
            .await
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

        ws.send(Message::text(setup_message(params).to_string()))
            .await
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
            let raw = match &msg {
                Message::Text(text) => text.as_str(),
                Message::Binary(bytes) => std::str::from_utf8(bytes).map_err(|e| {
                    RelayError::UpstreamConnect(format!("non-UTF-8 setup reply: {e}"))
                })?,
                Message::Close(frame) => {
                    return Err(RelayError::UpstreamConnect(format!(
                        "closed during setup{}",
                        describe_close(frame.as_ref())
                    )));
                }
                _ => continue,
            };
            let frame = parse_server_message(raw)
                .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
            if frame.setup_complete {
                return Ok(ws);
            }
        }

        Err(RelayError::UpstreamConnect(
            "connection ended during setup".into(),
        ))
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    fn id(&self) -> &str {
        "gemini-live"
    }

    async fn open(&self, params: &LiveSessionParams) -> Result<Arc<dyn LiveSession>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::UpstreamConnect("API key not configured".into()))?;
        let url = self.endpoint(api_key);

        debug!(model = %params.model, api_version = %self.api_version, "Opening Gemini Live session");

        let ws = tokio::time::timeout(self.setup_timeout, self.handshake(&url, params))
            .await
            .map_err(|_| {
                RelayError::UpstreamConnect("timed out waiting for setup acknowledgement".into())
            })??;

        info!(model = %params.model, voice = %params.voice, "Gemini Live session established");

        let (sink, stream) = ws.split();
        Ok(Arc::new(GeminiLiveSession {
            sink: Mutex::new(Some(sink)),
            stream: StdMutex::new(Some(stream)),
            input_mime_type: params.input_mime_type.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct GeminiLiveSession {
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: StdMutex<Option<SplitStream<WsStream>>>,
    input_mime_type: String,
    closed: AtomicBool,
}

impl GeminiLiveSession {
    async fn send_json(&self, value: serde_json::Value) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| RelayError::UpstreamStream("session closed".into()))?;
        sink.send(Message::text(value.to_string()))
            .await
            .map_err(|e| RelayError::UpstreamStream(e.to_string()))
    }
}

#[async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_audio(&self, chunk: &[u8], end_of_turn: bool) -> Result<()> {
        if !chunk.is_empty() {
            trace!(bytes = chunk.len(), "Sending audio upstream");
            self.send_json(audio_message(chunk, &self.input_mime_type))
                .await?;
        }
        if end_of_turn {
            debug!("Sending turn complete upstream");
            self.send_json(turn_complete_message()).await?;
        }
        Ok(())
    }

    async fn send_text(&self, text: &str, end_of_turn: bool) -> Result<()> {
        self.send_json(text_message(text, end_of_turn)).await
    }

    fn receive(&self) -> Result<UpstreamEventStream> {
        let stream = self
            .stream
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| RelayError::UpstreamStream("receive stream already taken".into()))?;

        let state = ReceiveState {
            stream,
            pending: VecDeque::new(),
            done: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.lock()).await {
            Ok(mut guard) => {
                if let Some(mut sink) = guard.take() {
                    if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                        debug!(error = %e, "Upstream close handshake failed");
                    }
                }
            }
            Err(_) => warn!("Upstream sink busy, dropping without close handshake"),
        }
        if let Ok(mut slot) = self.stream.lock() {
            slot.take();
        }
        debug!("Gemini Live session closed");
    }
}

struct ReceiveState {
    stream: SplitStream<WsStream>,
    pending: VecDeque<UpstreamEvent>,
    done: bool,
}

impl ReceiveState {
    async fn next_item(&mut self) -> Option<Result<UpstreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }

            let result = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => self.ingest(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(raw) => self.ingest(raw),
                    Err(e) => Err(RelayError::UpstreamStream(format!(
                        "non-UTF-8 server message: {e}"
                    ))),
                },
                Some(Ok(Message::Close(frame))) => {
                    self.done = true;
                    match frame {
                        Some(f) if f.code != CloseCode::Normal => Err(RelayError::UpstreamStream(
                            format!("closed{}", describe_close(Some(&f))),
                        )),
                        _ => {
                            debug!("Upstream closed normally");
                            Ok(())
                        }
                    }
                }
                Some(Ok(_)) => Ok(()),
                Some(Err(e)) => Err(RelayError::UpstreamStream(e.to_string())),
                None => Err(RelayError::UpstreamStream(
                    "connection ended without close frame".into(),
                )),
            };

            if let Err(e) = result {
                self.done = true;
                self.pending.clear();
                return Some(Err(e));
            }
        }
    }

    fn ingest(&mut self, raw: &str) -> Result<()> {
        let frame = parse_server_message(raw)?;
        self.pending.extend(frame.events);
        Ok(())
    }
}

fn describe_close(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) => format!(" with code {}: {}", u16::from(f.code), f.reason.as_str()),
        None => String::new(),
    }
}

// --- Gemini Live wire format ---

/// Initial `setup` message.
pub fn setup_message(params: &LiveSessionParams) -> serde_json::Value {
    json!({
        "setup": {
            "model": params.model,
            "generationConfig": {
                "responseModalities": params.response_modalities,
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": params.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": params.system_instruction }]
            }
        }
    })
}

/// One realtime audio chunk.
pub fn audio_message(chunk: &[u8], mime_type: &str) -> serde_json::Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": mime_type,
                "data": STANDARD.encode(chunk),
            }]
        }
    })
}

/// Marks the end of the learner's turn.
pub fn turn_complete_message() -> serde_json::Value {
    json!({ "clientContent": { "turnComplete": true } })
}

/// A user text turn.
pub fn text_message(text: &str, end_of_turn: bool) -> serde_json::Value {
    json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": end_of_turn,
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

/// A decoded server message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ServerFrame {
    pub setup_complete: bool,
    pub events: Vec<UpstreamEvent>,
}

/// Parse one server message into events, in part order.
pub fn parse_server_message(raw: &str) -> Result<ServerFrame> {
    let msg: ServerMessage = serde_json::from_str(raw)
        .map_err(|e| RelayError::UpstreamStream(format!("undecodable server message: {e}")))?;

    if msg.go_away.is_some() {
        warn!("Upstream announced imminent disconnect (goAway)");
    }

    let mut frame = ServerFrame {
        setup_complete: msg.setup_complete.is_some(),
        events: Vec::new(),
    };

    if let Some(content) = msg.server_content {
        if content.interrupted {
            debug!("Upstream turn interrupted");
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(inline) = part.inline_data {
                let bytes = STANDARD.decode(inline.data.as_bytes()).map_err(|e| {
                    RelayError::UpstreamStream(format!("invalid base64 inline data: {e}"))
                })?;
                frame.events.push(UpstreamEvent::Audio(bytes));
            }
            if let Some(text) = part.text {
                if !text.is_empty() {
                    frame.events.push(UpstreamEvent::Text(text));
                }
            }
        }
        if content.turn_complete {
            frame.events.push(UpstreamEvent::TurnComplete);
        }
    }

    Ok(frame)
}
