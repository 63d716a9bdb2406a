//! WebSocket connection lifecycle: admission, read/write loops.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lingua_core::protocol::{self, ServerMessage};

use crate::metrics;
use crate::relay::{InboundFrame, Relay};
use crate::state::GatewayState;

/// How long the writer may take to flush and close after the relay ends.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type InboundStream = Pin<Box<dyn Stream<Item = InboundFrame> + Send>>;

/// Handle a new audio-chat WebSocket connection.
pub async fn handle_audio_socket(state: Arc<GatewayState>, ws: WebSocket) {
    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, "New audio connection");

    let (mut ws_tx, ws_rx) = ws.split();

    let guard = match state.registry.try_register(&session_id) {
        Ok(guard) => guard,
        Err(e) => {
            metrics::record_rejected();
            warn!(session_id = %session_id, error = %e, "Rejecting connection");
            send_message(&mut ws_tx, &ServerMessage::Error(e.to_string())).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(state.config.relay().outbound_buffer.max(1));

    // Serialise all writes to the client through one task.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if !send_message(&mut ws_tx, &message).await {
                debug!("Client write failed, stopping writer");
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let relay = Relay::new(guard, state.relay_deps());
    let outcome = relay.run(inbound_frames(ws_rx), out_tx).await;

    match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(session_id = %session_id, %e, "Writer task failed"),
        Err(_) => warn!(session_id = %session_id, "Writer did not finish in time"),
    }
    info!(session_id = %session_id, outcome = outcome.label(), "Audio connection closed");
}

/// Encode and send one message. Returns false once the client is gone.
async fn send_message(ws_tx: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    let text = match protocol::encode(message) {
        Ok(text) => text,
        Err(e) => {
            error!(kind = message.kind(), %e, "Failed to encode server message");
            return true;
        }
    };
    ws_tx.send(Message::Text(text.into())).await.is_ok()
}

/// Adapt the WebSocket read half into relay frames. Ends on close or error.
fn inbound_frames(ws_rx: SplitStream<WebSocket>) -> InboundStream {
    Box::pin(futures::stream::unfold(ws_rx, |mut ws_rx| async move {
        loop {
            match ws_rx.next().await? {
                Ok(Message::Text(text)) => {
                    return Some((InboundFrame::Text(text.to_string()), ws_rx));
                }
                Ok(Message::Binary(bytes)) => {
                    return Some((InboundFrame::Binary(bytes.to_vec()), ws_rx));
                }
                Ok(Message::Close(_)) => {
                    debug!("Client sent close frame");
                    return None;
                }
                // Axum answers pings itself
                Ok(_) => continue,
                Err(e) => {
                    debug!(%e, "WebSocket read error");
                    return None;
                }
            }
        }
    }))
}
