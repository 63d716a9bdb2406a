//! Gemini Live client tests against an in-process WebSocket server.
//!
//! Run with: `cargo test -p lingua-providers --test integration`

use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use lingua_core::error::RelayError;
use lingua_providers::{
    GeminiLiveConnector, LiveConnector, LiveSession, LiveSessionParams, Modality, PCM_INPUT_MIME,
    UpstreamEvent,
};

type ServerWs = WebSocketStream<TcpStream>;

/// Accept one connection and hand it to `handler`. Returns the base URL.
async fn spawn_fake_upstream<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        handler(ws).await;
    });
    format!("ws://{addr}")
}

async fn next_json(ws: &mut ServerWs) -> Value {
    loop {
        let msg = ws.next().await.expect("client hung up").expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn accept_setup(ws: &mut ServerWs) -> Value {
    let setup = next_json(ws).await;
    ws.send(Message::text(json!({"setupComplete": {}}).to_string()))
        .await
        .unwrap();
    setup
}

async fn drain(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn close_with(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

fn connector(base: &str, setup_timeout: Duration) -> GeminiLiveConnector {
    GeminiLiveConnector::new(
        Some(base),
        "v1alpha",
        Some("test-key".into()),
        setup_timeout,
    )
}

fn params() -> LiveSessionParams {
    LiveSessionParams {
        model: "models/gemini-2.0-flash-exp".into(),
        response_modalities: vec![Modality::Audio],
        voice: "Puck".into(),
        system_instruction: "You are a friendly Spanish tutor.".into(),
        input_mime_type: PCM_INPUT_MIME.into(),
    }
}

#[tokio::test]
async fn test_round_trip_audio_and_events() {
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<Value>>();

    let base = spawn_fake_upstream(|mut ws| async move {
        let mut seen = vec![accept_setup(&mut ws).await];
        seen.push(next_json(&mut ws).await);
        seen.push(next_json(&mut ws).await);

        let reply = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQID"}},
                    {"text": "¡Hola! ¿Adónde quieres viajar?"}
                ]},
                "turnComplete": true
            }
        });
        ws.send(Message::text(reply.to_string())).await.unwrap();
        ws.send(close_with(CloseCode::Normal, "bye")).await.unwrap();
        let _ = seen_tx.send(seen);
        drain(ws).await;
    })
    .await;

    let session = connector(&base, Duration::from_secs(5))
        .open(&params())
        .await
        .unwrap_or_else(|e| panic!("open failed: {e}"));

    session.send_audio(&[1, 2, 3, 4], false).await.unwrap();
    session.send_audio(&[], true).await.unwrap();

    let events: Vec<UpstreamEvent> = session
        .receive()
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;
    assert_eq!(
        events,
        vec![
            UpstreamEvent::Audio(vec![1, 2, 3]),
            UpstreamEvent::Text("¡Hola! ¿Adónde quieres viajar?".into()),
            UpstreamEvent::TurnComplete,
        ]
    );
    assert!(session.receive().is_err(), "receive is take-once");

    session.close().await;
    session.close().await;

    let seen = seen_rx.await.unwrap();
    assert_eq!(seen[0]["setup"]["model"], "models/gemini-2.0-flash-exp");
    assert_eq!(
        seen[1]["realtimeInput"]["mediaChunks"][0],
        json!({"mimeType": "audio/pcm;rate=16000", "data": "AQIDBA=="})
    );
    assert_eq!(seen[2], json!({"clientContent": {"turnComplete": true}}));
}

#[tokio::test]
async fn test_abnormal_close_is_stream_error() {
    let base = spawn_fake_upstream(|mut ws| async move {
        accept_setup(&mut ws).await;
        ws.send(close_with(CloseCode::Error, "internal error"))
            .await
            .unwrap();
        drain(ws).await;
    })
    .await;

    let session = connector(&base, Duration::from_secs(5))
        .open(&params())
        .await
        .unwrap_or_else(|e| panic!("open failed: {e}"));

    let items: Vec<_> = session.receive().unwrap().collect().await;
    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(RelayError::UpstreamStream(msg)) => assert!(msg.contains("1011"), "got: {msg}"),
        other => panic!("expected UpstreamStream, got {other:?}"),
    }
    session.close().await;
}

#[tokio::test]
async fn test_setup_timeout_is_connect_error() {
    let base = spawn_fake_upstream(|mut ws| async move {
        let _setup = next_json(&mut ws).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let result = connector(&base, Duration::from_millis(200))
        .open(&params())
        .await;
    match result {
        Err(RelayError::UpstreamConnect(msg)) => assert!(msg.contains("timed out"), "got: {msg}"),
        Err(other) => panic!("expected UpstreamConnect, got {other:?}"),
        Ok(_) => panic!("open should time out"),
    }
}

#[tokio::test]
async fn test_rejected_setup_is_connect_error() {
    let base = spawn_fake_upstream(|mut ws| async move {
        let _setup = next_json(&mut ws).await;
        ws.send(close_with(CloseCode::Policy, "invalid model"))
            .await
            .unwrap();
        drain(ws).await;
    })
    .await;

    let result = connector(&base, Duration::from_secs(5)).open(&params()).await;
    match result {
        Err(RelayError::UpstreamConnect(msg)) => {
            assert!(msg.contains("closed during setup"), "got: {msg}");
            assert!(msg.contains("invalid model"), "got: {msg}");
        }
        Err(other) => panic!("expected UpstreamConnect, got {other:?}"),
        Ok(_) => panic!("open should fail"),
    }
}
