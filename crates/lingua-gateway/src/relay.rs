//! Relay orchestrator. Owns one session from the config handshake to close.
//!
//! After the handshake the relay runs up to four concurrent flows:
//!
//! - inbound: client frames to the transcoder (or straight upstream for PCM)
//! - forward: transcoder PCM to upstream
//! - outbound: upstream events to the client
//! - diagnostics: transcoder failure lines and process exit
//!
//! The first flow to finish moves the session to draining. Remaining flows
//! are cancelled and joined, both adapters are released, and at most one
//! `error` message is sent before the outbound channel closes.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use lingua_core::config::{RelayConfig, UpstreamConfig};
use lingua_core::error::{RelayError, Result};
use lingua_core::protocol::{self, ClientMessage, ServerMessage};
use lingua_core::session::{SessionConfig, SessionState};
use lingua_media::{DiagnosticStream, PcmStream, Transcoder, TranscoderEvent, TranscoderLauncher};
use lingua_providers::{LiveConnector, LiveSession, UpstreamEvent, UpstreamEventStream, prompt};

use crate::metrics;
use crate::registry::SessionGuard;

pub const FIRST_MESSAGE_MUST_BE_CONFIG: &str = "First message must be config";
pub const HANDSHAKE_TIMED_OUT: &str = "Timed out waiting for config";
pub const CONFIG_ALREADY_RECEIVED: &str = "Config already received";

/// One frame read from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// What a relay needs to open its adapters.
#[derive(Clone)]
pub struct RelayDeps {
    pub connector: Arc<dyn LiveConnector>,
    pub launcher: Arc<dyn TranscoderLauncher>,
    pub upstream: UpstreamConfig,
    pub settings: RelayConfig,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Upstream finished its stream.
    Completed,
    /// The client sent `close`.
    ClientClosed,
    /// The client transport went away.
    ClientDisconnected,
    /// A fatal error; it was reported to the client.
    Failed(RelayError),
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientClosed => "client_closed",
            Self::ClientDisconnected => "client_disconnected",
            Self::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&RelayError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Flow {
    Inbound,
    Forward,
    Outbound,
    Diagnostics,
}

#[derive(Debug)]
enum FlowExit {
    Completed,
    ClientClosed,
    Error(RelayError),
    Cancelled,
}

struct Adapters {
    transcoder: Option<Arc<dyn Transcoder>>,
    upstream: Arc<dyn LiveSession>,
}

struct Streams {
    events: UpstreamEventStream,
    pcm: Option<PcmStream>,
    diagnostics: Option<DiagnosticStream>,
}

impl Adapters {
    fn take_streams(&self) -> Result<Streams> {
        let events = self.upstream.receive()?;
        let (pcm, diagnostics) = match &self.transcoder {
            Some(t) => (Some(t.read()?), Some(t.diagnostics()?)),
            None => (None, None),
        };
        Ok(Streams {
            events,
            pcm,
            diagnostics,
        })
    }

    async fn release(&self) {
        let stop_transcoder = async {
            if let Some(t) = &self.transcoder {
                t.stop().await;
            }
        };
        tokio::join!(stop_transcoder, self.upstream.close());
        debug!("Adapters released");
    }
}

pub struct Relay {
    guard: SessionGuard,
    deps: RelayDeps,
}

impl Relay {
    pub fn new(guard: SessionGuard, deps: RelayDeps) -> Self {
        Self { guard, deps }
    }

    pub fn session_id(&self) -> &str {
        self.guard.id()
    }

    /// Drive the session to completion. `outbound` is dropped before this
    /// returns, which lets the writer close the client transport.
    pub async fn run<S>(self, inbound: S, outbound: mpsc::Sender<ServerMessage>) -> SessionOutcome
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    {
        let span = info_span!("relay", session_id = %self.guard.id());
        self.run_inner(inbound, outbound).instrument(span).await
    }

    async fn run_inner<S>(self, inbound: S, outbound: mpsc::Sender<ServerMessage>) -> SessionOutcome
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    {
        metrics::record_session_start();
        let started = Instant::now();

        let outcome = self.drive(inbound, &outbound).await;

        if let Some(err) = outcome.error() {
            warn!(kind = err.kind(), error = %err, "Session failed");
            metrics::record_error(err.kind());
            let report = outbound.send(ServerMessage::Error(err.to_string()));
            match tokio::time::timeout(self.deps.settings.drain_grace(), report).await {
                Ok(Ok(())) => {}
                _ => debug!("Could not deliver error to client"),
            }
        }
        drop(outbound);

        if !self.guard.transition(SessionState::Closed) {
            warn!(state = ?self.guard.state(), "Session could not be marked closed");
        }
        metrics::record_session_end(outcome.label(), started.elapsed().as_secs_f64());
        info!(outcome = outcome.label(), "Session closed");
        outcome
    }

    async fn drive<S>(&self, mut inbound: S, outbound: &mpsc::Sender<ServerMessage>) -> SessionOutcome
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    {
        let config = match self.await_config(&mut inbound).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                info!("Client disconnected before config");
                return SessionOutcome::ClientDisconnected;
            }
            Err(e) => return SessionOutcome::Failed(e),
        };
        info!(
            language = %config.language,
            topic = %config.topic,
            mode = config.mode.as_str(),
            format = ?config.format,
            "Session configured"
        );
        self.guard.set_config(config.clone());

        let adapters = match self.open(&config).await {
            Ok(adapters) => adapters,
            Err(e) => return SessionOutcome::Failed(e),
        };
        let streams = match adapters.take_streams() {
            Ok(streams) => streams,
            Err(e) => {
                adapters.release().await;
                return SessionOutcome::Failed(e);
            }
        };

        if outbound.send(ServerMessage::Ready).await.is_err() {
            adapters.release().await;
            return SessionOutcome::ClientDisconnected;
        }
        self.guard.transition(SessionState::Active);
        info!("Session active");

        self.supervise(adapters, streams, inbound, outbound.clone())
            .await
    }

    /// Wait for the first client message, which must be `config`.
    async fn await_config<S>(&self, inbound: &mut S) -> Result<Option<SessionConfig>>
    where
        S: Stream<Item = InboundFrame> + Unpin,
    {
        let first = tokio::time::timeout(self.deps.settings.handshake_timeout(), inbound.next())
            .await
            .map_err(|_| RelayError::ProtocolViolation(HANDSHAKE_TIMED_OUT.into()))?;

        match first {
            None => Ok(None),
            Some(InboundFrame::Binary(_)) => {
                Err(RelayError::ProtocolViolation(FIRST_MESSAGE_MUST_BE_CONFIG.into()))
            }
            Some(InboundFrame::Text(text)) => match protocol::decode_text(&text)? {
                ClientMessage::Config(config) => Ok(Some(config)),
                other => {
                    debug!(kind = other.kind(), "Message before config");
                    Err(RelayError::ProtocolViolation(FIRST_MESSAGE_MUST_BE_CONFIG.into()))
                }
            },
        }
    }

    /// Start the transcoder (when the format needs one), then upstream.
    async fn open(&self, config: &SessionConfig) -> Result<Adapters> {
        let transcoder = if config.format.needs_transcoding() {
            Some(self.deps.launcher.start(config.format)?)
        } else {
            None
        };

        let params = prompt::build_session_params(config, &self.deps.upstream);
        let upstream = match self.deps.connector.open(&params).await {
            Ok(session) => session,
            Err(e) => {
                if let Some(t) = &transcoder {
                    t.stop().await;
                }
                return Err(e);
            }
        };
        debug!(connector = self.deps.connector.id(), "Upstream session open");

        let adapters = Adapters {
            transcoder,
            upstream,
        };

        if self.deps.settings.assistant_speaks_first {
            let greeting = prompt::build_greeting(config);
            if let Err(e) = adapters.upstream.send_text(&greeting, true).await {
                adapters.release().await;
                return Err(e);
            }
        }
        Ok(adapters)
    }

    async fn supervise<S>(
        &self,
        adapters: Adapters,
        streams: Streams,
        inbound: S,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> SessionOutcome
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        let released = CancellationToken::new();
        let mut flows = JoinSet::new();
        let mut running = HashSet::new();

        flows.spawn(
            inbound_flow(
                inbound,
                adapters.transcoder.clone(),
                Arc::clone(&adapters.upstream),
                token.clone(),
            )
            .in_current_span(),
        );
        running.insert(Flow::Inbound);

        flows.spawn(outbound_flow(streams.events, outbound, token.clone()).in_current_span());
        running.insert(Flow::Outbound);

        if let Some(pcm) = streams.pcm {
            flows.spawn(
                forward_flow(pcm, Arc::clone(&adapters.upstream), token.clone()).in_current_span(),
            );
            running.insert(Flow::Forward);
        }
        if let Some(diagnostics) = streams.diagnostics {
            flows.spawn(diagnostics_flow(diagnostics, released.clone()).in_current_span());
            running.insert(Flow::Diagnostics);
        }

        let mut exits = Vec::new();
        if let Some(joined) = flows.join_next().await {
            exits.push(settle(joined, &mut running));
        }

        self.guard.transition(SessionState::Draining);
        debug!(trigger = ?exits.first(), "Draining session");
        token.cancel();
        if let Some(t) = &adapters.transcoder {
            t.finish_input();
        }

        let grace = self.deps.settings.drain_grace();
        join_until(&mut flows, &mut running, &mut exits, Instant::now() + grace).await;
        if !running.is_empty() {
            warn!(?running, "Flows still running after drain grace");
        }

        released.cancel();
        adapters.release().await;

        join_until(&mut flows, &mut running, &mut exits, Instant::now() + grace).await;
        if !flows.is_empty() {
            warn!(?running, "Aborting stuck flows");
            flows.abort_all();
            while flows.join_next().await.is_some() {}
        }

        decide(exits)
    }
}

async fn join_until(
    flows: &mut JoinSet<(Flow, FlowExit)>,
    running: &mut HashSet<Flow>,
    exits: &mut Vec<FlowExit>,
    deadline: Instant,
) {
    while !flows.is_empty() {
        match tokio::time::timeout_at(deadline, flows.join_next()).await {
            Ok(Some(joined)) => exits.push(settle(joined, running)),
            Ok(None) | Err(_) => break,
        }
    }
}

fn settle(
    joined: std::result::Result<(Flow, FlowExit), JoinError>,
    running: &mut HashSet<Flow>,
) -> FlowExit {
    match joined {
        Ok((flow, exit)) => {
            running.remove(&flow);
            debug!(?flow, ?exit, "Flow finished");
            exit
        }
        Err(e) if e.is_cancelled() => FlowExit::Cancelled,
        Err(e) => {
            error!(error = %e, "Relay flow panicked");
            FlowExit::Error(RelayError::Io(std::io::Error::other(format!(
                "relay task failed: {e}"
            ))))
        }
    }
}

/// The earliest fatal exit wins; otherwise the first exit decides.
fn decide(exits: Vec<FlowExit>) -> SessionOutcome {
    let mut trigger = None;
    for exit in exits {
        match exit {
            FlowExit::Error(e) if e.is_fatal() => return SessionOutcome::Failed(e),
            FlowExit::Cancelled => {}
            other => {
                if trigger.is_none() {
                    trigger = Some(other);
                }
            }
        }
    }
    match trigger {
        Some(FlowExit::ClientClosed) => SessionOutcome::ClientClosed,
        Some(FlowExit::Error(_)) => SessionOutcome::ClientDisconnected,
        _ => SessionOutcome::Completed,
    }
}

async fn inbound_flow<S>(
    mut inbound: S,
    transcoder: Option<Arc<dyn Transcoder>>,
    upstream: Arc<dyn LiveSession>,
    token: CancellationToken,
) -> (Flow, FlowExit)
where
    S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
{
    let flow = Flow::Inbound;
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return (flow, FlowExit::Cancelled),
            frame = inbound.next() => frame,
        };
        let Some(frame) = frame else {
            info!("Client disconnected");
            return (flow, FlowExit::Error(RelayError::ClientDisconnect));
        };

        let message = match frame {
            InboundFrame::Binary(bytes) => protocol::decode_binary(bytes),
            InboundFrame::Text(text) => match protocol::decode_text(&text) {
                Ok(message) => message,
                Err(e) => return (flow, FlowExit::Error(e)),
            },
        };

        let result = match message {
            ClientMessage::Audio(chunk) => {
                metrics::record_bytes("inbound", chunk.len());
                match &transcoder {
                    Some(t) => t.write(&chunk).await,
                    None => upstream.send_audio(&chunk, false).await,
                }
            }
            ClientMessage::EndOfTurn => {
                debug!("Client ended turn");
                // PCM still inside the transcoder reaches upstream after this.
                upstream.send_audio(&[], true).await
            }
            ClientMessage::Close => {
                info!("Client requested close");
                return (flow, FlowExit::ClientClosed);
            }
            ClientMessage::Config(_) => {
                Err(RelayError::ProtocolViolation(CONFIG_ALREADY_RECEIVED.into()))
            }
        };

        if let Err(e) = result {
            if token.is_cancelled() {
                return (flow, FlowExit::Cancelled);
            }
            return (flow, FlowExit::Error(e));
        }
    }
}

async fn forward_flow(
    mut pcm: PcmStream,
    upstream: Arc<dyn LiveSession>,
    token: CancellationToken,
) -> (Flow, FlowExit) {
    let flow = Flow::Forward;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return discard_output(pcm).await,
            next = pcm.next() => next,
        };
        let result = match next {
            None => {
                debug!("Transcoder output closed");
                return (flow, FlowExit::Completed);
            }
            Some(Err(e)) => Err(e),
            Some(Ok(chunk)) => {
                metrics::record_bytes("pcm", chunk.len());
                upstream.send_audio(&chunk, false).await
            }
        };
        if let Err(e) = result {
            if token.is_cancelled() {
                return discard_output(pcm).await;
            }
            return (flow, FlowExit::Error(e));
        }
    }
}

/// Keep reading transcoder output until EOF once the session drains. The
/// process flushes on input EOF; a closed stdout would kill it with SIGPIPE.
async fn discard_output(mut pcm: PcmStream) -> (Flow, FlowExit) {
    let mut discarded = 0usize;
    while let Some(Ok(chunk)) = pcm.next().await {
        discarded += chunk.len();
    }
    debug!(discarded, "Transcoder output drained");
    (Flow::Forward, FlowExit::Cancelled)
}

async fn outbound_flow(
    mut events: UpstreamEventStream,
    outbound: mpsc::Sender<ServerMessage>,
    token: CancellationToken,
) -> (Flow, FlowExit) {
    let flow = Flow::Outbound;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return (flow, FlowExit::Cancelled),
            next = events.next() => next,
        };
        let message = match next {
            None => {
                info!("Upstream stream ended");
                return (flow, FlowExit::Completed);
            }
            Some(Err(e)) => {
                if token.is_cancelled() {
                    return (flow, FlowExit::Cancelled);
                }
                return (flow, FlowExit::Error(e));
            }
            Some(Ok(UpstreamEvent::Audio(bytes))) => {
                metrics::record_bytes("outbound", bytes.len());
                ServerMessage::Audio(bytes)
            }
            Some(Ok(UpstreamEvent::Text(text))) => ServerMessage::Text(text),
            Some(Ok(UpstreamEvent::TurnComplete)) => {
                debug!("Upstream turn complete");
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => return (flow, FlowExit::Cancelled),
            sent = outbound.send(message) => sent,
        };
        if sent.is_err() {
            return (flow, FlowExit::Error(RelayError::ClientDisconnect));
        }
    }
}

/// Watches transcoder diagnostics until the process exits. Exits seen
/// after `released` fires were caused by the relay and are not failures.
async fn diagnostics_flow(
    mut diagnostics: DiagnosticStream,
    released: CancellationToken,
) -> (Flow, FlowExit) {
    let flow = Flow::Diagnostics;
    while let Some(event) = diagnostics.next().await {
        if released.is_cancelled() {
            return (flow, FlowExit::Cancelled);
        }
        match event {
            TranscoderEvent::Failure(line) => {
                return (flow, FlowExit::Error(RelayError::TranscoderFailure(line)));
            }
            TranscoderEvent::Exited { expected: true, .. } => {
                debug!("Transcoder finished");
                return (flow, FlowExit::Completed);
            }
            TranscoderEvent::Exited { code, .. } => {
                let reason = match code {
                    Some(code) => format!("transcoder exited with code {code}"),
                    None => "transcoder terminated by signal".to_string(),
                };
                return (flow, FlowExit::Error(RelayError::TranscoderFailure(reason)));
            }
        }
    }
    (flow, FlowExit::Completed)
}
