//! WebSocket gateway for live language-tutor audio sessions.
//!
//! Each client connection gets one [`relay::Relay`] that bridges the
//! client socket, an optional transcoder process, and an upstream live
//! model session.

pub mod connection;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod server;
pub mod state;

pub use registry::{SessionGuard, SessionRegistry, SessionSummary};
pub use relay::{InboundFrame, Relay, RelayDeps, SessionOutcome};
pub use server::{AUDIO_CHAT_PATH, router, start_gateway};
pub use state::GatewayState;
