//! Gateway shared state.

use std::sync::Arc;

use lingua_core::config::Config;
use lingua_media::{FfmpegLauncher, TranscoderLauncher};
use lingua_providers::{GeminiLiveConnector, LiveConnector};

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusHandle;

use crate::registry::SessionRegistry;
use crate::relay::RelayDeps;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub connector: Arc<dyn LiveConnector>,
    pub launcher: Arc<dyn TranscoderLauncher>,
    pub registry: Arc<SessionRegistry>,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn LiveConnector>,
        launcher: Arc<dyn TranscoderLauncher>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions()));
        Self {
            config,
            connector,
            launcher,
            registry,
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    /// Production wiring: Gemini Live upstream and an ffmpeg transcoder.
    pub fn from_config(config: Arc<Config>) -> Self {
        let connector = Arc::new(GeminiLiveConnector::from_config(&config.upstream()));
        let launcher = Arc::new(FfmpegLauncher::new(config.transcoder()));
        Self::new(config, connector, launcher)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn relay_deps(&self) -> RelayDeps {
        RelayDeps {
            connector: Arc::clone(&self.connector),
            launcher: Arc::clone(&self.launcher),
            upstream: self.config.upstream(),
            settings: self.config.relay(),
        }
    }
}
