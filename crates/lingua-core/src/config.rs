//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Lingua Relay configuration.
///
/// Every section is optional; accessors fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcoder: Option<TranscoderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// Origins allowed by CORS. `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Upper bound on concurrently open relay sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_port() -> u16 {
    8000
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

fn default_max_sessions() -> usize {
    32
}

/// Live model service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_api_key_env", skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    /// "AUDIO" and/or "TEXT".
    #[serde(default = "default_response_modalities")]
    pub response_modalities: Vec<String>,

    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: None,
            api_version: default_api_version(),
            model: default_model(),
            voice: default_voice(),
            response_modalities: default_response_modalities(),
            setup_timeout_secs: default_setup_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    /// Resolve the API key: `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

fn default_api_key_env() -> Option<String> {
    Some("GEMINI_API_KEY".into())
}

fn default_api_version() -> String {
    "v1alpha".into()
}

fn default_model() -> String {
    "models/gemini-2.0-flash-exp".into()
}

fn default_voice() -> String {
    "Puck".into()
}

fn default_response_modalities() -> Vec<String> {
    vec!["AUDIO".into()]
}

fn default_setup_timeout_secs() -> u64 {
    10
}

/// External transcoder process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    #[serde(default = "default_program")]
    pub program: String,

    /// Diagnostic line substrings that mark a fatal transcoding failure.
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,

    /// How long `stop` waits for a clean exit after closing input.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Read size for PCM output. Must be even (whole s16le samples).
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            failure_markers: default_failure_markers(),
            stop_grace_ms: default_stop_grace_ms(),
            chunk_bytes: default_chunk_bytes(),
        }
    }
}

impl TranscoderConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_program() -> String {
    "ffmpeg".into()
}

fn default_failure_markers() -> Vec<String> {
    vec![
        "Error".into(),
        "Invalid".into(),
        "Conversion failed".into(),
    ]
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_chunk_bytes() -> usize {
    4096
}

/// Per-session relay behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How long to wait for the client's config message.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Prompt the assistant to greet before the learner speaks.
    #[serde(default = "default_true")]
    pub assistant_speaks_first: bool,

    /// How long flows get to wind down once draining starts.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Capacity of the per-session outbound message queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            assistant_speaks_first: true,
            drain_grace_ms: default_drain_grace_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_drain_grace_ms() -> u64 {
    1000
}

fn default_outbound_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "lingua_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| crate::error::RelayError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.gateway.clone().unwrap_or_default()
    }

    pub fn upstream(&self) -> UpstreamConfig {
        self.upstream.clone().unwrap_or_default()
    }

    pub fn transcoder(&self) -> TranscoderConfig {
        self.transcoder.clone().unwrap_or_default()
    }

    pub fn relay(&self) -> RelayConfig {
        self.relay.clone().unwrap_or_default()
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn bind_address(&self) -> String {
        self.gateway
            .as_ref()
            .map(|g| g.bind.clone())
            .unwrap_or_else(default_bind)
    }

    pub fn max_sessions(&self) -> usize {
        self.gateway
            .as_ref()
            .map(|g| g.max_sessions)
            .unwrap_or_else(default_max_sessions)
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "upstream.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let upstream = self.upstream();
        if upstream.resolve_api_key().is_none() {
            let source = upstream.api_key_env.as_deref().unwrap_or("upstream.api_key");
            warnings.push(format!(
                "Upstream has no API key configured (set {source})"
            ));
        }
        for modality in &upstream.response_modalities {
            if !matches!(modality.trim().to_ascii_uppercase().as_str(), "AUDIO" | "TEXT") {
                errors.push(format!("Unknown response modality: {modality}"));
            }
        }

        let gateway = self.gateway();
        if gateway.port == 0 {
            errors.push("Gateway port cannot be 0".to_string());
        }
        if gateway.max_sessions == 0 {
            errors.push("gateway.max_sessions must be at least 1".to_string());
        }
        if gateway.allowed_origins.is_empty() {
            warnings.push("No allowed origins configured; browsers will be rejected".to_string());
        }

        let transcoder = self.transcoder();
        if transcoder.chunk_bytes == 0 || transcoder.chunk_bytes % 2 != 0 {
            errors.push(format!(
                "transcoder.chunk_bytes must be a positive even number, got {}",
                transcoder.chunk_bytes
            ));
        }
        if transcoder.program.trim().is_empty() {
            errors.push("transcoder.program cannot be empty".to_string());
        }

        if self.relay().outbound_buffer == 0 {
            errors.push("relay.outbound_buffer must be at least 1".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Lingua Relay data: `~/.lingua_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lingua_relay")
}
