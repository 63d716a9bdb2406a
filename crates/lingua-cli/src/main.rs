use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lingua_core::config::{Config, LoggingConfig};
use lingua_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "lingua",
    about = "Real-time audio relay between language learners and a live tutor model",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check the environment: config, API key, transcoder binary
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value (e.g. "upstream.model")
    Get { key: String },
    /// Validate the configuration
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let mut config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(bind) = bind {
                let mut gateway = config.gateway();
                gateway.bind = bind;
                config.gateway = Some(gateway);
            }
            let port = port.unwrap_or_else(|| config.gateway_port());

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("Invalid configuration ({} errors)", errors.len());
            }

            tracing::info!(
                "Starting Lingua Relay v{} on port {port}",
                env!("CARGO_PKG_VERSION")
            );
            let state = GatewayState::from_config(Arc::new(config));

            #[cfg(feature = "metrics")]
            let state = state.with_metrics(lingua_gateway::metrics::install_prometheus_recorder()?);

            lingua_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted(&config))?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match redacted(&config).get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("Configuration has {} errors", errors.len());
                }
                println!("Configuration OK ({})", config_path.display());
            }
            ConfigAction::Path => println!("{}", config_path.display()),
        },
        Commands::Doctor => {
            if !run_doctor(&config, &config_path).await {
                anyhow::bail!("Doctor found problems");
            }
        }
    }

    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over config; `--verbose`
/// wins over the configured level.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let logging = logging.cloned().unwrap_or_else(|| LoggingConfig {
        format: "plain".into(),
        level: None,
        filters: Vec::new(),
        output: "stderr".into(),
    });

    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let directives = std::iter::once(level)
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

/// Copy of the config with secrets masked, for display.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(upstream) = config.upstream.as_mut() {
        if upstream.api_key.is_some() {
            upstream.api_key = Some("********".into());
        }
    }
    config
}

async fn run_doctor(config: &Config, config_path: &Path) -> bool {
    let mut ok = true;
    println!("Lingua Relay v{}", env!("CARGO_PKG_VERSION"));

    if config_path.exists() {
        println!("[ok]   config file: {}", config_path.display());
    } else {
        println!("[info] config file: {} (not found, using defaults)", config_path.display());
    }

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        println!("[warn] {warning}");
    }
    for error in &errors {
        println!("[fail] {error}");
        ok = false;
    }

    let upstream = config.upstream();
    if upstream.resolve_api_key().is_some() {
        println!("[ok]   upstream API key resolved (model {})", upstream.model);
    } else {
        println!("[fail] upstream API key missing");
        ok = false;
    }

    let program = config.transcoder().program;
    let probe = tokio::process::Command::new(&program)
        .arg("-version")
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(Duration::from_secs(5), probe).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let first_line = stdout.lines().next().unwrap_or("").trim();
            println!("[ok]   transcoder: {first_line}");
        }
        Ok(Ok(output)) => {
            println!("[fail] transcoder '{program}' exited with {}", output.status);
            ok = false;
        }
        Ok(Err(e)) => {
            println!("[fail] transcoder '{program}' could not be started: {e}");
            ok = false;
        }
        Err(_) => {
            println!("[fail] transcoder '{program}' did not answer -version within 5s");
            ok = false;
        }
    }

    ok
}
