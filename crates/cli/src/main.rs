use chatdesk_core::bus::MessageBus;
use chatdesk_core::config::{mask_secret, AppConfig};
use chatdesk_core::metrics::MetricsStore;
use chatdesk_ingest::relay::DEFAULT_RELAY_TIMEOUT;
use chatdesk_ingest::{BotRelay, HttpRelay, IngestionCoordinator, Pipeline};
use chatdesk_persistence::SqliteStore;
use chatdesk_server::Gateway;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

const BUS_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "chatdesk")]
#[command(version)]
#[command(about = "WhatsApp webhook intake with per-contact ordering and a bot relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migrations and start the webhook gateway
    Serve {
        /// Config file (defaults to ~/.chatdesk/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let stdout_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(stdout_filter)
        .with_writer(std::io::stdout)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status { config }) => {
            let path = config.unwrap_or_else(AppConfig::default_path);
            let config = load_config(Some(path.clone()))?;
            for line in status_lines(&config, &path) {
                println!("{}", line);
            }
            Ok(())
        }
        Some(Commands::Serve { config, port }) => serve(load_config(config)?, port).await,
        None => serve(load_config(None)?, None).await,
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    AppConfig::load(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

async fn serve(mut config: AppConfig, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }

    let store = Arc::new(
        SqliteStore::new(&config.database.url, config.database.max_connections).await?,
    );
    info!("Database ready at {}", config.database.url);

    let metrics = MetricsStore::new();
    let bus = Arc::new(MessageBus::new(BUS_CAPACITY));

    let (relay, relay_timeout) = match config.active_relay() {
        Some(relay_cfg) => {
            let relay: Arc<dyn BotRelay> = Arc::new(HttpRelay::from_config(relay_cfg));
            info!(
                "Bot relay enabled: {} (timeout {}s)",
                relay_cfg.url, relay_cfg.timeout_secs
            );
            (Some(relay), Duration::from_secs(relay_cfg.timeout_secs.max(1)))
        }
        None => {
            warn!("No bot relay configured — inbound messages are stored only");
            (None, DEFAULT_RELAY_TIMEOUT)
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        store,
        bus.clone(),
        relay,
        relay_timeout,
        metrics.clone(),
    ));
    let coordinator = Arc::new(IngestionCoordinator::from_config(
        &config.ingest,
        pipeline,
        metrics.clone(),
    ));

    let gateway = Gateway::new(
        &config.server,
        &config.webhook,
        coordinator.clone(),
        bus,
        metrics,
    );

    let served = gateway.start(shutdown_signal()).await;
    if let Err(e) = &served {
        error!("Gateway error: {}", e);
    }

    // Deliveries acknowledged with 200 will not be resent, so finish them.
    coordinator.shutdown(drain_timeout(relay_timeout)).await;
    served
}

/// Long enough for a lane's current task to reach its relay timeout.
fn drain_timeout(relay_timeout: Duration) -> Duration {
    relay_timeout + Duration::from_secs(5)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn status_lines(config: &AppConfig, path: &Path) -> Vec<String> {
    let secret = |value: &Option<String>| match value.as_deref() {
        Some(v) if !v.is_empty() => mask_secret(v),
        _ => "not set".to_string(),
    };

    let mut lines = vec![
        format!(
            "Config: {}{}",
            path.display(),
            if path.exists() { "" } else { " (not found, using defaults)" }
        ),
        format!("Port: {}", config.server.port),
        format!("Auth token: {}", secret(&config.server.auth_token)),
        format!("Database: {}", config.database.url),
        format!("Verify token: {}", secret(&config.webhook.verify_token)),
        format!("App secret: {}", secret(&config.webhook.app_secret)),
    ];
    match config.active_relay() {
        Some(relay) => {
            lines.push(format!("Relay: {} ({}s)", relay.url, relay.timeout_secs));
            lines.push(format!("Relay token: {}", secret(&relay.token)));
        }
        None => lines.push("Relay: not set".to_string()),
    }
    lines.push(format!(
        "Dedup window: {}s (sweep above {})",
        config.ingest.dedup_window_secs, config.ingest.dedup_sweep_threshold
    ));
    lines.push(format!("Lane idle grace: {}s", config.ingest.lane_idle_secs));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["chatdesk"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["chatdesk", "serve", "--port", "8080"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Serve { port: Some(8080), .. })));
    }

    #[test]
    fn status_masks_secrets() {
        let config = AppConfig::from_toml_str(
            r#"
            [webhook]
            verify_token = "verify-token-123"
            app_secret = "super-secret-value"

            [relay]
            url = "http://localhost:5678/webhook/bot"
            token = "relay-bearer-token"
            "#,
        )
        .unwrap();

        let output = status_lines(&config, Path::new("/nonexistent/config.toml")).join("\n");
        assert!(output.contains("supe****alue"));
        assert!(!output.contains("super-secret-value"));
        assert!(!output.contains("relay-bearer-token"));
        assert!(output.contains("Relay: http://localhost:5678/webhook/bot (60s)"));
        assert!(output.contains("Auth token: not set"));
        assert!(output.contains("not found, using defaults"));
    }
}
