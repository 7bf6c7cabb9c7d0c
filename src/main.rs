use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use slidegate::admin::Admin;
use slidegate::config::SlidegateConfig;
use slidegate::http::{admin_router, AdminServer, AdminState};
use slidegate::ratelimit::{LimiterRegistry, LimiterRules, SlidingWindow};
use slidegate::store::{self, WindowStore};

#[derive(Parser)]
#[command(name = "slidegate", version, about = "Distributed sliding-window rate limiting")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the admin HTTP API
    Serve,
    /// Probe the window store
    Health,
    /// Show the count and expiry of one key
    Status { key: String },
    /// Delete every key with a prefix, e.g. `login:*`
    Clear { pattern: String },
    /// List the configured limiters
    Limiters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = SlidegateConfig::load(cli.config.as_deref())?;
    let store = store::from_config(&config.store)?;
    let rules = match &config.rate_limiting.rules_path {
        Some(path) => LimiterRules::from_file(path)?,
        None => LimiterRules::standard(),
    };
    let window = SlidingWindow::new(store.clone(), config.store.operation_timeout());
    let registry = Arc::new(LimiterRegistry::from_rules(&rules, &window));
    let admin = Admin::new(store.clone());

    match cli.command {
        Command::Serve => serve(config, store, admin, registry).await?,
        Command::Health => {
            let report = admin.check_health().await;
            print_json(&report)?;
            if !report.healthy {
                std::process::exit(1);
            }
        }
        Command::Status { key } => print_json(&admin.get_status(&key).await)?,
        Command::Clear { pattern } => {
            let cleared = admin.clear_limiter(&pattern).await?;
            print_json(&serde_json::json!({ "cleared": cleared }))?;
        }
        Command::Limiters => print_json(&registry.configs())?,
    }

    Ok(())
}

async fn serve(
    config: SlidegateConfig,
    store: Arc<dyn WindowStore>,
    admin: Admin,
    registry: Arc<LimiterRegistry>,
) -> anyhow::Result<()> {
    info!("Starting Slidegate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = store.backend_name(),
        limiters = registry.len(),
        admin_addr = %config.server.admin_addr,
        "Configuration loaded"
    );

    let report = admin.check_health().await;
    if !report.healthy {
        warn!(message = %report.message, "Window store unreachable at startup");
    }

    let router = admin_router(AdminState::new(admin, registry));
    AdminServer::new(config.server.admin_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Slidegate stopped");
    Ok(())
}

/// Logs go to stderr so one-shot commands keep stdout for JSON.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
