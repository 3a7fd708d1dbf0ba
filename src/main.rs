use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::janitor::Janitor;
use turnstile::ratelimit::{AdmissionController, AdmissionRequest, RuleSet};

/// Admission-control engine reading requests as JSON lines on stdin and
/// writing one JSON decision per line to stdout.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Engine configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// YAML rule set loaded at startup
    #[arg(short, long, env = "TURNSTILE_RULES")]
    rules: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Turnstile admission engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(args.config.as_deref())?;
    let janitor_interval = config.janitor.interval();
    info!(
        enabled = config.enabled,
        default_limit = config.limits.default_limit,
        "Configuration loaded"
    );

    let controller = Arc::new(AdmissionController::new(config)?);

    if let Some(path) = &args.rules {
        let rules = controller.load_rule_set(RuleSet::from_file(path)?)?;
        info!(path = %path.display(), count = rules.len(), "Rule set loaded");
    }

    let janitor = Janitor::spawn(Arc::clone(&controller), janitor_interval);

    tokio::select! {
        result = serve_stdin(&controller) => {
            if let Err(e) = result {
                warn!(error = %e, "Request stream failed");
            }
            info!("Input closed");
        }
        _ = shutdown_signal() => {}
    }

    janitor.shutdown().await;

    let stats = controller.get_stats();
    info!(
        total = stats.total_requests,
        allowed = stats.allowed,
        blocked = stats.blocked,
        "Turnstile admission engine stopped"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Answer each request line with a decision line. Malformed lines are
/// logged and skipped.
async fn serve_stdin(controller: &AdmissionController) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: AdmissionRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };

        let decision = controller.check_request(&request);
        let mut out = serde_json::to_vec(&decision)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
