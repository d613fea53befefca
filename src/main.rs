use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingSettings, TollgateConfig};
use tollgate::ratelimit::{build_limiter, RateLimiterBackend, RejectionSink, Request};

/// Simulate concurrent callers against a Tollgate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulated users
    #[arg(long, default_value_t = 3)]
    users: usize,

    /// Requests sent by each user
    #[arg(long, default_value_t = 15)]
    requests: u64,

    /// Pause between a user's requests, in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,

    /// Print rejected requests as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default)]
struct Tally {
    allowed: AtomicU64,
    denied: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = TollgateConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match args.config.as_deref() {
        Some(path) => info!(path = %path.display(), "Configuration loaded from file"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    let sink = Arc::new(RejectionSink::with_limit(config.sink.max_records));
    let limiter: Arc<dyn RateLimiterBackend> = Arc::from(build_limiter(&config.limiter, sink.clone())?);
    let tally = Arc::new(Tally::default());

    let interval = Duration::from_millis(args.interval_ms);
    let mut users = JoinSet::new();
    for n in 1..=args.users {
        let user_id = format!("usr_{}", n);
        users.spawn(simulate_user(
            limiter.clone(),
            tally.clone(),
            user_id,
            args.requests,
            interval,
        ));
    }

    let interrupted = tokio::select! {
        _ = async { while users.join_next().await.is_some() {} } => false,
        _ = shutdown_signal() => true,
    };
    if interrupted {
        users.abort_all();
    } else {
        info!("Simulation finished");
    }

    info!(
        allowed = tally.allowed.load(Ordering::Relaxed),
        denied = tally.denied.load(Ordering::Relaxed),
        dropped = sink.dropped(),
        "Admission summary"
    );

    let rejected = sink.drain();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rejected)?);
    } else {
        for record in &rejected {
            info!(
                sequence = record.sequence,
                key = %record.key,
                request_id = record.request.request_id,
                rejected_at = %record.rejected_at,
                "Rejected request"
            );
        }
    }

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn simulate_user(
    limiter: Arc<dyn RateLimiterBackend>,
    tally: Arc<Tally>,
    user_id: String,
    requests: u64,
    interval: Duration,
) {
    for request_id in 0..requests {
        let request = Request::new(user_id.clone(), request_id);
        let decision = limiter.is_allowed(&request);

        if decision.allowed {
            tally.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            tally.denied.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            user = %user_id,
            request_id,
            allowed = decision.allowed,
            reason = %decision.reason,
            "Request evaluated"
        );

        tokio::time::sleep(interval).await;
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
