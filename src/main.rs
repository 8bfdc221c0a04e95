use std::sync::Arc;
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use authguard::config::AuthguardConfig;
use authguard::ratelimit::{run_eviction_loop, PolicySet, RateLimiter, SystemClock};

/// Abuse-control rate limiter for authentication endpoints.
#[derive(Debug, Parser)]
#[command(name = "authguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy table
    Policies {
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// Answer `<policy> <identity>` lines from stdin with allow/deny
    Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => AuthguardConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => AuthguardConfig::default(),
    };
    let policies = config.load_policies().context("failed to load policies")?;
    info!(policies = policies.len(), "Configuration loaded");

    match cli.command {
        Command::Policies { format } => print_policies(&policies, format),
        Command::Serve => serve(&config, policies).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_policies(policies: &PolicySet, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => {
            let list: Vec<_> = policies.iter().map(|p| p.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Format::Table => {
            println!(
                "{:<20} {:>8} {:>8} {:>10}  {:<10} ALIASES",
                "POLICY", "CAPACITY", "REFILL", "EVERY(s)", "KEY"
            );
            for policy in policies.iter() {
                println!(
                    "{:<20} {:>8} {:>8} {:>10}  {:<10} {}",
                    policy.name(),
                    policy.capacity(),
                    policy.refill_amount(),
                    policy.refill_interval().as_secs(),
                    policy.identity_source().to_string(),
                    policy.aliases().join(",")
                );
            }
        }
    }
    Ok(())
}

/// Run the stdin/stdout decision loop until EOF or a shutdown signal.
async fn serve(config: &AuthguardConfig, policies: PolicySet) -> anyhow::Result<()> {
    let (limiter, admin) = RateLimiter::with_admin(policies, Arc::new(SystemClock::new()));

    let eviction = &config.rate_limiting.eviction;
    let (stop_sweeper, stopped) = oneshot::channel::<()>();
    let sweeper = eviction.enabled.then(|| {
        tokio::spawn(run_eviction_loop(
            admin,
            eviction.sweep_interval(),
            eviction.idle_multiplier,
            async move {
                let _ = stopped.await;
            },
        ))
    });

    info!("Serving rate limit decisions on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    info!("Input closed");
                    break;
                };
                if let Some(reply) = respond(&limiter, &line) {
                    stdout.write_all(reply.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
            }
        }
    }

    let _ = stop_sweeper.send(());
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            error!(error = %e, "Idle bucket sweeper failed");
        }
    }

    info!("Authguard stopped");
    Ok(())
}

/// Decide one request line. Blank lines and `#` comments produce no output.
fn respond(limiter: &RateLimiter, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut parts = line.split_whitespace();
    let (Some(policy), Some(identity), None) = (parts.next(), parts.next(), parts.next()) else {
        warn!(line = line, "Malformed request line");
        return Some("error: expected `<policy> <identity>`".to_string());
    };

    let reply = match limiter.try_allow(policy, identity) {
        Ok(true) => "allow".to_string(),
        Ok(false) => match limiter.retry_after(policy, identity) {
            Ok(Some(wait)) => format!("deny retry_after={}", wait.as_secs_f64().ceil() as u64),
            _ => "deny".to_string(),
        },
        Err(e) => {
            warn!(error = %e, "Rejected request line");
            format!("error: {}", e)
        }
    };
    Some(reply)
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
