use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use agency::{AgencyConfig, Session, SessionError, TcpConnector, load_bets};

const USAGE: &str = "Usage: agency [--config <path>]";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match parse_args(&args) {
        Ok(Command::Run { config }) => config,
        Ok(Command::Help) => {
            println!("{USAGE}");
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --config <path>  Config file [default: ./config.yaml]");
            process::exit(2);
        }
    };

    let config = match AgencyConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };

    init_tracing(&config.log.level);
    info!(
        version = agency::AGENCY_VERSION,
        agency = %config.id,
        server = %config.server.address,
        batch_max_amount = config.batch.max_amount,
        "Starting agency"
    );

    if let Err(e) = run(config).await {
        tracing::error!(error = %format!("{e:#}"), "Agency run failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run { config: Option<PathBuf> },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut config = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i).ok_or("--config requires a value")?,
                ));
            }
            "--help" | "-h" => return Ok(Command::Help),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Command::Run { config })
}

fn init_tracing(level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!("agency={level},agency_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(config: AgencyConfig) -> anyhow::Result<()> {
    let path = config.data_path();
    let bets = load_bets(&path, &config.id)
        .with_context(|| format!("failed to load bets for agency {}", config.id))?;

    let mut connector = TcpConnector::new(config.server.address.clone());
    if let Some(timeout) = config.connect_timeout() {
        connector = connector.with_timeout(timeout);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let session = Session::new(config.session_config(), connector).with_cancellation(cancel.clone());
    let grace = config.shutdown_grace();

    // Dropping the session future drops its connection.
    let result = tokio::select! {
        result = session.run(&bets) => result,
        _ = grace_expired(&cancel, grace) => {
            warn!(agency = %config.id, ?grace, "Shutdown grace period expired, abandoning session");
            return Ok(());
        }
    };

    match result {
        Ok(report) => {
            info!(
                agency = %report.agency,
                batches = report.batches_sent,
                records = report.records_sent,
                winners = report.winners.len(),
                "Agency run complete"
            );
            Ok(())
        }
        Err(SessionError::Cancelled { phase }) => {
            info!(agency = %config.id, %phase, "Agency stopped by shutdown signal");
            Ok(())
        }
        Err(e) if e.is_partial() => {
            Err(e).context("run ended after a partial submission, some bets were stored")
        }
        Err(e) => {
            let phase = e.phase();
            Err(e).with_context(|| format!("session failed while {phase}"))
        }
    }
}

async fn grace_expired(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// runtime is misconfigured at startup.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("agency")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_no_args_uses_default_config() {
        assert_eq!(parse_args(&args(&[])), Ok(Command::Run { config: None }));
    }

    #[test]
    fn parse_config_flag() {
        assert_eq!(
            parse_args(&args(&["--config", "/etc/agency.yaml"])),
            Ok(Command::Run {
                config: Some(PathBuf::from("/etc/agency.yaml"))
            })
        );
    }

    #[test]
    fn parse_help() {
        assert_eq!(parse_args(&args(&["-h"])), Ok(Command::Help));
    }

    #[test]
    fn parse_errors() {
        assert!(parse_args(&args(&["--config"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }
}
