//! Stratus worker - process entry point.
//!
//! ```text
//! stratus-worker <token>            join the cluster named by the token
//! stratus-worker --listen <addr>    serve the subscription endpoint so a
//!                                   driver can attach this node later
//! ```
//!
//! A worker started with a token stays registered until the driver kills it,
//! the cluster stops listing it, or it is interrupted. Exit status 2 means the
//! arguments or the token could not be understood.

use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stratus_messaging::{NodeServer, Router, TcpTransport, Transport};
use stratus_runtime::{
    DEFAULT_SUBSCRIPTION_RETRIES, RuntimeError, SubscriptionEndpoint, WorkerSession, endpoints,
    join_with_retries,
};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const EXIT_USAGE: u8 = 2;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Join(String),
    Listen(String),
}

impl Mode {
    fn from_args(args: &[String]) -> Option<Self> {
        match args {
            [flag, listen] if flag == "--listen" => Some(Self::Listen(listen.clone())),
            [token] if !token.starts_with("--") => Some(Self::Join(token.clone())),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(mode) = Mode::from_args(&args) else {
        tracing::error!(
            args = args.len(),
            "Usage: stratus-worker <token> | stratus-worker --listen <addr>"
        );
        return ExitCode::from(EXIT_USAGE);
    };

    match mode {
        Mode::Join(token) => match run_worker(&token).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(RuntimeError::MalformedDescriptor(reason)) => {
                tracing::error!(%reason, "Invalid runtime token");
                ExitCode::from(EXIT_USAGE)
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker failed");
                ExitCode::FAILURE
            }
        },
        Mode::Listen(listen) => match serve(&listen).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Worker node failed");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_worker(token: &str) -> Result<(), RuntimeError> {
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::default());
    let session = join_with_retries(token, transport, None, DEFAULT_SUBSCRIPTION_RETRIES).await?;

    match wait_for_exit(&session).await {
        Exit::Interrupted => session.leave().await,
        Exit::Dropped => Ok(()),
        Exit::Lost(e) => Err(e),
    }
}

enum Exit {
    Interrupted,
    Dropped,
    Lost(RuntimeError),
}

async fn wait_for_exit(session: &WorkerSession) -> Exit {
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            result = &mut interrupt => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Signal handler failed");
                }
                tracing::info!(identity = session.identity(), "Interrupted");
                return Exit::Interrupted;
            }
            _ = heartbeat.tick() => match session.heartbeat().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(identity = session.identity(), "No longer registered");
                    return Exit::Dropped;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cluster unreachable");
                    return Exit::Lost(e);
                }
            },
        }
    }
}

async fn serve(listen: &str) -> Result<()> {
    let router = Arc::new(Router::new());
    let node = NodeServer::bind(listen, Arc::clone(&router))
        .await
        .with_context(|| format!("failed to listen on {listen}"))?;

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::default());
    let subscriptions = Arc::new(SubscriptionEndpoint::new(
        transport,
        node.address().clone(),
    ));
    router.bind(endpoints::WORKER_MANAGER, subscriptions.clone());

    // The bound address goes to stdout so a supervisor can pick up port 0.
    println!("{}", node.address());
    tracing::info!(address = %node.address(), "Worker node listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;

    subscriptions.leave_all().await;
    node.shutdown();
    tracing::info!("Worker node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn token_is_the_only_argument() {
        assert_eq!(
            Mode::from_args(&args(&["abc"])),
            Some(Mode::Join("abc".to_string()))
        );
        assert_eq!(Mode::from_args(&args(&[])), None);
        assert_eq!(Mode::from_args(&args(&["abc", "def"])), None);
    }

    #[test]
    fn listen_takes_an_address() {
        assert_eq!(
            Mode::from_args(&args(&["--listen", "0.0.0.0:7700"])),
            Some(Mode::Listen("0.0.0.0:7700".to_string()))
        );
        assert_eq!(Mode::from_args(&args(&["--listen"])), None);
    }
}
