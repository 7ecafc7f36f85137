mod cli;
mod config;
mod connection;
mod handlers;
mod output;
mod sandbox;

use crate::cli::Args;
use crate::config::AgentConfig;
use crate::connection::Runtime;
use crate::handlers::Handlers;
use crate::sandbox::{home_dir, PathPolicy};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = AgentConfig::resolve(&args)?;

    let home = home_dir()?;
    let policy = PathPolicy::new(home.clone(), &config.allowed_roots).await;
    if policy.roots().is_empty() {
        anyhow::bail!("none of the allowed_roots exist on this machine");
    }
    let shell = config.shell();
    info!(
        event = "agent.starting",
        relay = %config.relay_url,
        home = %home.display(),
        roots = ?policy.roots(),
        shell = %shell,
        max_concurrency = config.max_concurrency,
    );
    let runtime = Runtime::new(
        &config,
        Handlers::new(policy, config.max_output_bytes, shell),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));
    runtime.run(shutdown).await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!(event = "agent.shutdown_signal");
    shutdown.cancel();
}
