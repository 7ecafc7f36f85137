mod api;
mod cli;
mod config;
mod dispatcher;
mod logging;
mod session;
mod store;

use crate::api::AppState;
use crate::cli::Args;
use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::session::auth::AuthToken;
use crate::session::SessionManager;
use crate::store::{CommandStore, JOURNAL_FILE};
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RelayConfig::resolve(&args)?;
    let _log_guard = logging::init_tracing(&config.log_dir, args.log_to_stderr)
        .with_context(|| format!("failed to init logging in {}", config.log_dir.display()))?;

    let journal = config.data_dir.join(JOURNAL_FILE);
    let store = Arc::new(
        CommandStore::open(&journal)
            .await
            .with_context(|| format!("failed to open command store {}", journal.display()))?,
    );
    let orphans = store
        .reconcile_orphans()
        .await
        .context("failed to reconcile commands from previous run")?;
    if orphans > 0 {
        info!(event = "store.reconciled", orphans);
    }

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(SessionManager::new()),
        config.timeouts.clone(),
        shutdown.clone(),
    ));
    dispatcher.adopt_orphans().await;
    let app = api::router(AppState {
        dispatcher: Arc::clone(&dispatcher),
        store,
        auth: AuthToken::new(&config.auth_token),
        liveness: config.liveness.clone(),
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        event = "relay.listening",
        addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
    );
    let drain = Arc::clone(&dispatcher);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_shutdown(shutdown).await;
        drain.shutdown();
    })
    .await?;
    info!(event = "relay.stopped");
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "relay.shutdown_signal");
    shutdown.cancel();
}
