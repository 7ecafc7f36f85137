//! Turns submissions into stored commands, pushes them to the executor, and
//! resolves each caller's wait when the matching result or the timer arrives.
//!
//! The store is the arbiter of every race: whichever of the result path and the
//! timer path lands its terminal transition first wins, and the loser sees
//! `InvalidTransition`.

mod recovery;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::wire::CommandEnvelope;
use protocol::{CommandPayload, CommandResult, CommandStatus, ExecutionReport, RelayMessage};
use serde::Serialize;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TimeoutConfig;
use crate::session::SessionManager;
use crate::store::{Command, CommandStore, StoreError};

/// What a caller gets back once its command settles.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct CommandOutcome {
    pub(crate) id: String,
    pub(crate) status: CommandStatus,
    #[serde(flatten)]
    pub(crate) result: CommandResult,
}

impl From<Command> for CommandOutcome {
    fn from(command: Command) -> Self {
        Self {
            id: command.id,
            status: command.status,
            result: command.result.unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DispatchError {
    #[error("command {id} timed out after {secs} seconds")]
    Timeout { id: String, secs: u64 },
    #[error("relay is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) struct Dispatcher {
    store: Arc<CommandStore>,
    sessions: Arc<SessionManager>,
    waits: Mutex<HashMap<String, oneshot::Sender<CommandOutcome>>>,
    timeouts: TimeoutConfig,
    shutdown: CancellationToken,
}

/// Removes the caller's wait entry however `submit` exits.
struct WaitGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: &'a str,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.take_wait(self.id);
    }
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<CommandStore>,
        sessions: Arc<SessionManager>,
        timeouts: TimeoutConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            sessions,
            waits: Mutex::new(HashMap::new()),
            timeouts,
            shutdown,
        }
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Stores the command, tries to hand it to the executor right away, and waits
    /// for its result, its timer, or shutdown.
    pub(crate) async fn submit(
        &self,
        mut payload: CommandPayload,
    ) -> Result<CommandOutcome, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let timeout_secs = self.timeouts.apply(&mut payload);
        let command = self.store.create(payload, timeout_secs).await?;
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let (tx, mut rx) = oneshot::channel();
        self.lock_waits().insert(command.id.clone(), tx);
        let _guard = WaitGuard {
            dispatcher: self,
            id: &command.id,
        };
        tracing::info!(
            event = "command.submitted",
            id = %command.id,
            kind = %command.kind,
            summary = %command.payload.summary(),
            timeout_secs,
        );

        if let Err(err) = self.dispatch(&command).await {
            tracing::warn!(
                event = "command.dispatch_failed",
                id = %command.id,
                error = %err,
            );
        }

        tokio::select! {
            outcome = &mut rx => return outcome.map_err(|_| DispatchError::ShuttingDown),
            _ = tokio::time::sleep_until(deadline) => {}
            _ = self.shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
        }
        self.expire(&command.id, timeout_secs, rx).await
    }

    /// Sends `command` on the live session if one is ready. Returns whether it
    /// went out; a command that stays `pending` is picked up by recovery.
    pub(crate) async fn dispatch(&self, command: &Command) -> Result<bool, DispatchError> {
        match self.sessions.reserve().await {
            Ok(permit) => self.send_with(permit, command).await,
            Err(_) => {
                tracing::info!(event = "command.queued", id = %command.id, "no executor session");
                Ok(false)
            }
        }
    }

    /// Marks the command running and sends it through an already reserved slot.
    /// A command some other path already moved out of `pending` is skipped.
    async fn send_with(
        &self,
        permit: OwnedPermit<RelayMessage>,
        command: &Command,
    ) -> Result<bool, DispatchError> {
        match self
            .store
            .transition(&command.id, CommandStatus::Running, None)
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(event = "command.dispatch_skipped", id = %command.id, status = %from);
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
        permit.send(RelayMessage::Execute(CommandEnvelope {
            id: command.id.clone(),
            payload: command.payload.clone(),
        }));
        tracing::info!(event = "command.dispatched", id = %command.id, kind = %command.kind);
        Ok(true)
    }

    async fn expire(
        &self,
        id: &str,
        secs: u64,
        rx: oneshot::Receiver<CommandOutcome>,
    ) -> Result<CommandOutcome, DispatchError> {
        if self.time_out(id, secs).await? {
            return Err(DispatchError::Timeout {
                id: id.to_string(),
                secs,
            });
        }
        // A result got there first and is being delivered.
        match rx.await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(self.store.get(id).await?.into()),
        }
    }

    /// Forces the command to `timeout`. Returns false if it had already settled.
    async fn time_out(&self, id: &str, secs: u64) -> Result<bool, StoreError> {
        let result = CommandResult {
            output: None,
            error: Some(format!("command timed out after {secs} seconds")),
            exit_code: None,
        };
        match self
            .store
            .transition(id, CommandStatus::Timeout, Some(result))
            .await
        {
            Ok(_) => {
                tracing::warn!(event = "command.timed_out", id = %id, timeout_secs = secs);
                Ok(true)
            }
            Err(StoreError::InvalidTransition { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Applies a result frame from the executor. Results for unknown or already
    /// settled commands are dropped.
    pub(crate) async fn handle_report(&self, report: ExecutionReport) {
        let id = report.id;
        let status = CommandStatus::from(report.status);
        let current = match self.store.get(&id).await {
            Ok(command) => command,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(event = "result.dropped", id = %id, reason = "unknown command");
                return;
            }
            Err(err) => {
                tracing::error!(event = "result.lookup_failed", id = %id, error = %err);
                return;
            }
        };
        if current.status.is_terminal() {
            tracing::warn!(
                event = "result.dropped",
                id = %id,
                status = %current.status,
                reason = "command already settled",
            );
            return;
        }
        if current.status == CommandStatus::Pending {
            if let Err(err) = self
                .store
                .transition(&id, CommandStatus::Running, None)
                .await
            {
                tracing::debug!(event = "result.start_skipped", id = %id, error = %err);
            }
        }
        match self.store.transition(&id, status, Some(report.result)).await {
            Ok(command) => {
                tracing::info!(
                    event = "result.applied",
                    id = %id,
                    status = %command.status,
                    exit_code = ?command.result.as_ref().and_then(|result| result.exit_code),
                );
                self.resolve(command);
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::warn!(
                    event = "result.dropped",
                    id = %id,
                    status = %from,
                    reason = "command already settled",
                );
            }
            Err(err) => {
                tracing::error!(event = "result.store_failed", id = %id, error = %err);
            }
        }
    }

    /// Cancels every outstanding wait. Later submissions fail immediately.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        let pending = {
            let mut waits = self.lock_waits();
            std::mem::take(&mut *waits)
        };
        if !pending.is_empty() {
            tracing::info!(event = "dispatcher.shutdown", waits = pending.len());
        }
    }

    fn resolve(&self, command: Command) {
        if let Some(tx) = self.take_wait(&command.id) {
            let _ = tx.send(command.into());
        }
    }

    fn take_wait(&self, id: &str) -> Option<oneshot::Sender<CommandOutcome>> {
        self.lock_waits().remove(id)
    }

    fn lock_waits(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<CommandOutcome>>> {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::JOURNAL_FILE;
    use protocol::ResultStatus;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    pub(crate) struct Harness {
        pub(crate) dispatcher: Arc<Dispatcher>,
        pub(crate) store: Arc<CommandStore>,
        _dir: TempDir,
    }

    pub(crate) async fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            CommandStore::open(dir.path().join(JOURNAL_FILE))
                .await
                .expect("open store"),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::new(SessionManager::new()),
            TimeoutConfig::default(),
            CancellationToken::new(),
        ));
        Harness {
            dispatcher,
            store,
            _dir: dir,
        }
    }

    pub(crate) fn shell(command: &str, timeout_secs: u64) -> CommandPayload {
        CommandPayload::Shell {
            command: command.to_string(),
            working_dir: None,
            timeout_secs,
        }
    }

    /// Attaches a fake executor that is ready for new work.
    fn connect(dispatcher: &Dispatcher) -> (u64, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let ticket = dispatcher.sessions().attach("test", tx);
        dispatcher.sessions().mark_ready(ticket.id);
        (ticket.id, rx)
    }

    async fn next_execute(rx: &mut mpsc::Receiver<RelayMessage>) -> CommandEnvelope {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(RelayMessage::Execute(envelope))) => envelope,
            other => panic!("expected execute frame, got {other:?}"),
        }
    }

    pub(crate) async fn wait_for_pending(store: &CommandStore, count: usize) -> Vec<Command> {
        for _ in 0..200 {
            let pending = store.list_pending().await;
            if pending.len() >= count {
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} pending commands");
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let h = harness().await;
        let (_, mut rx) = connect(&h.dispatcher);
        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move { dispatcher.submit(shell("echo hi", 5)).await });

        let envelope = next_execute(&mut rx).await;
        assert_eq!(envelope.payload, shell("echo hi", 5));
        assert_eq!(
            h.store.get(&envelope.id).await.expect("get").status,
            CommandStatus::Running
        );
        h.dispatcher
            .handle_report(ExecutionReport::completed(envelope.id.clone(), "hi\n", 0))
            .await;

        let outcome = call.await.expect("join").expect("outcome");
        assert_eq!(outcome.id, envelope.id);
        assert_eq!(outcome.status, CommandStatus::Completed);
        assert_eq!(outcome.result.output.as_deref(), Some("hi\n"));
        assert_eq!(outcome.result.exit_code, Some(0));
        let stored = h.store.get(&envelope.id).await.expect("get");
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.completed_at_ms.is_some());
    }

    #[tokio::test]
    async fn times_out_without_executor() {
        let h = harness().await;
        let started = std::time::Instant::now();
        let err = h
            .dispatcher
            .submit(shell("echo hi", 1))
            .await
            .expect_err("must time out");
        assert!(started.elapsed() >= Duration::from_secs(1));
        let (id, secs) = match err {
            DispatchError::Timeout { id, secs } => (id, secs),
            other => panic!("unexpected error {other:?}"),
        };
        assert_eq!(secs, 1);
        let stored = h.store.get(&id).await.expect("get");
        assert_eq!(stored.status, CommandStatus::Timeout);
        assert!(stored.started_at_ms.is_none());
        assert!(h.store.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_results_are_correlated() {
        let h = harness().await;
        let (_, mut rx) = connect(&h.dispatcher);
        let first = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.submit(shell("date", 10)).await })
        };
        let a = next_execute(&mut rx).await;
        let second = {
            let dispatcher = Arc::clone(&h.dispatcher);
            tokio::spawn(async move { dispatcher.submit(shell("date", 10)).await })
        };
        let b = next_execute(&mut rx).await;
        assert_ne!(a.id, b.id);

        h.dispatcher
            .handle_report(ExecutionReport::completed(b.id.clone(), "second", 0))
            .await;
        h.dispatcher
            .handle_report(ExecutionReport::failed(a.id.clone(), "first failed"))
            .await;

        let first = first.await.expect("join").expect("first");
        let second = second.await.expect("join").expect("second");
        assert_eq!(first.id, a.id);
        assert_eq!(first.status, CommandStatus::Failed);
        assert_eq!(first.result.error.as_deref(), Some("first failed"));
        assert_eq!(second.id, b.id);
        assert_eq!(second.result.output.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn stray_results_are_dropped() {
        let h = harness().await;
        let (_, mut rx) = connect(&h.dispatcher);
        h.dispatcher
            .handle_report(ExecutionReport::completed("nope", "x", 0))
            .await;
        assert!(h.store.get("nope").await.is_err());

        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move { dispatcher.submit(shell("true", 10)).await });
        let envelope = next_execute(&mut rx).await;
        h.dispatcher
            .handle_report(ExecutionReport::completed(envelope.id.clone(), "", 0))
            .await;
        let settled = call.await.expect("join").expect("outcome");

        h.dispatcher
            .handle_report(ExecutionReport {
                id: envelope.id.clone(),
                status: ResultStatus::Failed,
                result: CommandResult::error("late"),
            })
            .await;
        let stored = h.store.get(&envelope.id).await.expect("get");
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(CommandOutcome::from(stored), settled);
    }

    #[tokio::test]
    async fn result_for_pending_command_settles_it() {
        let h = harness().await;
        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move { dispatcher.submit(shell("true", 10)).await });
        let pending = wait_for_pending(&h.store, 1).await;

        h.dispatcher
            .handle_report(ExecutionReport::completed(pending[0].id.clone(), "ok", 0))
            .await;
        let outcome = call.await.expect("join").expect("outcome");
        assert_eq!(outcome.status, CommandStatus::Completed);
        let stored = h.store.get(&pending[0].id).await.expect("get");
        assert!(stored.started_at_ms.is_some());
    }

    #[tokio::test]
    async fn late_result_after_timeout_is_dropped() {
        let h = harness().await;
        let (_, mut rx) = connect(&h.dispatcher);
        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move { dispatcher.submit(shell("sleep 5", 1)).await });
        let envelope = next_execute(&mut rx).await;
        let err = call.await.expect("join").expect_err("timeout");
        assert!(matches!(err, DispatchError::Timeout { .. }));

        h.dispatcher
            .handle_report(ExecutionReport::completed(envelope.id.clone(), "late", 0))
            .await;
        let stored = h.store.get(&envelope.id).await.expect("get");
        assert_eq!(stored.status, CommandStatus::Timeout);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let h = harness().await;
        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move { dispatcher.submit(shell("true", 60)).await });
        wait_for_pending(&h.store, 1).await;
        h.dispatcher.shutdown();
        let err = call.await.expect("join").expect_err("shutdown");
        assert!(matches!(err, DispatchError::ShuttingDown));
        assert!(matches!(
            h.dispatcher.submit(shell("true", 60)).await,
            Err(DispatchError::ShuttingDown)
        ));
    }
}
