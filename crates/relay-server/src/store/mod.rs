//! Durable record of every command and its lifecycle.
//!
//! State lives in memory and is rebuilt from the journal on open. Every mutation
//! is appended and synced to the journal before the in-memory view changes, so a
//! call that returned `Ok` survives a crash.

mod journal;

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{CommandKind, CommandPayload, CommandResult, CommandStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use self::journal::{Journal, JournalEntry};

pub(crate) const JOURNAL_FILE: &str = "commands.jsonl";

const ORPHANED_RUNNING_ERROR: &str = "relay restarted while command was running";

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("command {0} not found")]
    NotFound(String),
    #[error("command {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: CommandStatus,
        to: CommandStatus,
    },
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
    #[error("failed to encode journal entry: {0}")]
    Encode(serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct Command {
    pub(crate) id: String,
    pub(crate) kind: CommandKind,
    pub(crate) status: CommandStatus,
    pub(crate) payload: CommandPayload,
    pub(crate) timeout_secs: u64,
    #[serde(default)]
    pub(crate) result: Option<CommandResult>,
    pub(crate) created_at_ms: u64,
    #[serde(default)]
    pub(crate) started_at_ms: Option<u64>,
    #[serde(default)]
    pub(crate) completed_at_ms: Option<u64>,
}

impl Command {
    fn latest_timestamp(&self) -> u64 {
        self.completed_at_ms
            .or(self.started_at_ms)
            .unwrap_or(self.created_at_ms)
    }

    fn apply(&mut self, status: CommandStatus, at_ms: u64, result: Option<CommandResult>) {
        self.status = status;
        if status == CommandStatus::Running {
            self.started_at_ms = Some(at_ms);
        }
        if status.is_terminal() {
            self.completed_at_ms = Some(at_ms);
            self.result = Some(result.unwrap_or_default());
        }
    }
}

struct StoreState {
    journal: Journal,
    commands: HashMap<String, Command>,
    /// Ids in creation order.
    order: Vec<String>,
}

pub(crate) struct CommandStore {
    state: Mutex<StoreState>,
}

impl CommandStore {
    pub(crate) async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let (journal, entries) = Journal::open(path.as_ref()).await?;
        let mut commands: HashMap<String, Command> = HashMap::new();
        let mut order = Vec::new();
        let entry_count = entries.len();
        for entry in entries {
            match entry {
                JournalEntry::Created { command } => {
                    if commands.contains_key(&command.id) {
                        tracing::warn!(
                            event = "journal.duplicate_id",
                            id = %command.id,
                            "ignoring duplicate create entry"
                        );
                        continue;
                    }
                    order.push(command.id.clone());
                    commands.insert(command.id.clone(), command);
                }
                JournalEntry::Transitioned {
                    id,
                    status,
                    at_ms,
                    result,
                } => match commands.get_mut(&id) {
                    Some(command) if command.status.can_transition_to(status) => {
                        command.apply(status, at_ms, result);
                    }
                    Some(command) => {
                        tracing::warn!(
                            event = "journal.invalid_transition",
                            id = %id,
                            from = %command.status,
                            to = %status,
                            "ignoring journal entry"
                        );
                    }
                    None => {
                        tracing::warn!(
                            event = "journal.unknown_id",
                            id = %id,
                            "ignoring transition for unknown command"
                        );
                    }
                },
            }
        }
        tracing::info!(
            event = "store.opened",
            path = %journal.path().display(),
            entries = entry_count,
            commands = order.len(),
        );
        Ok(Self {
            state: Mutex::new(StoreState {
                journal,
                commands,
                order,
            }),
        })
    }

    pub(crate) async fn create(
        &self,
        payload: CommandPayload,
        timeout_secs: u64,
    ) -> Result<Command, StoreError> {
        let mut state = self.state.lock().await;
        let mut id = new_command_id();
        while state.commands.contains_key(&id) {
            id = new_command_id();
        }
        let command = Command {
            id,
            kind: payload.kind(),
            status: CommandStatus::Pending,
            payload,
            timeout_secs,
            result: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
        };
        state
            .journal
            .append(&JournalEntry::Created {
                command: command.clone(),
            })
            .await?;
        state.order.push(command.id.clone());
        state.commands.insert(command.id.clone(), command.clone());
        Ok(command)
    }

    /// Moves a command along one edge of the lifecycle. `result` is only kept for
    /// terminal states.
    pub(crate) async fn transition(
        &self,
        id: &str,
        status: CommandStatus,
        result: Option<CommandResult>,
    ) -> Result<Command, StoreError> {
        let mut state = self.state.lock().await;
        let current = state
            .commands
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }
        let at_ms = now_ms().max(current.latest_timestamp());
        let result = if status.is_terminal() { result } else { None };
        state
            .journal
            .append(&JournalEntry::Transitioned {
                id: id.to_string(),
                status,
                at_ms,
                result: result.clone(),
            })
            .await?;
        let command = state
            .commands
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        command.apply(status, at_ms, result);
        Ok(command.clone())
    }

    pub(crate) async fn get(&self, id: &str) -> Result<Command, StoreError> {
        let state = self.state.lock().await;
        state
            .commands
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Newest first.
    pub(crate) async fn list_recent(
        &self,
        limit: usize,
        status: Option<CommandStatus>,
    ) -> Vec<Command> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.commands.get(id))
            .filter(|command| status.map_or(true, |status| command.status == status))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Pending commands, oldest first.
    pub(crate) async fn list_pending(&self) -> Vec<Command> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.commands.get(id))
            .filter(|command| command.status == CommandStatus::Pending)
            .cloned()
            .collect()
    }

    /// Times out commands left `running` by a previous process. Nothing will ever
    /// report on them: their session and their waiters are gone.
    pub(crate) async fn reconcile_orphans(&self) -> Result<usize, StoreError> {
        let running: Vec<String> = {
            let state = self.state.lock().await;
            state
                .order
                .iter()
                .filter(|id| {
                    state
                        .commands
                        .get(*id)
                        .map_or(false, |command| command.status == CommandStatus::Running)
                })
                .cloned()
                .collect()
        };
        for id in &running {
            self.transition(
                id,
                CommandStatus::Timeout,
                Some(CommandResult::error(ORPHANED_RUNNING_ERROR)),
            )
            .await?;
            tracing::warn!(event = "store.orphan_timed_out", id = %id);
        }
        Ok(running.len())
    }
}

fn new_command_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(command: &str) -> CommandPayload {
        CommandPayload::Shell {
            command: command.to_string(),
            working_dir: None,
            timeout_secs: 60,
        }
    }

    fn completed(output: &str) -> Option<CommandResult> {
        Some(CommandResult {
            output: Some(output.to_string()),
            error: None,
            exit_code: Some(0),
        })
    }

    #[tokio::test]
    async fn create_starts_pending_with_unique_ids() {
        let dir = tempdir().expect("tempdir");
        let store = CommandStore::open(dir.path().join(JOURNAL_FILE))
            .await
            .expect("open");
        let first = store.create(shell("true"), 60).await.expect("create");
        let second = store.create(shell("true"), 60).await.expect("create");
        assert_eq!(first.status, CommandStatus::Pending);
        assert_eq!(first.kind, CommandKind::Shell);
        assert!(first.started_at_ms.is_none());
        assert!(first.completed_at_ms.is_none());
        assert_ne!(first.id, second.id);
        assert_eq!(first.id.len(), 32);
    }

    #[tokio::test]
    async fn transition_follows_state_machine() {
        let dir = tempdir().expect("tempdir");
        let store = CommandStore::open(dir.path().join(JOURNAL_FILE))
            .await
            .expect("open");
        let command = store.create(shell("echo hi"), 60).await.expect("create");

        let err = store
            .transition(&command.id, CommandStatus::Completed, completed("hi"))
            .await
            .expect_err("pending cannot complete directly");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let running = store
            .transition(&command.id, CommandStatus::Running, completed("ignored"))
            .await
            .expect("run");
        assert!(running.started_at_ms.is_some());
        assert!(running.result.is_none());

        let done = store
            .transition(&command.id, CommandStatus::Completed, completed("hi\n"))
            .await
            .expect("complete");
        assert_eq!(done.status, CommandStatus::Completed);
        assert!(done.completed_at_ms >= done.started_at_ms);
        assert!(done.started_at_ms >= Some(done.created_at_ms));

        for next in [
            CommandStatus::Pending,
            CommandStatus::Running,
            CommandStatus::Failed,
            CommandStatus::Timeout,
        ] {
            assert!(store.transition(&command.id, next, None).await.is_err());
        }
        assert_eq!(store.get(&command.id).await.expect("get"), done);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = CommandStore::open(dir.path().join(JOURNAL_FILE))
            .await
            .expect("open");
        let err = store
            .transition("missing", CommandStatus::Running, None)
            .await
            .expect_err("unknown id");
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listings_are_ordered() {
        let dir = tempdir().expect("tempdir");
        let store = CommandStore::open(dir.path().join(JOURNAL_FILE))
            .await
            .expect("open");
        let a = store.create(shell("a"), 60).await.expect("create");
        let b = store.create(shell("b"), 60).await.expect("create");
        let c = store.create(shell("c"), 60).await.expect("create");
        store
            .transition(&b.id, CommandStatus::Running, None)
            .await
            .expect("run");

        let recent: Vec<String> = store
            .list_recent(10, None)
            .await
            .into_iter()
            .map(|command| command.id)
            .collect();
        assert_eq!(recent, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

        let limited = store.list_recent(1, None).await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, c.id);

        let running = store.list_recent(10, Some(CommandStatus::Running)).await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);

        let pending: Vec<String> = store
            .list_pending()
            .await
            .into_iter()
            .map(|command| command.id)
            .collect();
        assert_eq!(pending, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(JOURNAL_FILE);
        let (done_id, pending_id) = {
            let store = CommandStore::open(&path).await.expect("open");
            let done = store.create(shell("echo hi"), 5).await.expect("create");
            store
                .transition(&done.id, CommandStatus::Running, None)
                .await
                .expect("run");
            store
                .transition(&done.id, CommandStatus::Completed, completed("hi\n"))
                .await
                .expect("complete");
            let pending = store
                .create(
                    CommandPayload::ReadFile {
                        path: "~/notes.txt".to_string(),
                    },
                    30,
                )
                .await
                .expect("create");
            (done.id, pending.id)
        };

        let store = CommandStore::open(&path).await.expect("reopen");
        let done = store.get(&done_id).await.expect("done");
        assert_eq!(done.status, CommandStatus::Completed);
        assert_eq!(
            done.result.and_then(|result| result.output).as_deref(),
            Some("hi\n")
        );
        let pending = store.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, pending_id);
        assert_eq!(pending[0].kind, CommandKind::ReadFile);
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(JOURNAL_FILE);
        let id = {
            let store = CommandStore::open(&path).await.expect("open");
            store.create(shell("true"), 60).await.expect("create").id
        };
        let mut raw = std::fs::read(&path).expect("read");
        raw.extend_from_slice(br#"{"op":"transitioned","id":""#);
        std::fs::write(&path, &raw).expect("write");

        let store = CommandStore::open(&path).await.expect("reopen");
        assert_eq!(
            store.get(&id).await.expect("get").status,
            CommandStatus::Pending
        );
        store
            .transition(&id, CommandStatus::Running, None)
            .await
            .expect("append after repair");
        drop(store);

        let store = CommandStore::open(&path).await.expect("reopen again");
        assert_eq!(
            store.get(&id).await.expect("get").status,
            CommandStatus::Running
        );
    }

    #[tokio::test]
    async fn corrupt_middle_line_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(JOURNAL_FILE);
        std::fs::write(&path, "not json\n{}\n").expect("write");
        assert!(matches!(
            CommandStore::open(&path).await,
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn orphaned_running_commands_time_out() {
        let dir = tempdir().expect("tempdir");
        let store = CommandStore::open(dir.path().join(JOURNAL_FILE))
            .await
            .expect("open");
        let running = store.create(shell("sleep 100"), 60).await.expect("create");
        let pending = store.create(shell("true"), 60).await.expect("create");
        store
            .transition(&running.id, CommandStatus::Running, None)
            .await
            .expect("run");

        assert_eq!(store.reconcile_orphans().await.expect("reconcile"), 1);
        let orphan = store.get(&running.id).await.expect("get");
        assert_eq!(orphan.status, CommandStatus::Timeout);
        assert_eq!(
            orphan.result.and_then(|result| result.error).as_deref(),
            Some(ORPHANED_RUNNING_ERROR)
        );
        assert_eq!(
            store.get(&pending.id).await.expect("get").status,
            CommandStatus::Pending
        );
        assert_eq!(store.reconcile_orphans().await.expect("reconcile"), 0);
    }
}
