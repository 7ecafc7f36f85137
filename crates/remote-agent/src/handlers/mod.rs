mod files;
mod shell;
mod stream;

use std::time::Instant;

use protocol::wire::CommandEnvelope;
use protocol::{CommandPayload, ExecutionReport};

use crate::sandbox::PathPolicy;

/// Everything a command needs to run: the path policy, the output ceiling and
/// the shell used for shell commands.
#[derive(Debug, Clone)]
pub(crate) struct Handlers {
    policy: PathPolicy,
    max_output_bytes: usize,
    shell: String,
}

impl Handlers {
    pub(crate) fn new(policy: PathPolicy, max_output_bytes: usize, shell: String) -> Self {
        Self {
            policy,
            max_output_bytes,
            shell,
        }
    }

    /// Runs one command to completion. Failures of any kind come back as a
    /// failed or timed out report tagged with the command id.
    pub(crate) async fn execute(&self, envelope: CommandEnvelope) -> ExecutionReport {
        let CommandEnvelope { id, payload } = envelope;
        let started = Instant::now();
        tracing::info!(
            event = "command.started",
            id = %id,
            kind = %payload.kind(),
            summary = %payload.summary(),
        );
        let report = match payload {
            CommandPayload::Shell {
                command,
                working_dir,
                timeout_secs,
            } => shell::run_shell(self, &id, &command, working_dir.as_deref(), timeout_secs).await,
            CommandPayload::ReadFile { path } => {
                finish(&id, files::read_file(&self.policy, &path, self.max_output_bytes).await)
            }
            CommandPayload::WriteFile { path, content } => {
                finish(&id, files::write_file(&self.policy, &path, &content).await)
            }
            CommandPayload::ListDir { path } => {
                finish(&id, files::list_dir(&self.policy, &path, self.max_output_bytes).await)
            }
        };
        tracing::info!(
            event = "command.finished",
            id = %id,
            status = ?report.status,
            exit_code = ?report.result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        report
    }
}

fn finish(id: &str, outcome: Result<String, files::FileError>) -> ExecutionReport {
    match outcome {
        Ok(output) => ExecutionReport::completed(id, output, 0),
        Err(err) => {
            tracing::warn!(event = "command.rejected", id = %id, error = %err);
            ExecutionReport::failed(id, err.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use protocol::ResultStatus;
    use std::path::Path;

    pub(crate) async fn handlers_for(root: &Path, max_output_bytes: usize) -> Handlers {
        let policy = PathPolicy::new(root.to_path_buf(), &["~".to_string()]).await;
        Handlers::new(policy, max_output_bytes, "/bin/sh".to_string())
    }

    fn envelope(payload: CommandPayload) -> CommandEnvelope {
        CommandEnvelope {
            id: "cmd-1".to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn reports_carry_the_command_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handlers = handlers_for(dir.path(), 1024).await;

        let report = handlers
            .execute(envelope(CommandPayload::ListDir {
                path: "~".to_string(),
            }))
            .await;
        assert_eq!(report.id, "cmd-1");
        assert_eq!(report.status, ResultStatus::Completed);
        assert_eq!(report.result.exit_code, Some(0));

        let report = handlers
            .execute(envelope(CommandPayload::ReadFile {
                path: "/etc/hostname".to_string(),
            }))
            .await;
        assert_eq!(report.id, "cmd-1");
        assert_eq!(report.status, ResultStatus::Failed);
        assert!(report
            .result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("access denied"));
    }
}
