use serde::{Deserialize, Serialize};
use std::fmt;

pub mod defaults;
pub mod wire;

pub use wire::{AgentMessage, RelayMessage};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Shell,
    ReadFile,
    WriteFile,
    ListDir,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Shell => "shell",
            CommandKind::ReadFile => "read_file",
            CommandKind::WriteFile => "write_file",
            CommandKind::ListDir => "list_dir",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a command.
///
/// `Pending` and `Running` are the only non-terminal states. Allowed edges:
/// `pending -> running`, `pending -> timeout`, and `running -> completed | failed | timeout`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Pending, CommandStatus::Running)
                | (CommandStatus::Pending, CommandStatus::Timeout)
                | (CommandStatus::Running, CommandStatus::Completed)
                | (CommandStatus::Running, CommandStatus::Failed)
                | (CommandStatus::Running, CommandStatus::Timeout)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(CommandStatus::Pending),
            "running" => Ok(CommandStatus::Running),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" => Ok(CommandStatus::Timeout),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// Kind-specific fields of a command, tagged by `kind` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    Shell {
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        timeout_secs: u64,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ListDir {
        path: String,
    },
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Shell { .. } => CommandKind::Shell,
            CommandPayload::ReadFile { .. } => CommandKind::ReadFile,
            CommandPayload::WriteFile { .. } => CommandKind::WriteFile,
            CommandPayload::ListDir { .. } => CommandKind::ListDir,
        }
    }

    /// One-line description for logs. File contents are never included.
    pub fn summary(&self) -> String {
        match self {
            CommandPayload::Shell { command, .. } => command.clone(),
            CommandPayload::ReadFile { path } | CommandPayload::ListDir { path } => path.clone(),
            CommandPayload::WriteFile { path, content } => {
                format!("{path} ({} bytes)", content.len())
            }
        }
    }
}

/// Terminal outcome reported by the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
    Timeout,
}

impl From<ResultStatus> for CommandStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Completed => CommandStatus::Completed,
            ResultStatus::Failed => CommandStatus::Failed,
            ResultStatus::Timeout => CommandStatus::Timeout,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(message.into()),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionReport {
    pub id: String,
    pub status: ResultStatus,
    #[serde(flatten)]
    pub result: CommandResult,
}

impl ExecutionReport {
    pub fn completed(id: impl Into<String>, output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            id: id.into(),
            status: ResultStatus::Completed,
            result: CommandResult {
                output: Some(output.into()),
                error: None,
                exit_code: Some(exit_code),
            },
        }
    }

    pub fn failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResultStatus::Failed,
            result: CommandResult {
                output: None,
                error: Some(message.into()),
                exit_code: Some(1),
            },
        }
    }

    pub fn timed_out(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResultStatus::Timeout,
            result: CommandResult {
                output: None,
                error: Some(message.into()),
                exit_code: Some(-1),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_edges_are_allowed() {
        use CommandStatus::*;
        let all = [Pending, Running, Completed, Failed, Timeout];
        let allowed = [
            (Pending, Running),
            (Pending, Timeout),
            (Running, Completed),
            (Running, Failed),
            (Running, Timeout),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use CommandStatus::*;
        for from in [Completed, Failed, Timeout] {
            assert!(from.is_terminal());
            for to in [Pending, Running, Completed, Failed, Timeout] {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn status_parses_from_query_strings() {
        assert_eq!("running".parse::<CommandStatus>(), Ok(CommandStatus::Running));
        assert!("done".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn write_summary_hides_content() {
        let payload = CommandPayload::WriteFile {
            path: "/tmp/a".to_string(),
            content: "secret".to_string(),
        };
        assert_eq!(payload.summary(), "/tmp/a (6 bytes)");
        assert_eq!(payload.kind(), CommandKind::WriteFile);
    }
}
