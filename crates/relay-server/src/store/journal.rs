use std::path::{Path, PathBuf};

use protocol::{CommandResult, CommandStatus};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{Command, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(super) enum JournalEntry {
    Created {
        command: Command,
    },
    Transitioned {
        id: String,
        status: CommandStatus,
        at_ms: u64,
        #[serde(default)]
        result: Option<CommandResult>,
    },
}

/// Append-only JSON-lines log. Each append is synced to disk before it returns.
pub(super) struct Journal {
    path: PathBuf,
    file: File,
    /// Length of the file up to the last complete entry.
    len: u64,
}

impl Journal {
    /// Opens the journal, returning its existing entries in write order.
    ///
    /// A final line without a trailing newline is a torn write from a crash; it is
    /// cut off so later appends start on a clean line.
    pub(super) async fn open(path: &Path) -> Result<(Self, Vec<JournalEntry>), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        let mut good_len = 0usize;
        let mut offset = 0usize;
        let mut line_no = 0usize;
        while offset < raw.len() {
            line_no += 1;
            let rest = &raw[offset..];
            let (line, consumed, complete) = match rest.iter().position(|byte| *byte == b'\n') {
                Some(end) => (&rest[..end], end + 1, true),
                None => (rest, rest.len(), false),
            };
            offset += consumed;
            if line.iter().all(u8::is_ascii_whitespace) {
                if complete {
                    good_len = offset;
                }
                continue;
            }
            if !complete {
                tracing::warn!(
                    event = "journal.torn_tail",
                    path = %path.display(),
                    line = line_no,
                    bytes = line.len(),
                    "discarding incomplete journal line"
                );
                break;
            }
            let entry = serde_json::from_slice::<JournalEntry>(line).map_err(|source| {
                StoreError::Corrupt {
                    line: line_no,
                    source,
                }
            })?;
            entries.push(entry);
            good_len = offset;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        if good_len < raw.len() {
            file.set_len(good_len as u64).await?;
            file.sync_data().await?;
        }
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                len: good_len as u64,
            },
            entries,
        ))
    }

    /// Writes one entry. A failed write is cut back off the file so the next
    /// entry does not land on the end of a partial line.
    pub(super) async fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry).map_err(StoreError::Encode)?;
        line.push(b'\n');
        match self.write_line(&line).await {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.rollback().await;
                Err(err.into())
            }
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    async fn rollback(&mut self) {
        let truncated = async {
            self.file.set_len(self.len).await?;
            self.file.sync_data().await
        }
        .await;
        if let Err(err) = truncated {
            tracing::error!(
                event = "journal.rollback_failed",
                path = %self.path.display(),
                len = self.len,
                error = %err,
            );
        }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }
}
