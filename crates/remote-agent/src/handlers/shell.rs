use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use protocol::{CommandResult, ExecutionReport, ResultStatus};
use tokio::process::{Child, Command};

use super::stream::read_stream_capture;
use super::Handlers;
use crate::output::render_output;

/// Time the group gets to exit after SIGINT before SIGKILL.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);
const GROUP_POLL: Duration = Duration::from_millis(50);

pub(super) async fn run_shell(
    handlers: &Handlers,
    id: &str,
    command: &str,
    working_dir: Option<&str>,
    timeout_secs: u64,
) -> ExecutionReport {
    if command.trim().is_empty() {
        return ExecutionReport::failed(id, "command is empty");
    }
    let cwd = match working_dir {
        Some(dir) => match handlers.policy.resolve(dir).await {
            Ok(cwd) => Some(cwd),
            Err(err) => {
                tracing::warn!(event = "command.rejected", id = %id, error = %err);
                return ExecutionReport::failed(id, format!("working directory: {err}"));
            }
        },
        None => None,
    };
    let timeout = Duration::from_secs(timeout_secs.max(1));
    match execute_shell(
        &handlers.shell,
        command,
        cwd.as_deref(),
        timeout,
        handlers.max_output_bytes,
    )
    .await
    {
        Ok(Some(result)) => {
            let status = if result.exit_code == Some(0) {
                ResultStatus::Completed
            } else {
                ResultStatus::Failed
            };
            ExecutionReport {
                id: id.to_string(),
                status,
                result,
            }
        }
        Ok(None) => ExecutionReport::timed_out(
            id,
            format!("command timed out after {} seconds", timeout.as_secs()),
        ),
        Err(err) => ExecutionReport::failed(id, format!("{err:#}")),
    }
}

/// Runs `command` through `shell -c`. `None` means the deadline passed before
/// the shell exited and every holder of its output pipes was gone; the whole
/// process group has been stopped by then.
async fn execute_shell(
    shell: &str,
    command: &str,
    cwd: Option<&Path>,
    timeout: Duration,
    max_bytes: usize,
) -> anyhow::Result<Option<CommandResult>> {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let (mut child, group) =
        ShellGroup::spawn(&mut cmd).with_context(|| format!("failed to spawn {shell} -c"))?;
    let stdout = child.stdout.take().context("missing stdout")?;
    let stderr = child.stderr.take().context("missing stderr")?;

    // Background jobs inherit the pipes, so draining them counts against the
    // same deadline as the shell itself.
    let finished = tokio::time::timeout(timeout, async {
        tokio::join!(
            child.wait(),
            read_stream_capture(stdout, max_bytes),
            read_stream_capture(stderr, max_bytes),
        )
    })
    .await;
    let Ok((status, stdout, stderr)) = finished else {
        group.stop(&mut child).await;
        return Ok(None);
    };

    let status = status.context("wait on child")?;
    let (stdout, stdout_truncated) = stdout.context("stdout read")?;
    let (stderr, stderr_truncated) = stderr.context("stderr read")?;
    let stderr = render_output(&stderr, stderr_truncated);
    Ok(Some(CommandResult {
        output: Some(render_output(&stdout, stdout_truncated)),
        error: (!stderr.is_empty()).then_some(stderr),
        // Killed by a signal: no code.
        exit_code: Some(status.code().unwrap_or(-1)),
    }))
}

/// The session a shell runs in. The shell leads a fresh session, so its pid is
/// also the group id and stays valid after the shell itself has been reaped.
struct ShellGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl ShellGroup {
    fn spawn(cmd: &mut Command) -> std::io::Result<(Child, Self)> {
        #[cfg(unix)]
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        Ok((child, Self { pgid }))
    }

    /// SIGINT to every member, SIGKILL to whatever is left after the grace
    /// period. Reaps the shell either way.
    async fn stop(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            self.signal(libc::SIGINT);
            let drained = tokio::time::timeout(INTERRUPT_GRACE, async {
                loop {
                    let _ = child.try_wait();
                    if !self.has_members() {
                        break;
                    }
                    tokio::time::sleep(GROUP_POLL).await;
                }
            })
            .await
            .is_ok();
            if !drained {
                tracing::warn!(event = "command.group_killed", pgid = ?self.pgid);
                self.signal(libc::SIGKILL);
            }
        }
        let _ = child.kill().await;
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        if let Some(pgid) = self.pgid {
            // SAFETY: plain syscall on a group this agent created.
            unsafe {
                libc::kill(-pgid, signal);
            }
        }
    }

    #[cfg(unix)]
    fn has_members(&self) -> bool {
        match self.pgid {
            // SAFETY: signal 0 only checks that the group exists.
            Some(pgid) => unsafe { libc::kill(-pgid, 0) == 0 },
            None => false,
        }
    }
}
