use std::sync::Arc;
use std::time::Duration;

use super::{DispatchError, Dispatcher};
use crate::store::now_ms;

impl Dispatcher {
    /// Arms timers for pending commands inherited from a previous relay process.
    /// Nobody waits on them, but they still expire at creation time plus their
    /// timeout, whether or not recovery has sent them by then.
    pub(crate) async fn adopt_orphans(self: &Arc<Self>) -> usize {
        let orphans = self.store.list_pending().await;
        let now = now_ms();
        for command in &orphans {
            let deadline_ms = command
                .created_at_ms
                .saturating_add(command.timeout_secs.saturating_mul(1000));
            let remaining = Duration::from_millis(deadline_ms.saturating_sub(now));
            let dispatcher = Arc::clone(self);
            let id = command.id.clone();
            let secs = command.timeout_secs;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = dispatcher.shutdown.cancelled() => return,
                }
                if let Err(err) = dispatcher.time_out(&id, secs).await {
                    tracing::error!(event = "command.expire_failed", id = %id, error = %err);
                }
            });
        }
        if !orphans.is_empty() {
            tracing::info!(event = "recovery.orphans_adopted", count = orphans.len());
        }
        orphans.len()
    }

    /// Redelivers every pending command to session `session_id`, oldest first.
    ///
    /// The session only accepts fresh submissions after the first sweep, and a
    /// second sweep then catches anything created while the first one ran.
    /// Running commands are left alone; their timers settle them.
    pub(crate) async fn recover(&self, session_id: u64) -> Result<usize, DispatchError> {
        let mut delivered = self.sweep(session_id).await?;
        if !self.sessions.mark_ready(session_id) {
            tracing::info!(event = "recovery.aborted", session_id, delivered);
            return Ok(delivered);
        }
        delivered += self.sweep(session_id).await?;
        tracing::info!(event = "recovery.finished", session_id, delivered);
        Ok(delivered)
    }

    async fn sweep(&self, session_id: u64) -> Result<usize, DispatchError> {
        let mut delivered = 0;
        for command in self.store.list_pending().await {
            let Ok(permit) = self.sessions.reserve_on(session_id).await else {
                break;
            };
            if self.send_with(permit, &command).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
