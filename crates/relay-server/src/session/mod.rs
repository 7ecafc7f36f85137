//! The single executor slot.
//!
//! At most one session is live. Attaching a new one swaps it into the slot and
//! cancels the previous session's token, which closes its socket. All outbound
//! frames for a session go through one bounded channel drained by that session's
//! writer task.

pub(crate) mod auth;
pub(crate) mod socket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use protocol::RelayMessage;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio_util::sync::CancellationToken;

pub(crate) const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum SessionError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("no executor session")]
    NoSession,
}

struct LiveSession {
    id: u64,
    peer: String,
    outbound: mpsc::Sender<RelayMessage>,
    closed: CancellationToken,
    /// Set once the first recovery sweep has finished.
    ready: bool,
}

/// Handle given to the connection task that owns a session.
#[derive(Debug, Clone)]
pub(crate) struct SessionTicket {
    pub(crate) id: u64,
    pub(crate) closed: CancellationToken,
}

#[derive(Default)]
pub(crate) struct SessionManager {
    slot: Mutex<Option<LiveSession>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes `outbound` the live session, superseding any previous one.
    pub(crate) fn attach(&self, peer: &str, outbound: mpsc::Sender<RelayMessage>) -> SessionTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let closed = CancellationToken::new();
        let previous = {
            let mut slot = self.lock_slot();
            slot.replace(LiveSession {
                id,
                peer: peer.to_string(),
                outbound,
                closed: closed.clone(),
                ready: false,
            })
        };
        if let Some(previous) = previous {
            previous.closed.cancel();
            tracing::info!(
                event = "session.superseded",
                session_id = previous.id,
                peer = %previous.peer,
                by = id,
            );
        }
        tracing::info!(event = "session.attached", session_id = id, peer = %peer);
        SessionTicket { id, closed }
    }

    /// Clears the slot if it still holds session `id`. Returns whether it did.
    pub(crate) fn detach(&self, id: u64) -> bool {
        let removed = {
            let mut slot = self.lock_slot();
            if slot.as_ref().map_or(false, |live| live.id == id) {
                slot.take()
            } else {
                None
            }
        };
        match removed {
            Some(live) => {
                live.closed.cancel();
                tracing::info!(event = "session.detached", session_id = id, peer = %live.peer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_ready(&self, id: u64) -> bool {
        let mut slot = self.lock_slot();
        match slot.as_mut() {
            Some(live) if live.id == id => {
                live.ready = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock_slot().is_some()
    }

    pub(crate) fn current_id(&self) -> Option<u64> {
        self.lock_slot().as_ref().map(|live| live.id)
    }

    /// Reserves an outbound slot on the live session once it is ready for new
    /// work. Sending through the permit cannot fail or interleave.
    pub(crate) async fn reserve(&self) -> Result<OwnedPermit<RelayMessage>, SessionError> {
        let sender = {
            let slot = self.lock_slot();
            match slot.as_ref() {
                Some(live) if live.ready => live.outbound.clone(),
                _ => return Err(SessionError::NoSession),
            }
        };
        sender
            .reserve_owned()
            .await
            .map_err(|_| SessionError::NoSession)
    }

    /// Like [`reserve`](Self::reserve) but bound to one session, ready or not.
    /// Used by recovery while the session is still warming up.
    pub(crate) async fn reserve_on(&self, id: u64) -> Result<OwnedPermit<RelayMessage>, SessionError> {
        let sender = {
            let slot = self.lock_slot();
            match slot.as_ref() {
                Some(live) if live.id == id => live.outbound.clone(),
                _ => return Err(SessionError::NoSession),
            }
        };
        sender
            .reserve_owned()
            .await
            .map_err(|_| SessionError::NoSession)
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<LiveSession>> {
        // The slot is only swapped, never left half-written, so a poisoned lock is still usable.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_session_supersedes_old() {
        let sessions = SessionManager::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, _rx_b) = mpsc::channel(4);
        let a = sessions.attach("10.0.0.1:1", tx_a);
        let b = sessions.attach("10.0.0.1:2", tx_b);
        assert!(a.closed.is_cancelled());
        assert!(!b.closed.is_cancelled());
        assert_eq!(sessions.current_id(), Some(b.id));

        assert!(!sessions.detach(a.id), "stale detach must not clear the slot");
        assert!(sessions.is_connected());
        assert!(sessions.detach(b.id));
        assert!(!sessions.is_connected());
        assert!(b.closed.is_cancelled());
    }

    #[tokio::test]
    async fn reserve_waits_for_ready() {
        let sessions = SessionManager::new();
        assert_eq!(sessions.reserve().await.err(), Some(SessionError::NoSession));

        let (tx, mut rx) = mpsc::channel(4);
        let ticket = sessions.attach("peer", tx);
        assert_eq!(sessions.reserve().await.err(), Some(SessionError::NoSession));

        let permit = sessions.reserve_on(ticket.id).await.expect("recovery permit");
        permit.send(RelayMessage::Ping);
        assert_eq!(rx.recv().await, Some(RelayMessage::Ping));

        assert!(sessions.mark_ready(ticket.id));
        let permit = sessions.reserve().await.expect("permit");
        permit.send(RelayMessage::Pong);
        assert_eq!(rx.recv().await, Some(RelayMessage::Pong));
    }

    #[tokio::test]
    async fn reserve_on_rejects_other_sessions() {
        let sessions = SessionManager::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let a = sessions.attach("a", tx_a);
        let (tx_b, _rx_b) = mpsc::channel(4);
        let _b = sessions.attach("b", tx_b);
        assert_eq!(
            sessions.reserve_on(a.id).await.err(),
            Some(SessionError::NoSession)
        );
        assert!(!sessions.mark_ready(a.id));
    }

    #[tokio::test]
    async fn reserve_fails_when_writer_is_gone() {
        let sessions = SessionManager::new();
        let (tx, rx) = mpsc::channel(4);
        let ticket = sessions.attach("peer", tx);
        sessions.mark_ready(ticket.id);
        drop(rx);
        assert_eq!(sessions.reserve().await.err(), Some(SessionError::NoSession));
    }
}
