//! Single-writer control arbitration.
//!
//! One global slot, `Unheld -> Held(client) -> Unheld`. The slot is an
//! `ArcSwapOption` so every transition is a compare-and-swap against the
//! holder value that was just read; two racing requests can never both win.
//! The slot outlives any session, so a disconnect that already removed the
//! session can still clear it.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use log::{debug, info};
use thiserror::Error;

use crate::gatt::ClientId;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlDenied {
    #[error("control is disabled for this gateway")]
    Disabled,
    #[error("control is held by another client")]
    HeldByOther,
    #[error("client is not connected")]
    NotConnected,
}

pub struct ControlArbiter {
    holder: ArcSwapOption<ClientId>,
    enabled: bool,
}

impl ControlArbiter {
    pub fn new(enabled: bool) -> Self {
        Self { holder: ArcSwapOption::empty(), enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current(&self) -> Option<ClientId> {
        self.holder.load().as_deref().cloned()
    }

    pub fn is_held_by(&self, client: &ClientId) -> bool {
        self.holder.load().as_deref() == Some(client)
    }

    /// Grant control to `client` if nobody holds it. Re-requesting by the
    /// current holder succeeds without touching anything.
    pub fn request_control(
        &self,
        client: &ClientId,
        sessions: &SessionRegistry,
    ) -> Result<(), ControlDenied> {
        if !self.enabled {
            return Err(ControlDenied::Disabled);
        }
        if !sessions.contains(client) {
            return Err(ControlDenied::NotConnected);
        }

        let current = self.holder.load();
        match current.as_deref() {
            Some(holder) if holder == client => return Ok(()),
            Some(_) => return Err(ControlDenied::HeldByOther),
            None => {}
        }

        let prev = self
            .holder
            .compare_and_swap(&current, Some(Arc::new(client.clone())));
        if let Some(winner) = prev.as_deref() {
            // Lost the race
            return if winner == client { Ok(()) } else { Err(ControlDenied::HeldByOther) };
        }

        if !sessions.sync_holds_control(client) {
            // Disconnected between the check and the swap; the disconnect
            // already ran its release, so undo ours.
            self.release(client);
            return Err(ControlDenied::NotConnected);
        }
        info!("Control granted to {}", client);
        Ok(())
    }

    /// Force the slot back to unheld, whoever holds it. Returns the client
    /// that lost control.
    pub fn reset(&self, sessions: &SessionRegistry) -> Option<ClientId> {
        let prev = self.holder.swap(None)?;
        // A request racing this reset may already have re-taken the slot
        sessions.sync_holds_control(&prev);
        info!("Control reset, {} no longer in control", prev);
        Some((*prev).clone())
    }

    /// Clear the slot only if `client` holds it.
    pub fn release(&self, client: &ClientId) -> bool {
        let current = self.holder.load();
        let held = match (*current).as_ref() {
            Some(holder) if **holder == *client => holder.clone(),
            _ => return false,
        };
        let prev = self.holder.compare_and_swap(&current, None::<Arc<ClientId>>);
        let released = matches!((*prev).as_ref(), Some(p) if Arc::ptr_eq(p, &held));
        if released {
            debug!("Control released by {}", client);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(enabled: bool, clients: &[&str]) -> SessionRegistry {
        let sessions = SessionRegistry::new(Arc::new(ControlArbiter::new(enabled)));
        for c in clients {
            sessions.on_connect(&ClientId::from(*c));
        }
        sessions
    }

    #[test]
    fn test_request_grants_when_unheld() {
        let sessions = registry(true, &["a"]);
        let a = ClientId::from("a");
        assert_eq!(sessions.request_control(&a), Ok(()));
        assert_eq!(sessions.arbiter().current(), Some(a.clone()));
        assert!(sessions.holds_control(&a));
    }

    #[test]
    fn test_request_is_idempotent_for_holder() {
        let sessions = registry(true, &["a"]);
        let a = ClientId::from("a");
        sessions.request_control(&a).unwrap();
        assert_eq!(sessions.request_control(&a), Ok(()));
        assert_eq!(sessions.arbiter().current(), Some(a.clone()));
        assert!(sessions.holds_control(&a));
    }

    #[test]
    fn test_request_denied_when_held_by_other() {
        let sessions = registry(true, &["a", "b"]);
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        sessions.request_control(&a).unwrap();
        assert_eq!(sessions.request_control(&b), Err(ControlDenied::HeldByOther));
        assert!(!sessions.holds_control(&b));
        assert_eq!(sessions.arbiter().current(), Some(a));
    }

    #[test]
    fn test_request_denied_when_disabled() {
        let sessions = registry(false, &["a"]);
        assert_eq!(
            sessions.request_control(&ClientId::from("a")),
            Err(ControlDenied::Disabled)
        );
        assert_eq!(sessions.arbiter().current(), None);
    }

    #[test]
    fn test_request_denied_for_unknown_client() {
        let sessions = registry(true, &[]);
        assert_eq!(
            sessions.request_control(&ClientId::from("ghost")),
            Err(ControlDenied::NotConnected)
        );
        assert_eq!(sessions.arbiter().current(), None);
    }

    #[test]
    fn test_reset_clears_any_holder() {
        let sessions = registry(true, &["a", "b"]);
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        sessions.request_control(&a).unwrap();
        assert_eq!(sessions.reset_control(), Some(a.clone()));
        assert!(!sessions.holds_control(&a));
        assert_eq!(sessions.arbiter().current(), None);
        assert_eq!(sessions.reset_control(), None);
        assert_eq!(sessions.request_control(&b), Ok(()));
    }

    #[test]
    fn test_release_only_by_holder() {
        let sessions = registry(true, &["a", "b"]);
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        sessions.request_control(&a).unwrap();
        assert!(!sessions.arbiter().release(&b));
        assert_eq!(sessions.arbiter().current(), Some(a.clone()));
        assert!(sessions.arbiter().release(&a));
        assert_eq!(sessions.arbiter().current(), None);
        assert!(!sessions.arbiter().release(&a));
    }

    #[test]
    fn test_concurrent_requests_single_winner() {
        for _ in 0..200 {
            let sessions = registry(true, &["a", "b"]);
            let barrier = std::sync::Barrier::new(2);
            let results: Vec<_> = std::thread::scope(|s| {
                let handles: Vec<_> = ["a", "b"]
                    .iter()
                    .map(|id| {
                        let sessions = &sessions;
                        let barrier = &barrier;
                        s.spawn(move || {
                            barrier.wait();
                            sessions.request_control(&ClientId::from(*id))
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            let wins = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(wins, 1, "exactly one request may win: {:?}", results);
            assert!(results.contains(&Err(ControlDenied::HeldByOther)));
        }
    }

    #[test]
    fn test_control_bit_matches_slot_under_racing_resets() {
        let a = ClientId::from("a");
        for _ in 0..5_000 {
            let sessions = registry(true, &["a"]);
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    let _ = sessions.request_control(&a);
                });
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..3 {
                        sessions.reset_control();
                    }
                });
            });
            assert_eq!(
                sessions.holds_control(&a),
                sessions.arbiter().current().as_ref() == Some(&a),
                "registry bit and arbiter slot disagree"
            );
        }
    }

    #[test]
    fn test_control_bit_matches_slot_when_holder_rerequests_during_reset() {
        let a = ClientId::from("a");
        for _ in 0..5_000 {
            let sessions = registry(true, &["a"]);
            sessions.request_control(&a).unwrap();
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..3 {
                        let _ = sessions.request_control(&a);
                    }
                });
                s.spawn(|| {
                    barrier.wait();
                    sessions.reset_control();
                });
            });
            assert_eq!(
                sessions.holds_control(&a),
                sessions.arbiter().current().as_ref() == Some(&a)
            );
        }
    }
}
