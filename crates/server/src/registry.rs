//! Session registry.
//!
//! The registry exclusively owns every live `Session`. Each one sits behind
//! its own mutex so operations on one session are serialized while different
//! sessions proceed independently. Callers never get a reference to a
//! `Session` outside of [`SessionRegistry::with_session`].
//!
//! Lock order: a session slot may be held while taking the registry map
//! lock, never the other way round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rally_state::{Member, Session, SessionCode, SessionError, SessionView};
use time::OffsetDateTime;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Slot {
    session: Session,
    /// Cleared when the session is destroyed, so a caller that looked the
    /// handle up just before destruction sees `NotFound`.
    live: bool,
}

/// Identity of a session that was destroyed by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destroyed {
    pub id: SessionCode,
    pub was_public: bool,
}

/// Result of a successful [`SessionRegistry::with_session`] call.
#[derive(Debug)]
pub struct Mutation<R> {
    pub value: R,
    /// Set when the mutation left the session empty and it was removed.
    pub destroyed: Option<Destroyed>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionCode, Arc<Mutex<Slot>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with `creator` as its only member.
    ///
    /// Draws a fresh code, re-drawing while it collides with a live one.
    pub fn create(&self, creator: Member, is_public: bool, now: OffsetDateTime) -> SessionView {
        let mut sessions = lock(&self.sessions);
        let mut code = SessionCode::generate();
        while sessions.contains_key(&code) {
            code = SessionCode::generate();
        }

        let session = Session::new(code.clone(), creator, is_public, now);
        let view = session.view();
        sessions.insert(
            code,
            Arc::new(Mutex::new(Slot {
                session,
                live: true,
            })),
        );
        view
    }

    /// Run `f` with exclusive access to one session.
    ///
    /// If `f` succeeds and leaves the session without members, the session
    /// is destroyed before the slot lock is released.
    pub fn with_session<R>(
        &self,
        code: &SessionCode,
        f: impl FnOnce(&mut Session) -> Result<R, SessionError>,
    ) -> Result<Mutation<R>, SessionError> {
        let handle = lock(&self.sessions)
            .get(code)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(code.clone()))?;

        let mut slot = lock(&handle);
        if !slot.live {
            return Err(SessionError::NotFound(code.clone()));
        }

        let value = f(&mut slot.session)?;

        let destroyed = if slot.session.is_empty() {
            slot.live = false;
            lock(&self.sessions).remove(code);
            Some(Destroyed {
                id: code.clone(),
                was_public: slot.session.is_public(),
            })
        } else {
            None
        };

        Ok(Mutation { value, destroyed })
    }

    /// Point-in-time copy of one session.
    pub fn view(&self, code: &SessionCode) -> Option<SessionView> {
        let handle = lock(&self.sessions).get(code).cloned()?;
        let slot = lock(&handle);
        slot.live.then(|| slot.session.view())
    }

    pub fn contains(&self, code: &SessionCode) -> bool {
        lock(&self.sessions).contains_key(code)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_state::{MemberId, Status};

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    #[test]
    fn test_create_registers_session() {
        let registry = SessionRegistry::new();
        let view = registry.create(Member::new("Alice", now()), true, now());

        assert!(registry.contains(&view.id));
        assert_eq!(registry.len(), 1);
        assert_eq!(view.status, Status::Waiting);
        assert_eq!(view.members.len(), 1);
    }

    #[test]
    fn test_codes_are_unique() {
        let registry = SessionRegistry::new();
        for _ in 0..200 {
            registry.create(Member::new("P", now()), false, now());
        }
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn test_unknown_code_is_not_found() {
        let registry = SessionRegistry::new();
        let code = SessionCode::parse("DEADBEEF").unwrap();
        let err = registry.with_session(&code, |_| Ok(())).unwrap_err();
        assert_eq!(err, SessionError::NotFound(code));
    }

    #[test]
    fn test_rejected_mutation_keeps_session() {
        let registry = SessionRegistry::new();
        let view = registry.create(Member::new("Alice", now()), true, now());

        let err = registry
            .with_session(&view.id, |s| s.start(&MemberId::new()))
            .unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);
        assert_eq!(registry.view(&view.id).unwrap(), view);
    }

    #[test]
    fn test_last_leave_destroys() {
        let registry = SessionRegistry::new();
        let view = registry.create(Member::new("Alice", now()), true, now());
        let alice = view.creator_id;

        let mutation = registry
            .with_session(&view.id, |s| Ok(s.remove_member(&alice)))
            .unwrap();

        assert!(mutation.value.is_some());
        assert_eq!(
            mutation.destroyed,
            Some(Destroyed {
                id: view.id.clone(),
                was_public: true,
            })
        );
        assert!(!registry.contains(&view.id));
        assert!(registry.view(&view.id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_non_last_leave_keeps_session() {
        let registry = SessionRegistry::new();
        let view = registry.create(Member::new("Alice", now()), false, now());
        let bob = Member::new("Bob", now());
        let bob_id = bob.id;

        registry.with_session(&view.id, |s| s.add_member(bob)).unwrap();
        let mutation = registry
            .with_session(&view.id, |s| Ok(s.remove_member(&bob_id)))
            .unwrap();

        assert!(mutation.destroyed.is_none());
        assert_eq!(registry.view(&view.id).unwrap().members.len(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A session exists exactly while it has members.
            #[test]
            fn test_destroyed_iff_empty(ops in prop::collection::vec(any::<bool>(), 1..48)) {
                let registry = SessionRegistry::new();
                let view = registry.create(Member::new("Alice", now()), false, now());
                let mut members = vec![view.creator_id];

                for join in ops {
                    if members.is_empty() {
                        break;
                    }
                    if join {
                        let m = Member::new("P", now());
                        members.push(m.id);
                        registry.with_session(&view.id, |s| s.add_member(m)).unwrap();
                    } else {
                        let id = members.remove(0);
                        let mutation = registry
                            .with_session(&view.id, |s| Ok(s.remove_member(&id)))
                            .unwrap();
                        prop_assert_eq!(mutation.destroyed.is_some(), members.is_empty());
                    }
                    prop_assert_eq!(registry.contains(&view.id), !members.is_empty());
                }
            }
        }
    }
}
