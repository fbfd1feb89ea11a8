//! Session key → [`Session`] map.
//!
//! Joining a key that has no live session creates one; the session is removed
//! again when its last participant leaves, so the next joiner starts over with
//! id 0 and no leader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kayo_core::RelayError;
use tracing::{debug, info};

use crate::session::{ConnectionHandle, Participant, Session};

/// Live sessions by session key.
///
/// Lock order is registry, then session. Nothing here is held across an
/// `.await`.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The session for `key`, created on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<Session> {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(key) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }
        info!(session = key, "Session created");
        let session = Arc::new(Session::new(key));
        sessions.insert(key.to_owned(), session.clone());
        session
    }

    /// Join `key`, creating the session if needed.
    pub fn join(
        &self,
        key: &str,
        conn: ConnectionHandle,
        origin: Option<String>,
    ) -> Result<(Arc<Session>, Participant), RelayError> {
        let mut sessions = self.lock();
        loop {
            let session = match sessions.get(key) {
                Some(s) => s.clone(),
                None => {
                    info!(session = key, "Session created");
                    let s = Arc::new(Session::new(key));
                    sessions.insert(key.to_owned(), s.clone());
                    s
                }
            };
            match session.join(conn.clone(), origin.clone()) {
                Ok(participant) => return Ok((session, participant)),
                Err(RelayError::SessionClosed { .. }) => {
                    debug!(session = key, "Raced with removal, retrying on a fresh session");
                    sessions.remove(key);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove `session` if it is still the registered instance for its key and
    /// still empty. Returns whether it was removed.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.lock();
        let registered = sessions
            .get(session.key())
            .map_or(false, |current| Arc::ptr_eq(current, session));
        if !registered || !session.close_if_empty() {
            return false;
        }
        sessions.remove(session.key());
        info!(session = session.key(), "Session removed");
        true
    }

    /// Take `id` out of `session`, dropping the session once empty.
    pub fn leave(&self, session: &Arc<Session>, id: u64) {
        if session.leave(id) {
            self.remove(session);
        }
    }

    /// Close every session and hang up on every connection.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.lock().drain().map(|(_, s)| s).collect();
        let mut connections = 0;
        for session in &drained {
            connections += session.close_all();
        }
        info!(sessions = drained.len(), connections, "Registry drained");
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn session(&self, key: &str) -> Option<Arc<Session>> {
        self.lock().get(key).cloned()
    }
}
