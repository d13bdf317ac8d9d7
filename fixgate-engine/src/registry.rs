/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Session registry.
//!
//! The registry exclusively owns every session: it assigns dense session
//! ids per composite key, rejects duplicate binds for a `(key, host
//! profile)` pair, and routes inbound connections to their session. The
//! rest of the engine refers to sessions by id only, which keeps the
//! session/publication/handler graph acyclic.

use fixgate_core::{CompositeKey, EngineError, SessionId};
use fixgate_ilink3::Ilink3Connection;
use fixgate_session::FixSession;
use std::collections::HashMap;
use tracing::debug;

/// A registered session of either protocol family.
#[derive(Debug)]
pub enum GatewaySession {
    /// A FIX session, initiator or acceptor.
    Fix(FixSession),
    /// An ILink3 initiator connection.
    Ilink3(Ilink3Connection),
}

impl GatewaySession {
    /// The registry-assigned session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        match self {
            Self::Fix(session) => session.id(),
            Self::Ilink3(connection) => connection.id(),
        }
    }

    /// True until the session reaches its terminal state.
    #[must_use]
    pub fn is_live(&self) -> bool {
        match self {
            Self::Fix(session) => !session.state().is_terminal(),
            Self::Ilink3(connection) => !connection.state().is_terminal(),
        }
    }
}

/// Owns sessions and their connection bindings.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_session_id: u64,
    ids: HashMap<CompositeKey, SessionId>,
    sessions: HashMap<SessionId, GatewaySession>,
    by_connection: HashMap<u64, SessionId>,
    bindings: HashMap<(SessionId, String), u64>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session id for `key`, assigning the next dense id on
    /// first sight. The flag reports whether the id was newly assigned.
    pub fn lookup_or_create(&mut self, key: &CompositeKey) -> (SessionId, bool) {
        if let Some(&id) = self.ids.get(key) {
            return (id, false);
        }
        self.next_session_id += 1;
        let id = SessionId::new(self.next_session_id);
        self.ids.insert(key.clone(), id);
        debug!(session_id = %id, key = %key, "assigned session id");
        (id, true)
    }

    /// Restores a persisted id mapping, keeping future assignments dense
    /// above it.
    pub fn restore_id(&mut self, key: CompositeKey, id: SessionId) {
        self.next_session_id = self.next_session_id.max(id.value());
        self.ids.insert(key, id);
    }

    /// Takes ownership of a session.
    pub fn insert(&mut self, session: GatewaySession) {
        self.sessions.insert(session.id(), session);
    }

    /// Borrows a session by id.
    #[must_use]
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut GatewaySession> {
        self.sessions.get_mut(&id)
    }

    /// Binds a connection to a session on a host profile.
    ///
    /// # Errors
    /// `EngineError::DuplicateConnection` when the `(session, host
    /// profile)` pair is already bound to a live session.
    pub fn bind(
        &mut self,
        connection_id: u64,
        session_id: SessionId,
        host_profile: &str,
    ) -> Result<(), EngineError> {
        let binding = (session_id, host_profile.to_string());
        if let Some(&existing) = self.bindings.get(&binding) {
            let still_live = self
                .by_connection
                .get(&existing)
                .and_then(|id| self.sessions.get(id))
                .is_some_and(GatewaySession::is_live);
            if still_live {
                return Err(EngineError::DuplicateConnection {
                    session_id: session_id.value(),
                    host_profile: host_profile.to_string(),
                });
            }
            self.by_connection.remove(&existing);
        }

        self.bindings.insert(binding, connection_id);
        self.by_connection.insert(connection_id, session_id);
        debug!(connection_id, session_id = %session_id, host_profile, "bound connection");
        Ok(())
    }

    /// Resolves an inbound connection to its session.
    ///
    /// # Errors
    /// `EngineError::UnknownSession` when the connection is unbound.
    pub fn route(&mut self, connection_id: u64) -> Result<&mut GatewaySession, EngineError> {
        let session_id = self
            .by_connection
            .get(&connection_id)
            .copied()
            .ok_or(EngineError::UnknownSession { connection_id })?;
        self.sessions
            .get_mut(&session_id)
            .ok_or(EngineError::UnknownSession { connection_id })
    }

    /// Releases a connection binding, e.g. on transport drop.
    pub fn unbind(&mut self, connection_id: u64) -> Option<SessionId> {
        let session_id = self.by_connection.remove(&connection_id)?;
        self.bindings
            .retain(|_, &mut bound| bound != connection_id);
        Some(session_id)
    }

    /// Iterates all sessions mutably, for the poll loop.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut GatewaySession> {
        self.sessions.values_mut()
    }

    /// Session ids currently owned.
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Removes sessions that reached their terminal state and whose final
    /// notification the library has consumed.
    pub fn reap_terminal(&mut self) -> Vec<SessionId> {
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| !session.is_live())
            .map(|(&id, _)| id)
            .collect();
        for id in &dead {
            self.sessions.remove(id);
            self.by_connection.retain(|_, bound| *bound != *id);
            self.bindings.retain(|(session, _), _| *session != *id);
        }
        dead
    }

    /// Number of live sessions.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.sessions.values().filter(|s| s.is_live()).count()
    }
}
