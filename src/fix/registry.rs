//! The engine-wide session registry.
//!
//! An explicit object owned by the engine and passed by reference; there is
//! no hidden global. Sessions stay registered across network disconnects and
//! leave only on engine shutdown or explicit unregistration.

use crate::fix::session::Session;
use crate::fix::session_id::SessionId;
use crate::MessageBuilder;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no session registered for {0}")]
    UnknownSession(SessionId),
    #[error("a session is already registered for {0}")]
    DuplicateSession(SessionId),
}

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager::default()
    }

    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().expect("registry poisoned");
        let session_id = session.session_id().clone();
        if sessions.contains_key(&session_id) {
            return Err(RegistryError::DuplicateSession(session_id));
        }
        info!(%session_id, "session registered");
        sessions.insert(session_id, session);
        Ok(())
    }

    pub fn lookup(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("registry poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn unregister(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .expect("registry poisoned")
            .remove(session_id)
    }

    pub fn unregister_all(&self) {
        let mut sessions = self.sessions.write().expect("registry poisoned");
        for session in sessions.values() {
            session.close();
        }
        sessions.clear();
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send-by-identity: find the session and hand it the message. Returns
    /// the session's queued/not-queued answer.
    pub fn send_to_target(
        &self,
        builder: MessageBuilder,
        session_id: &SessionId,
    ) -> Result<bool, RegistryError> {
        let session = self
            .lookup(session_id)
            .ok_or_else(|| RegistryError::UnknownSession(session_id.clone()))?;
        Ok(session.send(builder))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::application::NullApplication;
    use crate::fix::session::Session;
    use crate::fix::store::MemoryStore;
    use crate::{EngineType, SessionSettings};

    fn session(sender: &str) -> Arc<Session> {
        let settings = SessionSettings::builder()
            .with_begin_string("FIX.4.2")
            .with_sender_comp_id(sender)
            .with_target_comp_id("THEM")
            .with_engine_type(EngineType::Initiator)
            .build()
            .unwrap();
        Session::new(
            settings,
            Box::new(MemoryStore::new()),
            Arc::new(NullApplication),
        )
        .unwrap()
    }

    #[test]
    fn test_register_lookup_unregister() {
        let manager = SessionManager::new();
        let s = session("US");
        let id = s.session_id().clone();
        manager.register(Arc::clone(&s)).unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.lookup(&id).is_some());
        assert!(matches!(
            manager.register(s),
            Err(RegistryError::DuplicateSession(_))
        ));
        manager.unregister(&id);
        assert!(manager.lookup(&id).is_none());
    }

    #[test]
    fn test_send_to_unknown_target() {
        let manager = SessionManager::new();
        let id = crate::fix::session_id::SessionId::new("FIX.4.2", "A", "B");
        let builder = MessageBuilder::new("FIX.4.2", 'D');
        assert!(matches!(
            manager.send_to_target(builder, &id),
            Err(RegistryError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_unregister_all() {
        let manager = SessionManager::new();
        manager.register(session("ONE")).unwrap();
        manager.register(session("TWO")).unwrap();
        assert_eq!(manager.len(), 2);
        manager.unregister_all();
        assert!(manager.is_empty());
    }
}
