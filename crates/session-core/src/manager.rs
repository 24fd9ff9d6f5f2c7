//! The process-wide resource registry.
//!
//! Sessions are shared-ownership handles: the registry holds one `Arc`,
//! every task driving or feeding the session holds another. `remove` only
//! drops the registry's reference, so a task that is still unwinding keeps
//! a valid session until it finishes.
//!
//! Sessions are findable two ways: by device id (SIP binding, control API)
//! and by SSRC (media binding), the latter through a secondary fast-id
//! index filled in when an INVITE or publish request fixes the SSRC.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::CoreConfig;
use crate::session::GbSession;

/// A concurrent id → handle registry with an optional numeric fast index.
pub struct ResourceManager<T> {
    by_id: DashMap<String, Arc<T>>,
    by_fast_id: DashMap<u64, Arc<T>>,
}

impl<T> ResourceManager<T> {
    pub fn new() -> Self {
        Self { by_id: DashMap::new(), by_fast_id: DashMap::new() }
    }

    pub fn insert(&self, id: &str, handle: Arc<T>) {
        self.by_id.insert(id.to_string(), handle);
    }

    pub fn find(&self, id: &str) -> Option<Arc<T>> {
        self.by_id.get(id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.by_id.remove(id).map(|(_, v)| v)
    }

    pub fn insert_fast(&self, fast_id: u64, handle: Arc<T>) {
        self.by_fast_id.insert(fast_id, handle);
    }

    pub fn find_fast(&self, fast_id: u64) -> Option<Arc<T>> {
        self.by_fast_id.get(&fast_id).map(|e| e.value().clone())
    }

    pub fn remove_fast(&self, fast_id: u64) -> Option<Arc<T>> {
        self.by_fast_id.remove(&fast_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Snapshot of the current handles, for shutdown sweeps.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}

/// Owner of all GB sessions, shared by the listeners and the control API.
pub struct GbManager {
    me: std::sync::Weak<GbManager>,
    config: CoreConfig,
    sessions: ResourceManager<GbSession>,
}

impl GbManager {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            sessions: ResourceManager::new(),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn sessions(&self) -> &ResourceManager<GbSession> {
        &self.sessions
    }

    /// Look a session up by device id, creating and starting one if absent.
    pub fn find_or_create_session(&self, device_id: &str) -> Arc<GbSession> {
        if let Some(session) = self.sessions.find(device_id) {
            return session;
        }
        let this = self.me.upgrade().expect("manager is alive while in use");
        let session = GbSession::new(&this, device_id);
        self.sessions.insert(device_id, session.clone());
        tokio::spawn(session.clone().cycle());
        tracing::info!(device_id, session = %session.id(), "session created");
        session
    }

    /// Ask every session to dispose; they drain out of the registry as
    /// their driver tasks unwind.
    pub fn interrupt_all(&self) {
        for session in self.sessions.values() {
            session.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_handles_survive_removal() {
        let m: ResourceManager<String> = ResourceManager::new();
        let handle = Arc::new("payload".to_string());
        m.insert("a", handle.clone());
        m.insert_fast(42, handle);

        let held = m.find("a").unwrap();
        assert_eq!(m.find_fast(42).as_deref(), Some(&"payload".to_string()));

        m.remove("a");
        m.remove_fast(42);
        assert!(m.find("a").is_none());
        assert!(m.find_fast(42).is_none());

        // The caller's reference is still alive.
        assert_eq!(&*held, "payload");
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let manager = GbManager::new(CoreConfig::default());
        let a = manager.find_or_create_session("34020000001320000001");
        let b = manager.find_or_create_session("34020000001320000001");
        assert_eq!(a.id(), b.id());
        assert_eq!(manager.sessions().len(), 1);

        a.dispose();
    }
}
