//! Session registry: id and assigned-ip indexes over the live sessions.
//!
//! Mutations happen under the write lock; reads under the read lock. No
//! caller ever closes a session while holding either lock — `remove`
//! returns the session so the close happens after the lock is gone.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::session::Session;

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Arc<Session>>,
    by_ip: HashMap<Ipv4Addr, Arc<Session>>,
}

/// Shared session index.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Registry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into both indexes atomically.
    pub async fn insert(&self, session: Arc<Session>) {
        let mut inner = self.inner.write().await;
        inner
            .by_ip
            .insert(session.assigned_ip, Arc::clone(&session));
        inner.by_id.insert(session.id.clone(), session);
    }

    /// Remove both index entries; the returned session is closed by the
    /// caller outside the lock.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.by_id.remove(id)?;
        inner.by_ip.remove(&session.assigned_ip);
        Some(session)
    }

    pub async fn by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    pub async fn by_ip(&self, ip: Ipv4Addr) -> Option<Arc<Session>> {
        self.inner.read().await.by_ip.get(&ip).cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.by_id.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }
}
