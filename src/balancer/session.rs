//! Client Session Affinity

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: String,
    pub instance_id: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// client id -> bound instance, with sliding expiry
#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Live binding for `client`; an expired one is dropped, never returned
    pub fn get(&self, client: &str, now: Instant) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        match sessions.get(client) {
            Some(s) if s.is_expired(now) => {
                sessions.remove(client);
                None
            }
            Some(s) => Some(s.clone()),
            None => None,
        }
    }

    /// Extend a live session's expiry
    pub fn touch(&self, client: &str, now: Instant) {
        if let Some(s) = self.sessions.lock().get_mut(client) {
            s.expires_at = now + self.ttl;
        }
    }

    /// Bind `client` to `instance`, replacing any earlier binding
    pub fn bind(&self, client: &str, instance: &str, now: Instant) {
        self.sessions.lock().insert(
            client.to_string(),
            Session {
                client_id: client.to_string(),
                instance_id: instance.to_string(),
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }

    /// Drop every binding to `instance`
    pub fn unbind_instance(&self, instance: &str) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.instance_id != instance);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, now: Instant) -> SessionStats {
        let sessions = self.sessions.lock();
        let expired = sessions.values().filter(|s| s.is_expired(now)).count();
        SessionStats {
            total: sessions.len(),
            live: sessions.len() - expired,
            expired,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub live: usize,
    pub expired: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_inert() {
        let store = SessionStore::new(Duration::from_secs(10));
        let now = Instant::now();
        store.bind("client", "instance-001", now);
        assert!(store.get("client", now + Duration::from_secs(9)).is_some());
        assert!(store.get("client", now + Duration::from_secs(10)).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_slides_expiry() {
        let store = SessionStore::new(Duration::from_secs(10));
        let now = Instant::now();
        store.bind("client", "instance-001", now);
        store.touch("client", now + Duration::from_secs(8));
        assert!(store.get("client", now + Duration::from_secs(15)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_and_unbind() {
        let store = SessionStore::new(Duration::from_secs(10));
        let now = Instant::now();
        store.bind("a", "i-1", now);
        store.bind("b", "i-2", now + Duration::from_secs(5));
        store.bind("c", "i-2", now + Duration::from_secs(5));

        assert_eq!(store.stats(now + Duration::from_secs(10)).expired, 1);
        assert_eq!(store.purge_expired(now + Duration::from_secs(10)), 1);
        assert_eq!(store.unbind_instance("i-2"), 2);
        assert!(store.is_empty());
    }
}
