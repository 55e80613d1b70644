use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::odoo::pool::ConnectionPool;

#[derive(Debug, Clone)]
struct Session {
    uid: i64,
    created_at: Instant,
    last_used: Instant,
}

/// In-memory session table with inactivity expiry.
///
/// Ids are opaque random UUIDs; `resolve` touches `last_used`, and a
/// background sweeper removes sessions whose `last_used + ttl` has passed.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, Session>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn insert(&self, uid: i64) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        sessions.insert(
            id.clone(),
            Session {
                uid,
                created_at: now,
                last_used: now,
            },
        );
        id
    }

    /// Return the uid behind a live session, refreshing its expiry.
    pub fn resolve(&self, session_id: &str) -> GatewayResult<i64> {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(GatewayError::Session("unknown session id".to_string()));
        };

        if session.last_used.elapsed() > self.ttl {
            sessions.remove(session_id);
            return Err(GatewayError::Session("session expired".to_string()));
        }

        session.last_used = Instant::now();
        Ok(session.uid)
    }

    /// Idempotent removal.
    pub fn destroy(&self, session_id: &str) {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        if sessions.remove(session_id).is_some() {
            debug!(session_id, "session destroyed");
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("session mutex poisoned").len()
    }

    /// Remove expired sessions; returns how many were reaped.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, s| s.last_used.elapsed() <= ttl);
        before - sessions.len()
    }

    pub fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let reaped = store.sweep();
                if reaped > 0 {
                    info!(reaped, "expired sessions removed");
                }
            }
        })
    }

    #[cfg(test)]
    fn age(&self, session_id: &str) -> Option<Duration> {
        let sessions = self.inner.lock().unwrap();
        sessions.get(session_id).map(|s| s.created_at.elapsed())
    }
}

/// Resolves credentials to a uid through the pool and issues session ids.
///
/// The issued session authorizes the gateway to act; Odoo still sees the
/// gateway's configured global credentials on the wire.
#[derive(Clone)]
pub struct Authenticator {
    pool: ConnectionPool,
    store: SessionStore,
    database: String,
}

impl Authenticator {
    pub fn new(pool: ConnectionPool, store: SessionStore, database: String) -> Self {
        Self {
            pool,
            store,
            database,
        }
    }

    pub async fn create_session(&self, username: &str, secret: &str) -> GatewayResult<(String, i64)> {
        let mut conn = self.pool.acquire().await?;
        let result = conn
            .handler()
            .authenticate(&self.database, username, secret)
            .await;

        let uid = match result {
            Ok(uid) => uid,
            Err(e) => {
                if matches!(e, GatewayError::Network(_) | GatewayError::ConnectionFailed(_)) {
                    conn.mark_failed();
                }
                return Err(e);
            }
        };

        let session_id = self.store.insert(uid);
        info!(uid, "session created");
        Ok((session_id, uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_resolve() {
        let store = SessionStore::new(Duration::from_secs(60));
        let id = store.insert(7);
        assert_eq!(store.resolve(&id).unwrap(), 7);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_resolve_unknown() {
        let store = SessionStore::new(Duration::from_secs(60));
        let err = store.resolve("nope").unwrap_err();
        assert_eq!(err.code(), -32006);
    }

    #[test]
    fn test_ids_are_opaque_and_unique() {
        let store = SessionStore::new(Duration::from_secs(60));
        let a = store.insert(1);
        let b = store.insert(1);
        assert_ne!(a, b);
        assert!(a.len() >= 32);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let store = SessionStore::new(Duration::from_secs(60));
        let id = store.insert(3);
        store.destroy(&id);
        store.destroy(&id);
        assert!(store.resolve(&id).is_err());
    }

    #[test]
    fn test_expired_session_rejected_and_removed() {
        let store = SessionStore::new(Duration::from_millis(0));
        let id = store.insert(5);
        std::thread::sleep(Duration::from_millis(5));
        let err = store.resolve(&id).unwrap_err();
        assert_eq!(err.code(), -32006);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_resolve_touches_last_used() {
        let store = SessionStore::new(Duration::from_millis(80));
        let id = store.insert(5);
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            assert!(store.resolve(&id).is_ok(), "touch should keep it alive");
        }
        assert!(store.age(&id).unwrap() >= Duration::from_millis(120));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = SessionStore::new(Duration::from_millis(30));
        let stale = store.insert(1);
        std::thread::sleep(Duration::from_millis(40));
        let fresh = store.insert(2);
        assert_eq!(store.sweep(), 1);
        assert!(store.resolve(&stale).is_err());
        assert!(store.resolve(&fresh).is_ok());
    }
}
