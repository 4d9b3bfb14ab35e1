//! Connection Registry
//!
//! Concurrent table of live viewer sessions keyed by connection token.
//! Tokens come from a process-wide counter starting at 1 and are never
//! reused. Lookups and removals lock one shard of the map, never the whole
//! table.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::market::UserId;

/// Identifier of one viewer connection.
pub type ConnectionToken = u64;

/// Capacity of a session's outbound queue. A send waits until the session's
/// send loop has taken the previous frame.
const OUTBOUND_CAPACITY: usize = 1;

/// One live viewer session as seen by the rest of the relay.
#[derive(Debug)]
pub struct SessionHandle {
    token: ConnectionToken,
    outbound: mpsc::Sender<String>,
    user_id: AtomicI64,
    closer: CancellationToken,
}

impl SessionHandle {
    /// Connection token.
    #[must_use]
    pub const fn token(&self) -> ConnectionToken {
        self.token
    }

    /// Authenticated user, 0 until a login is accepted.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id.load(Ordering::Acquire)
    }

    /// Bind the session to an authenticated user.
    pub fn bind_user(&self, user: UserId) {
        self.user_id.store(user, Ordering::Release);
    }

    /// Queue a frame for the client, waiting for the send loop to take it.
    ///
    /// Returns `false` once the session's send loop has ended.
    pub async fn send(&self, frame: String) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Force the session closed. Both loops observe this and end.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Token cancelled when the session is closing.
    #[must_use]
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }
}

/// Live sessions by token.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionToken, Arc<SessionHandle>>,
    next_token: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Allocate a token and insert an unauthenticated session. The receiver
    /// is the session's outbound queue.
    pub fn register(&self) -> (Arc<SessionHandle>, mpsc::Receiver<String>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Arc::new(SessionHandle {
            token,
            outbound,
            user_id: AtomicI64::new(0),
            closer: CancellationToken::new(),
        });
        self.sessions.insert(token, Arc::clone(&handle));
        (handle, rx)
    }

    /// Session for a token, if still live.
    #[must_use]
    pub fn lookup(&self, token: ConnectionToken) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&token).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session. Unknown tokens are ignored.
    pub fn unregister(&self, token: ConnectionToken) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&token).map(|(_, handle)| handle)
    }

    /// Visit live sessions. Sessions added or removed concurrently may or
    /// may not be visited.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<SessionHandle>)) {
        for entry in &self.sessions {
            f(entry.value());
        }
    }

    /// Live sessions ordered by token, detached from the table so callers
    /// may await while holding them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        let mut sessions = Vec::with_capacity(self.sessions.len());
        self.for_each(|handle| sessions.push(Arc::clone(handle)));
        sessions.sort_by_key(|handle| handle.token);
        sessions
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[test]
    fn tokens_are_unique_and_never_reused() {
        let registry = SessionRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let (handle, _rx) = registry.register();
            assert!(seen.insert(handle.token()));
            registry.unregister(handle.token());
        }
        assert!(registry.is_empty());
        assert!(!seen.contains(&0));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = registry.register();
        assert!(registry.unregister(handle.token()).is_some());
        assert!(registry.unregister(handle.token()).is_none());
        assert!(registry.unregister(999).is_none());
        assert!(registry.lookup(handle.token()).is_none());
    }

    #[test]
    fn snapshot_is_ordered_by_token() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..5).map(|_| registry.register()).collect();
        let tokens: Vec<_> = registry.snapshot().iter().map(|h| h.token()).collect();
        let expected: Vec<_> = handles.iter().map(|(h, _)| h.token()).collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn sessions_start_unauthenticated() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = registry.register();
        assert_eq!(handle.user_id(), 0);
        handle.bind_user(42);
        assert_eq!(registry.lookup(handle.token()).unwrap().user_id(), 42);
    }

    #[test]
    fn send_waits_for_the_consumer() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = registry.register();

        assert!(assert_ready!(task::spawn(handle.send("a".into())).poll()));

        let mut blocked = task::spawn(handle.send("b".into()));
        assert_pending!(blocked.poll());

        assert_eq!(rx.try_recv().as_deref(), Ok("a"));
        assert!(blocked.is_woken());
        assert!(assert_ready!(blocked.poll()));

        drop(rx);
        assert!(!assert_ready!(task::spawn(handle.send("c".into())).poll()));
    }

    #[tokio::test]
    async fn concurrent_registration_yields_distinct_tokens() {
        let registry = Arc::new(SessionRegistry::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    (0..25)
                        .map(|_| registry.register().0.token())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for task in tasks {
            for token in task.await.unwrap() {
                assert!(all.insert(token));
            }
        }
        assert_eq!(all.len(), 200);
        assert_eq!(registry.len(), 200);
    }
}
