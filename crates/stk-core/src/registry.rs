//! In-flight requests, so that `/stop` can cancel them.
//!
//! Process-scoped; nothing here survives a restart.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio_util::sync::CancellationToken;

use crate::domain::{ChatId, UserId};

type Key = (ChatId, UserId);

#[derive(Default)]
struct Inner {
    running: HashMap<Key, Vec<(u64, CancellationToken)>>,
    next_id: u64,
}

#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<Inner>,
    root: CancellationToken,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new request; it is forgotten when the returned guard drops.
    pub fn register(self: &Arc<Self>, chat: ChatId, user: UserId) -> Registration {
        let token = self.root.child_token();
        let mut st = self.state();
        st.next_id += 1;
        let id = st.next_id;
        st.running
            .entry((chat, user))
            .or_default()
            .push((id, token.clone()));
        Registration {
            registry: self.clone(),
            key: (chat, user),
            id,
            token,
        }
    }

    /// Cancel every request of `user` in `chat`. Returns how many were running.
    pub fn cancel(&self, chat: ChatId, user: UserId) -> usize {
        let st = self.state();
        let Some(tokens) = st.running.get(&(chat, user)) else {
            return 0;
        };
        for (_, token) in tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Cancel everything, e.g. on shutdown.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn running(&self, chat: ChatId, user: UserId) -> usize {
        self.state()
            .running
            .get(&(chat, user))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove(&self, key: Key, id: u64) {
        let mut st = self.state();
        if let Some(tokens) = st.running.get_mut(&key) {
            tokens.retain(|(i, _)| *i != id);
            if tokens.is_empty() {
                st.running.remove(&key);
            }
        }
    }
}

pub struct Registration {
    registry: Arc<RequestRegistry>,
    key: Key,
    id: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: ChatId = ChatId(-1);

    #[test]
    fn stop_cancels_only_the_callers_requests() {
        let registry = Arc::new(RequestRegistry::new());
        let mine = registry.register(CHAT, UserId(1));
        let theirs = registry.register(CHAT, UserId(2));
        let elsewhere = registry.register(ChatId(-2), UserId(1));

        assert_eq!(registry.cancel(CHAT, UserId(1)), 1);
        assert!(mine.token().is_cancelled());
        assert!(!theirs.token().is_cancelled());
        assert!(!elsewhere.token().is_cancelled());
    }

    #[test]
    fn finished_requests_are_forgotten() {
        let registry = Arc::new(RequestRegistry::new());
        let a = registry.register(CHAT, UserId(1));
        let b = registry.register(CHAT, UserId(1));
        assert_eq!(registry.running(CHAT, UserId(1)), 2);

        drop(a);
        assert_eq!(registry.running(CHAT, UserId(1)), 1);
        drop(b);
        assert_eq!(registry.running(CHAT, UserId(1)), 0);
        assert_eq!(registry.cancel(CHAT, UserId(1)), 0);
    }

    #[test]
    fn cancel_all_reaches_every_request() {
        let registry = Arc::new(RequestRegistry::new());
        let a = registry.register(CHAT, UserId(1));
        let b = registry.register(ChatId(-9), UserId(3));
        registry.cancel_all();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }
}
