//! Ordered, per-ID-deduplicated delta queue between the watcher and its
//! consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use modelgate_auth::{Auth, AuthId};

#[derive(Debug, Clone, PartialEq)]
pub enum AuthChange {
    Add(Auth),
    Modify(Auth),
    Delete { provider: String, id: AuthId },
}

impl AuthChange {
    pub fn id(&self) -> &str {
        match self {
            AuthChange::Add(auth) | AuthChange::Modify(auth) => &auth.id,
            AuthChange::Delete { id, .. } => id,
        }
    }
}

#[derive(Default)]
struct Inner {
    order: VecDeque<AuthId>,
    pending: HashMap<AuthId, AuthChange>,
}

/// Events are delivered in insertion order; a newer event for an ID whose
/// prior event is still pending replaces it in place (last writer wins
/// per entity).
#[derive(Default)]
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, change: AuthChange) {
        let id = change.id().to_string();
        {
            let mut inner = self.inner.lock().expect("dispatch queue lock");
            if !inner.pending.contains_key(&id) {
                inner.order.push_back(id.clone());
            }
            inner.pending.insert(id, change);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<AuthChange> {
        let mut inner = self.inner.lock().expect("dispatch queue lock");
        let id = inner.order.pop_front()?;
        inner.pending.remove(&id)
    }

    pub async fn recv(&self) -> AuthChange {
        loop {
            if let Some(change) = self.try_pop() {
                return change;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dispatch queue lock").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn auth(id: &str) -> Auth {
        Auth::new(id, "gemini", datetime!(2025-06-01 00:00:00 UTC))
    }

    #[test]
    fn preserves_insertion_order() {
        let queue = DispatchQueue::new();
        queue.push(AuthChange::Add(auth("a")));
        queue.push(AuthChange::Add(auth("b")));
        assert_eq!(queue.try_pop().unwrap().id(), "a");
        assert_eq!(queue.try_pop().unwrap().id(), "b");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn pending_updates_collapse_to_latest() {
        let queue = DispatchQueue::new();
        queue.push(AuthChange::Add(auth("a")));
        let mut updated = auth("a");
        updated
            .attributes
            .insert("api_key".to_string(), "new".to_string());
        queue.push(AuthChange::Modify(updated.clone()));
        queue.push(AuthChange::Add(auth("b")));

        // One event for "a", carrying the latest state, original position.
        assert_eq!(queue.len(), 2);
        match queue.try_pop().unwrap() {
            AuthChange::Modify(auth) => {
                assert_eq!(auth.attribute("api_key"), Some("new"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(queue.try_pop().unwrap().id(), "b");
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = std::sync::Arc::new(DispatchQueue::new());
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.recv().await });
        tokio::task::yield_now().await;
        queue.push(AuthChange::Delete {
            provider: "gemini".to_string(),
            id: "gone".to_string(),
        });
        let change = handle.await.unwrap();
        assert_eq!(change.id(), "gone");
    }
}
