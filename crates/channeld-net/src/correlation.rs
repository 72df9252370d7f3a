//! Stub-id correlation between outbound requests and their replies.
//!
//! Each request expecting a reply is tagged with a stub id. Id 0 means "no
//! reply expected" and is never allocated. Ids are reused once their reply has
//! arrived (or the entry expired), always picking the smallest free id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::registry::Message;

/// Errors delivered to awaitable RPC waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// No reply arrived within the configured RPC timeout.
    #[error("RPC stub {0} timed out")]
    TimedOut(u32),

    /// The connection was torn down before the reply arrived.
    #[error("connection closed before the reply arrived")]
    Disconnected,

    /// The reply did not have the type the caller expected.
    #[error("unexpected reply type, expected {0}")]
    UnexpectedReply(&'static str),
}

/// Result delivered to an awaitable waiter.
pub type RpcReply = Result<Message, RpcError>;

/// A request still waiting for its reply.
pub struct PendingRpc<T> {
    /// Callback-style continuation.
    pub callback: Option<T>,
    /// Awaitable continuation.
    pub waiter: Option<oneshot::Sender<RpcReply>>,
    issued_at: Instant,
}

impl<T> PendingRpc<T> {
    /// Fail the awaitable waiter, if any. The callback is dropped unresolved.
    pub fn fail(self, err: RpcError) {
        if let Some(waiter) = self.waiter {
            // The receiver may have been dropped; nobody is listening then.
            let _ = waiter.send(Err(err));
        }
    }
}

/// Table of pending requests keyed by stub id.
pub struct StubTable<T> {
    pending: HashMap<u32, PendingRpc<T>>,
}

impl<T> StubTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Allocate a stub id for a request.
    ///
    /// Returns 0 without recording anything when there is nobody to notify.
    pub fn allocate(&mut self, callback: Option<T>, waiter: Option<oneshot::Sender<RpcReply>>) -> u32 {
        if callback.is_none() && waiter.is_none() {
            return 0;
        }

        let mut id = 1u32;
        while self.pending.contains_key(&id) {
            id += 1;
        }
        self.pending.insert(
            id,
            PendingRpc {
                callback,
                waiter,
                issued_at: Instant::now(),
            },
        );
        id
    }

    /// Take the entry for `stub_id`. A second call for the same id returns
    /// `None`.
    pub fn resolve(&mut self, stub_id: u32) -> Option<PendingRpc<T>> {
        if stub_id == 0 {
            return None;
        }
        self.pending.remove(&stub_id)
    }

    /// Remove and return every entry older than `timeout`.
    pub fn expire(&mut self, timeout: Duration) -> Vec<(u32, PendingRpc<T>)> {
        let now = Instant::now();
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.issued_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Remove and return every entry.
    pub fn abandon_all(&mut self) -> Vec<PendingRpc<T>> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    /// Whether `stub_id` is pending.
    pub fn contains(&self, stub_id: u32) -> bool {
        self.pending.contains_key(&stub_id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no entry is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for StubTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    type Callback = Box<dyn FnOnce() + Send>;

    fn noop() -> Option<Callback> {
        Some(Box::new(|| {}))
    }

    #[test]
    fn test_no_continuation_gets_zero() {
        let mut table = StubTable::<Callback>::new();
        assert_eq!(table.allocate(None, None), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_allocated_ids_are_unique_and_nonzero() {
        let mut table = StubTable::<Callback>::new();
        let ids: Vec<u32> = (0..256).map(|_| table.allocate(noop(), None)).collect();

        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(!unique.contains(&0));
    }

    #[test]
    fn test_resolve_fires_once() {
        let mut table = StubTable::<Callback>::new();
        let id = table.allocate(noop(), None);

        assert!(table.resolve(id).is_some());
        assert!(table.resolve(id).is_none());
        assert!(table.resolve(0).is_none());
    }

    #[test]
    fn test_smallest_free_id_reused() {
        let mut table = StubTable::<Callback>::new();
        let a = table.allocate(noop(), None);
        let b = table.allocate(noop(), None);
        let c = table.allocate(noop(), None);
        assert_eq!((a, b, c), (1, 2, 3));

        table.resolve(b);
        assert_eq!(table.allocate(noop(), None), 2);
        assert_eq!(table.allocate(noop(), None), 4);
    }

    #[tokio::test]
    async fn test_callback_and_waiter_share_one_stub() {
        let mut table = StubTable::<Callback>::new();
        let (tx, rx) = oneshot::channel();
        let id = table.allocate(noop(), Some(tx));

        let pending = table.resolve(id).unwrap();
        assert!(pending.callback.is_some());
        pending.waiter.unwrap().send(Ok(Box::new(7u32) as Message)).unwrap();

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.downcast_ref::<u32>(), Some(&7));
    }

    #[tokio::test]
    async fn test_expire_fails_waiters() {
        let mut table = StubTable::<Callback>::new();
        let (tx, rx) = oneshot::channel();
        let id = table.allocate(None, Some(tx));

        let expired = table.expire(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        let (expired_id, pending) = expired.into_iter().next().unwrap();
        assert_eq!(expired_id, id);
        pending.fail(RpcError::TimedOut(id));

        assert_eq!(rx.await.unwrap().unwrap_err(), RpcError::TimedOut(id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_abandon_all_empties_table() {
        let mut table = StubTable::<Callback>::new();
        table.allocate(noop(), None);
        table.allocate(noop(), None);
        assert_eq!(table.abandon_all().len(), 2);
        assert!(table.is_empty());
    }
}
