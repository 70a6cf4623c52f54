//! Demultiplexing pool for the local development server.
//!
//! A single pool type backs both sides of local mode: the run-loop pops
//! queued invocations anonymously in FIFO order, while suspended HTTP
//! clients collect the response entries belonging to their own request id.
//! The two consumption modes are mutually exclusive; mixing them is an API
//! misuse, never a deadlock. Cancelling drains waiters but keeps entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{RuntimeError, UsageError};

/// Entries are demultiplexed by their request id.
pub(crate) trait Keyed {
    fn request_id(&self) -> &str;
}

enum WaitMode<T> {
    Idle,
    Anonymous(oneshot::Sender<T>),
    Keyed(HashMap<String, oneshot::Sender<T>>),
}

struct PoolInner<T> {
    entries: VecDeque<T>,
    waiting: WaitMode<T>,
    cancelled: bool,
}

pub(crate) struct Pool<T> {
    inner: Arc<Mutex<PoolInner<T>>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Keyed + Send> Pool<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                entries: VecDeque::new(),
                waiting: WaitMode::Idle,
                cancelled: false,
            })),
        }
    }

    /// Push an entry, waking a matching waiter if one is parked.
    pub(crate) fn push(&self, entry: T) {
        let mut inner = self.inner.lock();
        let waiting = std::mem::replace(&mut inner.waiting, WaitMode::Idle);
        match waiting {
            WaitMode::Idle => inner.entries.push_back(entry),
            WaitMode::Anonymous(tx) => {
                if let Err(entry) = tx.send(entry) {
                    inner.entries.push_back(entry);
                }
            }
            WaitMode::Keyed(mut waiters) => {
                match waiters.remove(entry.request_id()) {
                    Some(tx) => {
                        if let Err(entry) = tx.send(entry) {
                            inner.entries.push_back(entry);
                        }
                    }
                    None => inner.entries.push_back(entry),
                }
                if !waiters.is_empty() {
                    inner.waiting = WaitMode::Keyed(waiters);
                }
            }
        }
    }

    /// Pop the oldest entry regardless of key, waiting if the pool is
    /// empty. Only one anonymous consumer may wait at a time, and not
    /// while per-request consumers are parked.
    pub(crate) async fn next(&self) -> Result<T, RuntimeError> {
        let rx = {
            let mut inner = self.inner.lock();
            match &inner.waiting {
                WaitMode::Anonymous(_) => return Err(UsageError::NextCalledTwice.into()),
                WaitMode::Keyed(_) => return Err(UsageError::MixedWaitingModes.into()),
                WaitMode::Idle => {}
            }
            if let Some(entry) = inner.entries.pop_front() {
                return Ok(entry);
            }
            if inner.cancelled {
                return Err(RuntimeError::Cancelled);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiting = WaitMode::Anonymous(tx);
            rx
        };

        let mut cleanup = WaitCleanup {
            inner: &self.inner,
            key: None,
            armed: true,
        };
        let received = rx.await;
        cleanup.armed = false;
        received.map_err(|_| RuntimeError::Cancelled)
    }

    /// Pop the oldest entry for `request_id`, waiting if none is queued.
    /// Entries for a given id are delivered in push order; a second
    /// concurrent waiter on the same id is a usage error.
    pub(crate) async fn next_for(&self, request_id: &str) -> Result<T, RuntimeError> {
        let rx = {
            let mut inner = self.inner.lock();
            match &inner.waiting {
                WaitMode::Anonymous(_) => return Err(UsageError::MixedWaitingModes.into()),
                WaitMode::Keyed(waiters) if waiters.contains_key(request_id) => {
                    return Err(UsageError::DuplicateRequestIdWait(request_id.to_string()).into())
                }
                _ => {}
            }
            if let Some(index) = inner
                .entries
                .iter()
                .position(|entry| entry.request_id() == request_id)
            {
                return Ok(inner.entries.remove(index).expect("index in bounds"));
            }
            if inner.cancelled {
                return Err(RuntimeError::Cancelled);
            }
            let (tx, rx) = oneshot::channel();
            match &mut inner.waiting {
                WaitMode::Idle => {
                    let mut waiters = HashMap::new();
                    waiters.insert(request_id.to_string(), tx);
                    inner.waiting = WaitMode::Keyed(waiters);
                }
                WaitMode::Keyed(waiters) => {
                    waiters.insert(request_id.to_string(), tx);
                }
                WaitMode::Anonymous(_) => unreachable!("checked above"),
            }
            rx
        };

        let mut cleanup = WaitCleanup {
            inner: &self.inner,
            key: Some(request_id.to_string()),
            armed: true,
        };
        let received = rx.await;
        cleanup.armed = false;
        received.map_err(|_| RuntimeError::Cancelled)
    }

    /// Drop every parked waiter. Queued entries stay consumable; future
    /// waits fail with `Cancelled` once the pool runs dry.
    pub(crate) fn cancel_waiters(&self) {
        let mut inner = self.inner.lock();
        inner.cancelled = true;
        inner.waiting = WaitMode::Idle;
    }
}

/// Clears an abandoned waiter registration when a `next`/`next_for` future
/// is dropped before its entry arrives.
struct WaitCleanup<'a, T> {
    inner: &'a Mutex<PoolInner<T>>,
    key: Option<String>,
    armed: bool,
}

impl<T> Drop for WaitCleanup<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock();
        match (&mut inner.waiting, &self.key) {
            (WaitMode::Anonymous(_), None) => inner.waiting = WaitMode::Idle,
            (WaitMode::Keyed(waiters), Some(key)) => {
                waiters.remove(key);
                if waiters.is_empty() {
                    inner.waiting = WaitMode::Idle;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry {
        id: String,
        seq: u32,
    }

    impl Entry {
        fn new(id: &str, seq: u32) -> Self {
            Self {
                id: id.to_string(),
                seq,
            }
        }
    }

    impl Keyed for Entry {
        fn request_id(&self) -> &str {
            &self.id
        }
    }

    #[tokio::test]
    async fn anonymous_consumption_is_fifo() {
        let pool = Pool::new();
        pool.push(Entry::new("a", 1));
        pool.push(Entry::new("b", 2));
        pool.push(Entry::new("a", 3));
        assert_eq!(pool.next().await.unwrap(), Entry::new("a", 1));
        assert_eq!(pool.next().await.unwrap(), Entry::new("b", 2));
        assert_eq!(pool.next().await.unwrap(), Entry::new("a", 3));
    }

    #[tokio::test]
    async fn anonymous_wait_wakes_on_push() {
        let pool = Pool::new();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        tokio::task::yield_now().await;
        pool.push(Entry::new("a", 1));
        assert_eq!(waiter.await.unwrap().unwrap(), Entry::new("a", 1));
    }

    #[tokio::test]
    async fn keyed_waiters_receive_their_entries_in_push_order() {
        let pool = Pool::new();
        pool.push(Entry::new("a", 1));
        pool.push(Entry::new("b", 10));
        pool.push(Entry::new("a", 2));

        assert_eq!(pool.next_for("a").await.unwrap(), Entry::new("a", 1));
        assert_eq!(pool.next_for("a").await.unwrap(), Entry::new("a", 2));
        assert_eq!(pool.next_for("b").await.unwrap(), Entry::new("b", 10));
    }

    #[tokio::test]
    async fn interleaved_keyed_waiters_demultiplex() {
        let pool = Pool::new();
        let wait_a = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next_for("a").await })
        };
        let wait_b = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next_for("b").await })
        };
        tokio::task::yield_now().await;

        pool.push(Entry::new("b", 1));
        pool.push(Entry::new("a", 2));

        assert_eq!(wait_a.await.unwrap().unwrap(), Entry::new("a", 2));
        assert_eq!(wait_b.await.unwrap().unwrap(), Entry::new("b", 1));
    }

    #[tokio::test]
    async fn mixing_modes_is_a_usage_error() {
        let pool: Pool<Entry> = Pool::new();
        let keyed = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next_for("a").await })
        };
        tokio::task::yield_now().await;

        let err = pool.next().await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Usage(UsageError::MixedWaitingModes)
        ));

        pool.push(Entry::new("a", 1));
        keyed.await.unwrap().unwrap();

        // The other direction: an anonymous waiter blocks keyed waits.
        let anonymous = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        tokio::task::yield_now().await;
        let err = pool.next_for("b").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Usage(UsageError::MixedWaitingModes)
        ));
        pool.push(Entry::new("b", 2));
        anonymous.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_keyed_waiters_are_rejected() {
        let pool: Pool<Entry> = Pool::new();
        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next_for("a").await })
        };
        tokio::task::yield_now().await;

        let err = pool.next_for("a").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Usage(UsageError::DuplicateRequestIdWait(id)) if id == "a"
        ));
        pool.push(Entry::new("a", 1));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_anonymous_waiters_are_rejected() {
        let pool: Pool<Entry> = Pool::new();
        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        tokio::task::yield_now().await;

        let err = pool.next().await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Usage(UsageError::NextCalledTwice)
        ));
        pool.push(Entry::new("a", 1));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_drains_waiters_but_keeps_entries() {
        let pool = Pool::new();
        pool.push(Entry::new("a", 1));

        let parked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next_for("b").await })
        };
        tokio::task::yield_now().await;

        pool.cancel_waiters();
        let err = tokio::time::timeout(Duration::from_secs(1), parked)
            .await
            .expect("waiter must unblock")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));

        // The queued entry survived cancellation.
        assert_eq!(pool.next().await.unwrap(), Entry::new("a", 1));
        // Once dry, waits fail instead of parking forever.
        let err = pool.next().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_the_pool_usable() {
        let pool: Pool<Entry> = Pool::new();
        {
            let wait = pool.next();
            tokio::pin!(wait);
            // Poll once so the waiter registers, then drop it.
            let _ = futures::poll!(wait.as_mut());
        }
        pool.push(Entry::new("a", 1));
        assert_eq!(pool.next().await.unwrap(), Entry::new("a", 1));
    }
}
