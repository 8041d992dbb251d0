use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::AbortHandle;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

impl QueryId {
    fn next() -> Self {
        Self(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cancellation handle for one listener attached to a query. Consumed on
/// teardown.
#[derive(Debug)]
pub struct ListenerToken {
    abort: AbortHandle,
}

impl ListenerToken {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    fn cancel(self) {
        self.abort.abort();
    }
}

/// Arena of listener tokens keyed by query identity. Completion, error,
/// timeout, and cancellation paths all funnel into `release`; whichever gets
/// there first drains the entry and every later call is a no-op, so no token
/// is ever cancelled twice and none is leaked.
#[derive(Default)]
pub struct ObserverRegistry {
    entries: Mutex<HashMap<QueryId, Vec<ListenerToken>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> QueryId {
        let id = QueryId::next();
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.insert(id, Vec::new());
        id
    }

    /// Attach a listener to a live query. When the query is already torn down
    /// the token is cancelled on the spot and `false` is returned.
    pub fn attach(&self, id: QueryId, token: ListenerToken) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get_mut(&id) {
            Some(tokens) => {
                tokens.push(token);
                true
            }
            None => {
                token.cancel();
                false
            }
        }
    }

    /// Tear down a query: drain its tokens and cancel each. Safe to call any
    /// number of times and from inside event handling; only the first call
    /// does work.
    pub fn release(&self, id: QueryId) -> bool {
        let tokens = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.remove(&id)
        };
        match tokens {
            Some(tokens) => {
                for token in tokens {
                    token.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let drained: Vec<Vec<ListenerToken>> = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            entries.drain().map(|(_, tokens)| tokens).collect()
        };
        for tokens in drained {
            for token in tokens {
                token.cancel();
            }
        }
    }

    pub fn active(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }
}
