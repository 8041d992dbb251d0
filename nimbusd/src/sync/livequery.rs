use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use super::index::{IndexEvent, IndexRecord, StoreIndex};
use super::observer::{ListenerToken, ObserverRegistry, QueryId};

/// Predicate of one standing query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Exact-path match; single-file operations.
    Item(String),
    /// Everything at or below a root; enumeration. Stored without a trailing
    /// separator.
    Prefix(String),
}

impl QueryScope {
    pub fn item(path: impl Into<String>) -> Self {
        Self::Item(path.into())
    }

    pub fn prefix(root: &str) -> Self {
        Self::Prefix(root.trim_end_matches('/').to_string())
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Item(item) => item == path,
            Self::Prefix(root) => match path.strip_prefix(root.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// The first full scan finished. Authoritative even when empty: a
    /// zero-result gathering means "not in the index", not "still looking".
    Gathered { matches: Vec<IndexRecord> },
    Updated(IndexRecord),
    Removed { path: String },
}

/// One standing query against the store index. Events are pumped on a
/// dedicated task and consumed on the caller's own timeline, so no two
/// notifications for the same subscription are ever processed concurrently.
///
/// `Gathered` always precedes any incremental event. Stopping is idempotent
/// and implicit on drop; whichever of completion, timeout, or cancellation
/// releases the registry entry first wins.
pub struct LiveQuery {
    id: QueryId,
    registry: Arc<ObserverRegistry>,
    events: mpsc::UnboundedReceiver<QueryEvent>,
}

impl LiveQuery {
    pub fn open(
        index: Arc<StoreIndex>,
        registry: Arc<ObserverRegistry>,
        scope: QueryScope,
    ) -> Self {
        let id = registry.register();
        let (tx, rx) = mpsc::unbounded_channel();
        // Subscribe before the snapshot so nothing falls between scan and feed.
        let feed = index.subscribe();
        let pump = tokio::spawn(pump(index, scope, feed, tx));
        registry.attach(id, ListenerToken::new(pump.abort_handle()));
        Self {
            id,
            registry: Arc::clone(&registry),
            events: rx,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub async fn next(&mut self) -> Option<QueryEvent> {
        self.events.recv().await
    }

    /// Stop delivery and release every token attached to this query. Safe to
    /// call repeatedly, including from inside event handling.
    pub fn stop(&mut self) {
        self.registry.release(self.id);
        self.events.close();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

async fn pump(
    index: Arc<StoreIndex>,
    scope: QueryScope,
    mut feed: broadcast::Receiver<IndexEvent>,
    tx: mpsc::UnboundedSender<QueryEvent>,
) {
    let matches = index.snapshot_matching(|path| scope.matches(path));
    if tx.send(QueryEvent::Gathered { matches }).is_err() {
        return;
    }
    loop {
        match feed.recv().await {
            Ok(IndexEvent::Changed(record)) => {
                if scope.matches(&record.path) && tx.send(QueryEvent::Updated(record)).is_err() {
                    return;
                }
            }
            Ok(IndexEvent::Removed { path }) => {
                if scope.matches(&path) && tx.send(QueryEvent::Removed { path }).is_err() {
                    return;
                }
            }
            // The feed outpaced us; re-scan instead of losing updates.
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let matches = index.snapshot_matching(|path| scope.matches(path));
                if tx.send(QueryEvent::Gathered { matches }).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> (Arc<StoreIndex>, Arc<ObserverRegistry>) {
        (Arc::new(StoreIndex::new()), Arc::new(ObserverRegistry::new()))
    }

    #[tokio::test]
    async fn gathering_precedes_incremental_updates() {
        let (index, registry) = fixtures();
        index.apply("/a", json!({"path": "/a"}));

        let mut query = LiveQuery::open(
            Arc::clone(&index),
            Arc::clone(&registry),
            QueryScope::prefix("/"),
        );
        let first = query.next().await.unwrap();
        assert!(matches!(first, QueryEvent::Gathered { ref matches } if matches.len() == 1));

        index.apply("/b", json!({"path": "/b"}));
        let second = query.next().await.unwrap();
        assert!(matches!(second, QueryEvent::Updated(ref r) if r.path == "/b"));
    }

    #[tokio::test]
    async fn zero_result_gathering_is_still_delivered() {
        let (index, registry) = fixtures();
        let mut query = LiveQuery::open(index, registry, QueryScope::item("/missing"));

        let event = query.next().await.unwrap();
        assert!(matches!(event, QueryEvent::Gathered { ref matches } if matches.is_empty()));
    }

    #[tokio::test]
    async fn item_scope_ignores_unrelated_paths() {
        let (index, registry) = fixtures();
        let mut query = LiveQuery::open(
            Arc::clone(&index),
            Arc::clone(&registry),
            QueryScope::item("/watched.txt"),
        );
        assert!(matches!(query.next().await.unwrap(), QueryEvent::Gathered { .. }));

        index.apply("/other.txt", json!({"path": "/other.txt"}));
        index.apply("/watched.txt", json!({"path": "/watched.txt"}));

        let event = query.next().await.unwrap();
        assert!(matches!(event, QueryEvent::Updated(ref r) if r.path == "/watched.txt"));
    }

    #[tokio::test]
    async fn prefix_scope_respects_component_boundaries() {
        let scope = QueryScope::prefix("/containers/notes/");
        assert!(scope.matches("/containers/notes"));
        assert!(scope.matches("/containers/notes/Docs/A.txt"));
        assert!(!scope.matches("/containers/notes-archive/B.txt"));
    }

    #[tokio::test]
    async fn removals_inside_the_scope_are_reported() {
        let (index, registry) = fixtures();
        index.apply("/root/a", json!({"path": "/root/a"}));
        let mut query = LiveQuery::open(
            Arc::clone(&index),
            Arc::clone(&registry),
            QueryScope::prefix("/root"),
        );
        assert!(matches!(query.next().await.unwrap(), QueryEvent::Gathered { .. }));

        index.remove("/root/a");

        let event = query.next().await.unwrap();
        assert!(matches!(event, QueryEvent::Removed { ref path } if path == "/root/a"));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_the_registry_entry() {
        let (index, registry) = fixtures();
        let mut query = LiveQuery::open(
            Arc::clone(&index),
            Arc::clone(&registry),
            QueryScope::item("/a"),
        );
        assert_eq!(registry.active(), 1);

        query.stop();
        query.stop();
        drop(query);

        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn dropping_the_query_releases_it_too() {
        let (index, registry) = fixtures();
        let query = LiveQuery::open(
            Arc::clone(&index),
            Arc::clone(&registry),
            QueryScope::item("/a"),
        );
        assert_eq!(registry.active(), 1);

        drop(query);

        assert_eq!(registry.active(), 0);
    }
}
