use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 1024;

/// One item as the remote index currently describes it: the raw metadata
/// document keyed by absolute remote path. Documents are replaced wholesale on
/// every change, never mutated in place by consumers.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub path: String,
    pub document: Value,
}

#[derive(Debug, Clone)]
pub enum IndexEvent {
    Changed(IndexRecord),
    Removed { path: String },
}

/// In-memory mirror of the remote metadata index plus a broadcast feed of
/// changes. Fed by the bootstrap scan, the change-feed poller, the store's own
/// transfer bookkeeping, and the local watcher; consumed by live queries.
///
/// This layer persists nothing — the mirror is rebuilt from remote truth on
/// startup.
pub struct StoreIndex {
    entries: Mutex<HashMap<String, Value>>,
    feed: broadcast::Sender<IndexEvent>,
}

impl StoreIndex {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            feed,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.feed.subscribe()
    }

    /// Replace the document stored for `path` and publish the change.
    pub fn apply(&self, path: &str, document: Value) {
        {
            let mut entries = self.entries.lock().expect("index lock poisoned");
            entries.insert(path.to_string(), document.clone());
        }
        let _ = self.feed.send(IndexEvent::Changed(IndexRecord {
            path: path.to_string(),
            document,
        }));
    }

    /// Deep-merge `patch` into the existing document for `path`. Unknown paths
    /// are left alone: inventing stub documents here would surface as
    /// malformed entries in listings. Returns whether a document was patched.
    pub fn merge(&self, path: &str, patch: Value) -> bool {
        let merged = {
            let mut entries = self.entries.lock().expect("index lock poisoned");
            match entries.get_mut(path) {
                Some(document) => {
                    merge_value(document, &patch);
                    Some(document.clone())
                }
                None => None,
            }
        };
        match merged {
            Some(document) => {
                let _ = self.feed.send(IndexEvent::Changed(IndexRecord {
                    path: path.to_string(),
                    document,
                }));
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, path: &str) -> bool {
        let removed = {
            let mut entries = self.entries.lock().expect("index lock poisoned");
            entries.remove(path).is_some()
        };
        if removed {
            let _ = self.feed.send(IndexEvent::Removed {
                path: path.to_string(),
            });
        }
        removed
    }

    pub fn get(&self, path: &str) -> Option<IndexRecord> {
        let entries = self.entries.lock().expect("index lock poisoned");
        entries.get(path).map(|document| IndexRecord {
            path: path.to_string(),
            document: document.clone(),
        })
    }

    /// Snapshot of every record whose path satisfies `filter`, ordered by path
    /// so repeated snapshots are stable.
    pub fn snapshot_matching(&self, filter: impl Fn(&str) -> bool) -> Vec<IndexRecord> {
        let entries = self.entries.lock().expect("index lock poisoned");
        let mut records: Vec<IndexRecord> = entries
            .iter()
            .filter(|(path, _)| filter(path))
            .map(|(path, document)| IndexRecord {
                path: path.clone(),
                document: document.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StoreIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_value(dest: &mut Value, patch: &Value) {
    match (dest, patch) {
        (Value::Object(dest), Value::Object(patch)) => {
            for (key, value) in patch {
                match dest.get_mut(key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        dest.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest, patch) => *dest = patch.clone(),
    }
}
