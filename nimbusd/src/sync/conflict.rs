use std::collections::HashSet;
use std::sync::Arc;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;

use nimbus_core::VersionEntry;

use super::descriptor;
use super::error::SyncError;
use super::index::IndexEvent;
use super::store::RemoteStore;

/// Last-write-wins choice over a version set. Versions already marked
/// resolved are out of the running; a missing modification time sorts as the
/// earliest possible one.
pub fn select_winner(versions: &[VersionEntry]) -> Option<&VersionEntry> {
    versions
        .iter()
        .filter(|version| !version.resolved)
        .max_by_key(|version| version_time(version))
}

fn version_time(version: &VersionEntry) -> OffsetDateTime {
    version
        .modified
        .as_deref()
        .and_then(|text| OffsetDateTime::parse(text, &Rfc3339).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Collapses divergent versions of an item to one, by modification time.
/// Driven by index state changes (an item entering the conflicted state), not
/// by a standing query; also invoked opportunistically on access paths.
pub struct ConflictResolver {
    store: Arc<RemoteStore>,
}

impl ConflictResolver {
    pub fn new(store: Arc<RemoteStore>) -> Self {
        Self { store }
    }

    /// Collapse the unresolved version set of `remote_path`. Returns whether
    /// anything needed resolving.
    pub async fn resolve(&self, remote_path: &str) -> Result<bool, SyncError> {
        let versions = self.store.list_versions(remote_path).await?;
        let unresolved: Vec<VersionEntry> = versions
            .into_iter()
            .filter(|version| !version.resolved)
            .collect();
        let Some(winner) = select_winner(&unresolved).cloned() else {
            return Ok(false);
        };
        self.store.restore_version(remote_path, &winner.id).await?;
        for version in &unresolved {
            self.store.resolve_version(remote_path, &version.id).await?;
        }
        for version in unresolved.iter().filter(|version| version.id != winner.id) {
            self.store.purge_version(remote_path, &version.id).await?;
        }
        self.store.note_conflict_resolved(remote_path);
        Ok(true)
    }

    /// Best-effort resolution: a failure is recorded on the item and logged,
    /// never propagated into the caller's in-flight operation. The item stays
    /// in its pre-resolution state and the condition surfaces on next access.
    pub async fn resolve_opportunistic(&self, remote_path: &str) {
        if let Err(err) = self.resolve(remote_path).await {
            eprintln!("[nimbusd] conflict resolution failed: path={remote_path} err={err}");
            self.store.note_conflict_error(remote_path, &err.to_string());
        }
    }

    /// Watch the index feed and collapse items as they transition into the
    /// conflicted state.
    pub fn spawn(store: Arc<RemoteStore>) -> tokio::task::JoinHandle<()> {
        let resolver = Self::new(Arc::clone(&store));
        let mut feed = store.index().subscribe();
        tokio::spawn(async move {
            let mut conflicted: HashSet<String> = HashSet::new();
            loop {
                match feed.recv().await {
                    Ok(IndexEvent::Changed(record)) => {
                        if descriptor::is_conflicted(&record.document) {
                            if conflicted.insert(record.path.clone()) {
                                resolver.resolve_opportunistic(&record.path).await;
                            }
                        } else {
                            conflicted.remove(&record.path);
                        }
                    }
                    Ok(IndexEvent::Removed { path }) => {
                        conflicted.remove(&path);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
