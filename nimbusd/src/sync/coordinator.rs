use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conflict::ConflictResolver;
use super::copier;
use super::descriptor::{self, InvalidEntry, ItemDescriptor};
use super::error::SyncError;
use super::livequery::{LiveQuery, QueryEvent, QueryScope};
use super::observer::{ListenerToken, ObserverRegistry, QueryId};
use super::paths;
use super::progress::ProgressSender;
use super::store::{ContainerHandle, RemoteStore};
use super::watchdog::{DownloadWatchdog, RetrySchedule};

/// Result of an enumeration: every mappable item, plus the raw documents that
/// failed to map, kept for diagnosis.
#[derive(Debug)]
pub struct Listing {
    pub items: Vec<ItemDescriptor>,
    pub invalid: Vec<InvalidEntry>,
}

/// Live enumeration handle: a fresh complete listing arrives on every remote
/// change. Dropping it (or calling `stop`) tears the underlying query down.
pub struct ItemWatch {
    events: mpsc::UnboundedReceiver<Listing>,
    registry: Arc<ObserverRegistry>,
    id: QueryId,
}

impl ItemWatch {
    pub async fn next(&mut self) -> Option<Listing> {
        self.events.recv().await
    }

    pub fn stop(&mut self) {
        self.registry.release(self.id);
        self.events.close();
    }
}

impl Drop for ItemWatch {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// The facade the request layer calls into. Composes live queries, the
/// download watchdog, progress channels, the stream copier, and the conflict
/// resolver over one remote store. All state is instance-scoped; independent
/// coordinators do not interfere.
pub struct SyncCoordinator {
    store: Arc<RemoteStore>,
    registry: Arc<ObserverRegistry>,
    watchdog: DownloadWatchdog,
    resolver: ConflictResolver,
    schedule: RetrySchedule,
}

impl SyncCoordinator {
    pub fn new(store: Arc<RemoteStore>, schedule: RetrySchedule) -> Self {
        let registry = Arc::new(ObserverRegistry::new());
        let watchdog = DownloadWatchdog::new(
            Arc::clone(store.index()),
            Arc::clone(&registry),
            store.data_root().to_path_buf(),
        );
        let resolver = ConflictResolver::new(Arc::clone(&store));
        Self {
            store,
            registry,
            watchdog,
            resolver,
            schedule,
        }
    }

    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<RemoteStore> {
        &self.store
    }

    async fn resolve(
        &self,
        container: &str,
        relative: &str,
    ) -> Result<(ContainerHandle, String), SyncError> {
        paths::validate(relative)?;
        let handle = self.store.resolve_container(container).await?;
        let absolute = paths::join_remote(&handle.remote_root, relative);
        Ok((handle, absolute))
    }

    /// One-shot enumeration of the container through a gathering scan.
    pub async fn list_items(&self, container: &str) -> Result<Listing, SyncError> {
        let handle = self.store.resolve_container(container).await?;
        let mut query = LiveQuery::open(
            Arc::clone(self.store.index()),
            Arc::clone(&self.registry),
            QueryScope::prefix(&handle.remote_root),
        );
        let event = query.next().await;
        query.stop();
        match event {
            Some(QueryEvent::Gathered { matches }) => {
                let (items, invalid) = descriptor::map_entries(
                    &handle.remote_root,
                    matches.into_iter().map(|record| record.document),
                );
                Ok(Listing { items, invalid })
            }
            _ => {
                debug_assert!(false, "gathering must be the first query event");
                Err(SyncError::Internal("live query ended before gathering"))
            }
        }
    }

    /// Standing enumeration: the returned watch yields the initial listing and
    /// then a fresh complete listing after every change under the container.
    pub async fn watch_items(&self, container: &str) -> Result<ItemWatch, SyncError> {
        let handle = self.store.resolve_container(container).await?;
        let scope = QueryScope::prefix(&handle.remote_root);
        let mut query = LiveQuery::open(
            Arc::clone(self.store.index()),
            Arc::clone(&self.registry),
            scope.clone(),
        );
        let id = query.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let index = Arc::clone(self.store.index());
        let root = handle.remote_root.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = query.next().await {
                let documents: Vec<Value> = match event {
                    QueryEvent::Gathered { matches } => {
                        matches.into_iter().map(|record| record.document).collect()
                    }
                    QueryEvent::Updated(_) | QueryEvent::Removed { .. } => index
                        .snapshot_matching(|path| scope.matches(path))
                        .into_iter()
                        .map(|record| record.document)
                        .collect(),
                };
                let (items, invalid) = descriptor::map_entries(&root, documents);
                if tx.send(Listing { items, invalid }).is_err() {
                    break;
                }
            }
        });
        self.registry.attach(id, ListenerToken::new(task.abort_handle()));
        Ok(ItemWatch {
            events: rx,
            registry: Arc::clone(&self.registry),
            id,
        })
    }

    /// Copy a local file into the container and push it to the store.
    pub async fn upload(
        &self,
        container: &str,
        local_source: &Path,
        remote_path: &str,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let (_handle, absolute) = self.resolve(container, remote_path).await?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.upload_inner(&absolute, local_source, progress.clone()) => result,
        };
        finish_progress(&progress, &result);
        result
    }

    async fn upload_inner(
        &self,
        absolute: &str,
        local_source: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<(), SyncError> {
        let target = self.store.materialized_path(absolute)?;
        let source = local_source.to_path_buf();
        tokio::task::spawn_blocking(move || copier::copy_to_path(&source, &target))
            .await
            .map_err(|_| SyncError::Internal("copy task panicked"))??;
        self.store.upload_materialized(absolute, progress).await
    }

    /// Wait (via the watchdog) for the item to materialize, then copy it out
    /// of the container to `local_destination`.
    pub async fn download(
        &self,
        container: &str,
        remote_path: &str,
        local_destination: &Path,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let (_handle, absolute) = self.resolve(container, remote_path).await?;
        let result = self
            .download_inner(&absolute, local_destination, progress.clone(), cancel)
            .await;
        finish_progress(&progress, &result);
        result
    }

    async fn download_inner(
        &self,
        absolute: &str,
        destination: &Path,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.store.ensure_download(absolute).await?;
        let reporter = progress.clone();
        self.watchdog
            .await_materialized(absolute, &self.schedule, cancel, move |fraction| {
                if let Some(progress) = &reporter {
                    progress.emit(fraction.min(1.0));
                }
            })
            .await?;
        let source = self.store.materialized_path(absolute)?;
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || copier::copy_to_path(&source, &destination))
            .await
            .map_err(|_| SyncError::Internal("copy task panicked"))??;
        Ok(())
    }

    /// Read the item's content out of the container, waiting for it to
    /// materialize first. Absence is `Ok(None)`.
    pub async fn read_in_place(
        &self,
        container: &str,
        remote_path: &str,
        schedule: Option<&RetrySchedule>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        let (_handle, absolute) = self.resolve(container, remote_path).await?;
        let known = match self.store.index().get(&absolute) {
            Some(record) => Some(record.document),
            None => self.store.fetch_entry(&absolute).await?,
        };
        if known.is_none() && !self.store.is_materialized(&absolute) {
            return Ok(None);
        }
        if let Some(document) = &known
            && descriptor::is_conflicted(document)
        {
            self.resolver.resolve_opportunistic(&absolute).await;
        }
        self.store.ensure_download(&absolute).await?;
        self.watchdog
            .await_materialized(&absolute, schedule.unwrap_or(&self.schedule), cancel, |_| {})
            .await?;
        self.store.coordinated_read(&absolute).await
    }

    /// Replace the item's content in the container and push it to the store.
    pub async fn write_in_place(
        &self,
        container: &str,
        remote_path: &str,
        bytes: &[u8],
    ) -> Result<(), SyncError> {
        let (_handle, absolute) = self.resolve(container, remote_path).await?;
        if let Some(record) = self.store.index().get(&absolute)
            && descriptor::is_conflicted(&record.document)
        {
            self.resolver.resolve_opportunistic(&absolute).await;
        }
        self.store.coordinated_write(&absolute, bytes).await
    }

    pub async fn exists(&self, container: &str, remote_path: &str) -> Result<bool, SyncError> {
        Ok(self.metadata(container, remote_path).await?.is_some())
    }

    pub async fn metadata(
        &self,
        container: &str,
        remote_path: &str,
    ) -> Result<Option<ItemDescriptor>, SyncError> {
        let (handle, absolute) = self.resolve(container, remote_path).await?;
        let document = match self.store.index().get(&absolute) {
            Some(record) => Some(record.document),
            None => self.store.fetch_entry(&absolute).await?,
        };
        let Some(document) = document else {
            return Ok(None);
        };
        match descriptor::map_entry(&handle.remote_root, &document) {
            Ok(item) => Ok(Some(item)),
            Err(error) => {
                // malformed metadata is reported as a diagnostic and absence,
                // never as a failure
                eprintln!("[nimbusd] malformed metadata: path={absolute} err={error}");
                Ok(None)
            }
        }
    }

    pub async fn delete_item(&self, container: &str, remote_path: &str) -> Result<(), SyncError> {
        let (_handle, absolute) = self.resolve(container, remote_path).await?;
        self.store.delete_item(&absolute).await
    }

    pub async fn move_item(
        &self,
        container: &str,
        from: &str,
        to: &str,
    ) -> Result<(), SyncError> {
        paths::validate(to)?;
        let (handle, from_absolute) = self.resolve(container, from).await?;
        let to_absolute = paths::join_remote(&handle.remote_root, to);
        self.store.move_item(&from_absolute, &to_absolute).await
    }

    pub async fn copy_item(
        &self,
        container: &str,
        from: &str,
        to: &str,
    ) -> Result<(), SyncError> {
        paths::validate(to)?;
        let (handle, from_absolute) = self.resolve(container, from).await?;
        let to_absolute = paths::join_remote(&handle.remote_root, to);
        self.store.copy_item(&from_absolute, &to_absolute).await
    }
}

fn finish_progress(progress: &Option<ProgressSender>, result: &Result<(), SyncError>) {
    if let Some(progress) = progress {
        match result {
            Ok(()) => progress.complete(),
            Err(err) => progress.fail(err.to_string()),
        }
    }
}
