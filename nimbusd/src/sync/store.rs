use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::time::sleep;

use nimbus_core::{NimbusClient, NimbusError, OperationStatus, VersionEntry};

use super::error::SyncError;
use super::index::StoreIndex;
use super::paths;
use super::progress::ProgressSender;
use super::transfer::TransferClient;

const LIST_PAGE_SIZE: u32 = 100;
const OPERATION_POLL_ATTEMPTS: u32 = 10;

/// A container resolved for one request. Resolution is fresh per request and
/// owned by nobody.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub remote_root: String,
}

/// The substrate boundary: everything the coordination layer is allowed to
/// ask of the remote engine — start a download, observe metadata (via the
/// index it feeds), coordinate a read/write, enumerate versions — plus the
/// entry manipulation the facade exposes.
pub struct RemoteStore {
    client: NimbusClient,
    transfer: TransferClient,
    index: Arc<StoreIndex>,
    data_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    active_downloads: Arc<Mutex<HashSet<String>>>,
}

#[derive(Debug)]
pub struct ChangesOutcome {
    pub cursor: String,
    pub has_more: bool,
    pub applied: usize,
}

impl RemoteStore {
    pub fn new(client: NimbusClient, index: Arc<StoreIndex>, data_root: PathBuf) -> Self {
        Self {
            client,
            transfer: TransferClient::new(),
            index,
            data_root,
            locks: Mutex::new(HashMap::new()),
            active_downloads: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_transfer(mut self, transfer: TransferClient) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn index(&self) -> &Arc<StoreIndex> {
        &self.index
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub async fn resolve_container(&self, id: &str) -> Result<ContainerHandle, SyncError> {
        let info = self
            .client
            .get_container(id)
            .await
            .map_err(|source| SyncError::ContainerUnavailable {
                id: id.to_string(),
                source,
            })?;
        let local_root = paths::materialized_path_for(&self.data_root, &info.root_path)?;
        tokio::fs::create_dir_all(&local_root).await?;
        Ok(ContainerHandle {
            id: info.id,
            remote_root: info.root_path,
        })
    }

    /// Initial full scan: walk the remote tree and mirror every entry into the
    /// index. The change feed keeps it fresh afterwards.
    pub async fn bootstrap(&self, root: &str) -> Result<usize, SyncError> {
        let mut stack = vec![root.to_string()];
        let mut indexed = 0usize;
        while let Some(folder) = stack.pop() {
            let entries = self.client.list_folder_all(&folder, LIST_PAGE_SIZE).await?;
            for document in entries {
                let Some(path) = document.get("path").and_then(Value::as_str).map(str::to_string)
                else {
                    eprintln!("[nimbusd] skipping listing entry without a path under {folder}");
                    continue;
                };
                if document.get("type").and_then(Value::as_str) == Some("dir") {
                    stack.push(path.clone());
                }
                self.index.apply(&path, document);
                indexed += 1;
            }
        }
        Ok(indexed)
    }

    /// Apply one page of the remote change feed to the index.
    pub async fn apply_changes(&self, cursor: Option<&str>) -> Result<ChangesOutcome, SyncError> {
        let page = self.client.poll_changes(cursor).await?;
        let mut applied = 0usize;
        for event in page.events {
            if event.deleted {
                if self.index.remove(&event.path) {
                    applied += 1;
                }
                continue;
            }
            if let Some(entry) = event.entry {
                self.index.apply(&event.path, entry);
                applied += 1;
            }
        }
        Ok(ChangesOutcome {
            cursor: page.cursor,
            has_more: page.has_more,
            applied,
        })
    }

    pub fn materialized_path(&self, remote_path: &str) -> Result<PathBuf, SyncError> {
        Ok(paths::materialized_path_for(&self.data_root, remote_path)?)
    }

    pub fn is_materialized(&self, remote_path: &str) -> bool {
        paths::materialized_path_for(&self.data_root, remote_path)
            .map(|local| local.is_file())
            .unwrap_or(false)
    }

    /// Ask the engine to materialize `remote_path`. Returns as soon as a
    /// transfer attempt is running (or the file is already present); progress
    /// and completion surface through the index, where the watchdog observes
    /// them. At most one transfer per path is live at a time.
    pub async fn ensure_download(&self, remote_path: &str) -> Result<(), SyncError> {
        let target = self.materialized_path(remote_path)?;
        if target.is_file() {
            self.index.merge(
                remote_path,
                json!({"download": {"state": "current", "progress": 1.0, "error": null}}),
            );
            return Ok(());
        }
        {
            let mut active = self
                .active_downloads
                .lock()
                .expect("active downloads lock poisoned");
            if !active.insert(remote_path.to_string()) {
                return Ok(());
            }
        }

        let record = self.index.get(remote_path);
        let expected_md5 = record.as_ref().and_then(|r| {
            r.document
                .get("md5")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let total = record
            .as_ref()
            .and_then(|r| r.document.get("size"))
            .and_then(Value::as_u64);

        let client = self.client.clone();
        let transfer = self.transfer.clone();
        let index = Arc::clone(&self.index);
        let active = Arc::clone(&self.active_downloads);
        let path = remote_path.to_string();
        tokio::spawn(async move {
            index.merge(
                &path,
                json!({"download": {"state": "none", "progress": 0.0, "error": null}}),
            );
            let progress_index = Arc::clone(&index);
            let progress_path = path.clone();
            let result = async {
                let link = client.get_download_link(&path).await?;
                transfer
                    .download_to_path(
                        link.href.as_str(),
                        &target,
                        expected_md5.as_deref(),
                        move |received| {
                            let fraction = match total {
                                Some(total) if total > 0 => {
                                    (received as f64 / total as f64).min(1.0)
                                }
                                _ => received as f64,
                            };
                            progress_index
                                .merge(&progress_path, json!({"download": {"progress": fraction}}));
                        },
                    )
                    .await?;
                Ok::<(), SyncError>(())
            }
            .await;
            match result {
                Ok(()) => {
                    index.merge(
                        &path,
                        json!({"download": {"state": "current", "progress": 1.0, "error": null}}),
                    );
                }
                Err(err) => {
                    eprintln!("[nimbusd] download failed: path={path} err={err}");
                    index.merge(&path, json!({"download": {"error": err.to_string()}}));
                }
            }
            active
                .lock()
                .expect("active downloads lock poisoned")
                .remove(&path);
        });
        Ok(())
    }

    /// Serialized read of the materialized content. Absence is a value, not an
    /// error.
    pub async fn coordinated_read(&self, remote_path: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let lock = self.lock_for(remote_path);
        let _guard = lock.lock().await;
        let local = self.materialized_path(remote_path)?;
        match tokio::fs::read(&local).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Serialized write of the materialized content followed by a push to the
    /// remote store.
    pub async fn coordinated_write(&self, remote_path: &str, bytes: &[u8]) -> Result<(), SyncError> {
        let lock = self.lock_for(remote_path);
        let _guard = lock.lock().await;
        let local = self.materialized_path(remote_path)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, bytes).await?;
        self.upload_materialized(remote_path, None).await
    }

    /// Push the materialized file at `remote_path` to the store, reporting
    /// upload progress as a 0.0–1.0 fraction.
    pub async fn upload_materialized(
        &self,
        remote_path: &str,
        progress: Option<ProgressSender>,
    ) -> Result<(), SyncError> {
        let local = self.materialized_path(remote_path)?;
        let total = tokio::fs::metadata(&local).await?.len();
        self.index.merge(
            remote_path,
            json!({"upload": {"active": true, "committed": false}}),
        );
        let link = self.client.get_upload_link(remote_path, true).await?;
        let result = self
            .transfer
            .upload_from_path(link.href.as_str(), &local, move |sent| {
                if let Some(progress) = &progress
                    && total > 0
                {
                    progress.emit((sent as f64 / total as f64).min(1.0));
                }
            })
            .await;
        match result {
            Ok(()) => {
                self.index.merge(
                    remote_path,
                    json!({
                        "size": total,
                        "modified": now_rfc3339(),
                        "upload": {"active": false, "committed": true}
                    }),
                );
                Ok(())
            }
            Err(err) => {
                self.index.merge(
                    remote_path,
                    json!({"upload": {"active": false, "committed": false}}),
                );
                Err(err.into())
            }
        }
    }

    /// Fetch one entry straight from the store, refreshing the index with it.
    /// A 404 is absence, not failure.
    pub async fn fetch_entry(&self, remote_path: &str) -> Result<Option<Value>, SyncError> {
        match self.client.get_entry(remote_path).await {
            Ok(document) => {
                self.index.apply(remote_path, document.clone());
                Ok(Some(document))
            }
            Err(NimbusError::Api { status, .. }) if status == StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_item(&self, remote_path: &str) -> Result<(), SyncError> {
        if let Some(link) = self.client.delete_entry(remote_path).await? {
            self.wait_for_operation(link.href.as_str()).await?;
        }
        for record in self
            .index
            .snapshot_matching(|path| covers(remote_path, path))
        {
            self.index.remove(&record.path);
        }
        let local = self.materialized_path(remote_path)?;
        if let Ok(meta) = tokio::fs::metadata(&local).await {
            if meta.is_dir() {
                let _ = tokio::fs::remove_dir_all(&local).await;
            } else {
                let _ = tokio::fs::remove_file(&local).await;
            }
        }
        Ok(())
    }

    pub async fn move_item(&self, from: &str, to: &str) -> Result<(), SyncError> {
        let link = self.client.move_entry(from, to, true).await?;
        self.wait_for_operation(link.href.as_str()).await?;
        let source = self.materialized_path(from)?;
        let target = self.materialized_path(to)?;
        if tokio::fs::metadata(&source).await.is_ok() {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let _ = tokio::fs::rename(&source, &target).await;
        }
        self.index.remove(from);
        self.fetch_entry(to).await?;
        Ok(())
    }

    pub async fn copy_item(&self, from: &str, to: &str) -> Result<(), SyncError> {
        let link = self.client.copy_entry(from, to, true).await?;
        self.wait_for_operation(link.href.as_str()).await?;
        self.fetch_entry(to).await?;
        Ok(())
    }

    pub async fn list_versions(&self, remote_path: &str) -> Result<Vec<VersionEntry>, SyncError> {
        Ok(self.client.list_versions(remote_path).await?)
    }

    pub async fn restore_version(
        &self,
        remote_path: &str,
        version_id: &str,
    ) -> Result<(), SyncError> {
        Ok(self.client.restore_version(remote_path, version_id).await?)
    }

    pub async fn resolve_version(
        &self,
        remote_path: &str,
        version_id: &str,
    ) -> Result<(), SyncError> {
        Ok(self.client.resolve_version(remote_path, version_id).await?)
    }

    pub async fn purge_version(
        &self,
        remote_path: &str,
        version_id: &str,
    ) -> Result<(), SyncError> {
        Ok(self.client.delete_version(remote_path, version_id).await?)
    }

    pub fn note_conflict_resolved(&self, remote_path: &str) {
        self.index.merge(
            remote_path,
            json!({"conflicted": false, "conflict_error": null}),
        );
    }

    pub fn note_conflict_error(&self, remote_path: &str, message: &str) {
        self.index
            .merge(remote_path, json!({"conflict_error": message}));
    }

    async fn wait_for_operation(&self, operation_url: &str) -> Result<(), SyncError> {
        for attempt in 0..OPERATION_POLL_ATTEMPTS {
            match self.client.get_operation_status(operation_url).await? {
                OperationStatus::Success => return Ok(()),
                OperationStatus::Failure => return Err(SyncError::OperationFailed),
                OperationStatus::InProgress => {
                    sleep(operation_poll_delay(attempt)).await;
                }
            }
        }
        Err(SyncError::OperationFailed)
    }

    fn lock_for(&self, remote_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Arc::clone(locks.entry(remote_path.to_string()).or_default())
    }
}

fn covers(root: &str, path: &str) -> bool {
    match path.strip_prefix(root.trim_end_matches('/')) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn operation_poll_delay(attempt: u32) -> Duration {
    let shift = attempt.min(5);
    Duration::from_millis(250u64 << shift).min(Duration::from_secs(10))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
