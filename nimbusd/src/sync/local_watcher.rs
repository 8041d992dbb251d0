use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc;

use super::index::StoreIndex;

/// A change observed on the materialized tree, mapped back to remote-path
/// space. Staging artifacts (`.partial` files) are filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: String },
    Removed { path: String },
}

pub fn start_notify_watcher(
    data_root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = data_root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

/// Refresh what the filesystem just told us into the index, narrowing the
/// window where the index lags the disk. Never authoritative — the watchdog
/// still stats the filesystem directly — and never invents documents for
/// paths the index does not know.
pub fn apply_local_event(index: &StoreIndex, data_root: &Path, event: &LocalEvent) {
    match event {
        LocalEvent::Changed { path } => {
            let Ok(local) = super::paths::materialized_path_for(data_root, path) else {
                return;
            };
            let Ok(meta) = std::fs::metadata(&local) else {
                return;
            };
            if !meta.is_file() {
                return;
            }
            index.merge(
                path,
                json!({
                    "download": {"state": "current", "progress": 1.0},
                    "local": {"size": meta.len()}
                }),
            );
        }
        LocalEvent::Removed { path } => {
            index.merge(
                path,
                json!({"download": {"state": "none", "progress": null}, "local": null}),
            );
        }
    }
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    to_remote_path(root, &event.paths[0]),
                    to_remote_path(root, &event.paths[1]),
                )
            {
                return vec![
                    LocalEvent::Removed { path: from },
                    LocalEvent::Changed { path: to },
                ];
            }
            Vec::new()
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| to_remote_path(root, path))
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| to_remote_path(root, path))
            .map(|path| LocalEvent::Removed { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn to_remote_path(root: &Path, path: &Path) -> Option<String> {
    if path.extension().is_some_and(|ext| ext == "partial") {
        return None;
    }
    let relative = path.strip_prefix(root).ok()?;
    let remote = PathBuf::from("/").join(relative);
    Some(remote.to_string_lossy().replace('\\', "/"))
}
