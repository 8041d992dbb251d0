use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use nimbus_core::NimbusClient;

use crate::sync::conflict::ConflictResolver;
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::error::SyncError;
use crate::sync::index::StoreIndex;
use crate::sync::local_watcher::{self, start_notify_watcher};
use crate::sync::store::RemoteStore;
use crate::sync::watchdog::RetrySchedule;

const DEFAULT_API_BASE: &str = "https://api.nimbus.example";
const DEFAULT_ACCOUNT_ROOT: &str = "/containers";
const DEFAULT_CHANGES_POLL_SECS: u64 = 5;
const DEFAULT_IDLE_SCHEDULE: &[u64] = &[60, 90, 180];
const DEFAULT_BACKOFF_SCHEDULE: &[u64] = &[2, 4];

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_root: PathBuf,
    pub api_base: String,
    pub token: String,
    pub account_root: String,
    pub changes_poll_interval: Duration,
    pub idle_schedule: Vec<u64>,
    pub backoff_schedule: Vec<u64>,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_root = std::env::var("NIMBUS_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_data_root(&home));
        let api_base =
            std::env::var("NIMBUS_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let token = std::env::var("NIMBUS_TOKEN").context("NIMBUS_TOKEN is not set")?;
        let account_root = std::env::var("NIMBUS_ACCOUNT_ROOT")
            .unwrap_or_else(|_| DEFAULT_ACCOUNT_ROOT.to_string());
        let changes_poll_interval = Duration::from_secs(read_u64_env(
            "NIMBUS_CHANGES_POLL_SECS",
            DEFAULT_CHANGES_POLL_SECS,
        ));
        let idle_schedule = read_schedule_env("NIMBUS_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_SCHEDULE);
        let backoff_schedule =
            read_schedule_env("NIMBUS_RETRY_BACKOFF_SECS", DEFAULT_BACKOFF_SCHEDULE);
        let enable_local_watcher = read_bool_env("NIMBUS_ENABLE_LOCAL_WATCHER", true);

        Ok(Self {
            data_root,
            api_base,
            token,
            account_root,
            changes_poll_interval,
            idle_schedule,
            backoff_schedule,
            enable_local_watcher,
        })
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::from_secs(&self.idle_schedule, &self.backoff_schedule)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: Arc<RemoteStore>,
    coordinator: Arc<SyncCoordinator>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_root)
            .await
            .with_context(|| format!("failed to create data root at {:?}", config.data_root))?;

        let client = NimbusClient::with_base_url(&config.api_base, config.token.as_str())
            .context("invalid API base url")?;
        let index = Arc::new(StoreIndex::new());
        let store = Arc::new(RemoteStore::new(client, index, config.data_root.clone()));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            config.retry_schedule(),
        ));

        Ok(Self {
            config,
            store,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[nimbusd] started: data_root={}, account_root={}, local_watcher={}",
            self.config.data_root.display(),
            self.config.account_root,
            if self.config.enable_local_watcher {
                "enabled"
            } else {
                "disabled"
            }
        );

        match self.store.bootstrap(&self.config.account_root).await {
            Ok(indexed) => eprintln!("[nimbusd] index bootstrapped: {indexed} entries"),
            Err(err) => eprintln!("[nimbusd] bootstrap scan failed, change feed will heal: {err}"),
        }

        let store_for_changes = Arc::clone(&self.store);
        let poll_interval = self.config.changes_poll_interval;
        let changes_handle = tokio::spawn(async move {
            let mut cursor: Option<String> = None;
            loop {
                match store_for_changes.apply_changes(cursor.as_deref()).await {
                    Ok(outcome) => {
                        if outcome.applied > 0 {
                            eprintln!("[nimbusd] change feed: applied {} updates", outcome.applied);
                        }
                        let has_more = outcome.has_more;
                        cursor = Some(outcome.cursor);
                        if has_more {
                            continue;
                        }
                    }
                    Err(err) => {
                        eprintln!("[nimbusd] change feed error: {err}");
                        if let SyncError::Store(api) = &err {
                            if let Some(seconds) = api.retry_after_secs() {
                                tokio::time::sleep(Duration::from_secs(seconds)).await;
                                continue;
                            }
                            if !api.is_retryable() {
                                // auth and permanent failures: no point hammering the feed
                                tokio::time::sleep(poll_interval * 4).await;
                                continue;
                            }
                        }
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        let conflict_handle = ConflictResolver::spawn(Arc::clone(&self.store));

        let watcher_state = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.data_root) {
                Ok((watcher, mut rx)) => {
                    let index = Arc::clone(self.store.index());
                    let data_root = self.config.data_root.clone();
                    let handle = tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            local_watcher::apply_local_event(&index, &data_root, &event);
                        }
                    });
                    Some((watcher, handle))
                }
                Err(err) => {
                    eprintln!("[nimbusd] warning: failed to start local watcher: {err}");
                    None
                }
            }
        } else {
            None
        };

        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for shutdown signal")?;
        eprintln!("[nimbusd] shutting down");

        changes_handle.abort();
        conflict_handle.abort();
        if let Some((watcher, handle)) = watcher_state {
            drop(watcher);
            handle.abort();
        }
        self.coordinator.registry().release_all();
        Ok(())
    }
}

fn default_data_root(home: &Path) -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("nimbus"))
        .unwrap_or_else(|| home.join(".nimbus"))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    if value == "~" {
        return home.to_path_buf();
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn read_schedule_env(name: &str, default: &[u64]) -> Vec<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| parse_schedule(&value))
        .unwrap_or_else(|| default.to_vec())
}

// "60,90,180" -> [60, 90, 180]; anything unparseable falls back to defaults
fn parse_schedule(value: &str) -> Option<Vec<u64>> {
    let entries: Vec<u64> = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    if entries.is_empty() { None } else { Some(entries) }
}
