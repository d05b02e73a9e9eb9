use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::mpsc::unbounded_channel,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, info, warn};

use crate::flow::{
    FlowRegistry, PrepareEnv,
    file::{is_flow_file, load_flow_file},
};

/// Something that can be hot-reloaded from files in a directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls a directory and forwards file changes to a [`WatchedType`].
/// Dropping it, or calling [`shutdown`](Self::shutdown), stops watching.
pub struct DirectoryWatcher {
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Start watching `dir`. With `initial_scan`, every relevant file already
    /// present is loaded first, in file-name order.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            bail!("directory {} does not exist", dir.display());
        }

        if initial_scan {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| watched.is_relevant(path))
                .collect();
            paths.sort();
            for path in paths {
                try_reload(&watched, &path, false).await;
            }
        }

        let (tx, mut rx) = unbounded_channel::<notify::Result<Event>>();
        let mut watcher = PollWatcher::new(
            move |res| {
                // nobody listens any more once the dispatch task is gone
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )
        .context("failed to create poll watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watcher error");
                        continue;
                    }
                };
                for path in event.paths.iter().filter(|p| watched.is_relevant(p)) {
                    match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) => {
                            try_reload(&watched, path, true).await;
                        }
                        EventKind::Remove(_) => {
                            if let Err(e) = watched.on_remove(path).await {
                                warn!(path = %path.display(), error = %e, "failed to handle removal");
                            }
                        }
                        _ => {}
                    }
                }
            }
        });

        info!(dir = %dir.display(), "watching directory");
        Ok(DirectoryWatcher {
            _watcher: watcher,
            dispatch,
        })
    }

    /// Stop dispatching events.
    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 5;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(()) => return,
            Err(e) if !retry || attempt == MAX_RETRIES - 1 => {
                error!(path = %path.display(), error = %e, "failed to load");
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), attempt = attempt + 1, error = %e, "retrying load");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Keeps the registry in sync with the flow files of a directory.
pub struct FlowDirWatcher {
    registry: Arc<FlowRegistry>,
    env: PrepareEnv,
    loaded: DashMap<PathBuf, String>,
}

impl FlowDirWatcher {
    pub fn new(registry: Arc<FlowRegistry>, env: PrepareEnv) -> Arc<Self> {
        Arc::new(Self {
            registry,
            env,
            loaded: DashMap::new(),
        })
    }

    /// Start watching `dir`, loading the files already in it.
    pub async fn watch(self: Arc<Self>, dir: PathBuf, poll_interval: Duration) -> Result<DirectoryWatcher> {
        DirectoryWatcher::new(dir, self, true, poll_interval).await
    }
}

#[async_trait]
impl WatchedType for FlowDirWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        is_flow_file(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let definition = load_flow_file(path, &self.env)?;
        let id = definition.id().to_string();

        // a file that now declares another id replaces its previous flow
        if let Some(previous) = self.loaded.get(path).map(|p| p.value().clone()) {
            if previous != id && self.registry.contains(&previous) {
                self.registry.unregister(&previous)?;
            }
        }
        self.registry.upsert(definition)?;
        self.loaded.insert(path.to_path_buf(), id);
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let Some((_, id)) = self.loaded.remove(path) else {
            return Ok(());
        };
        if self.registry.contains(&id) {
            self.registry.unregister(&id)?;
        }
        info!(flow = %id, path = %path.display(), "flow file removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Store;
    use tempfile::TempDir;

    const UNITS: &str = "id: units\ntopics: [\"sensors/#\"]\ntransform: { units: ~ }\n";

    #[tokio::test]
    async fn test_flow_files_are_tracked() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("units.flow.yaml"), UNITS).unwrap();
        std::fs::write(dir.path().join("broken.flow.yaml"), "id: [").unwrap();
        std::fs::write(dir.path().join("readme.md"), "not a flow").unwrap();

        let registry = FlowRegistry::new(Store::new());
        let flows = FlowDirWatcher::new(registry.clone(), PrepareEnv::default());
        let watcher = flows
            .clone()
            .watch(dir.path().to_path_buf(), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(registry.ids(), vec!["units"]);

        std::fs::write(
            dir.path().join("alerts.flow.json"),
            r#"{"id": "alerts", "topics": ["sensors/#"], "transform": {"alerts": null}}"#,
        )
        .unwrap();
        sleep(Duration::from_millis(600)).await;
        assert!(registry.contains("alerts"));

        std::fs::remove_file(dir.path().join("units.flow.yaml")).unwrap();
        sleep(Duration::from_millis(600)).await;
        assert!(!registry.contains("units"));

        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let registry = FlowRegistry::new(Store::new());
        let flows = FlowDirWatcher::new(registry, PrepareEnv::default());
        assert!(flows.watch(PathBuf::from("/definitely/not/here"), Duration::from_millis(50)).await.is_err());
    }

    #[tokio::test]
    async fn test_changed_id_replaces_previous_flow() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.flow.yaml");
        std::fs::write(&path, UNITS).unwrap();

        let registry = FlowRegistry::new(Store::new());
        let flows = FlowDirWatcher::new(registry.clone(), PrepareEnv::default());
        flows.on_create_or_modify(&path).await.unwrap();
        std::fs::write(&path, UNITS.replace("id: units", "id: units2")).unwrap();
        flows.on_create_or_modify(&path).await.unwrap();

        assert_eq!(registry.ids(), vec!["units2"]);
        flows.on_remove(&path).await.unwrap();
        assert!(registry.is_empty());
    }
}
