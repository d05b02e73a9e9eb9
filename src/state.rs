use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The two kinds of key-value namespace the engine keeps.
///
/// The mapper scope is shared by every flow; each flow additionally owns a
/// script scope that no other flow can reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Mapper,
    Script(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Mapper => f.write_str("mapper"),
            Scope::Script(flow_id) => write!(f, "script:{flow_id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scope `{0}` is not defined")]
    UnknownScope(Scope),
    #[error("state persistence failed: {0}")]
    Persistence(String),
}

type Entries = Arc<DashMap<String, Value>>;

/// Process-wide key-value container holding the mapper scope and every
/// registered flow's script scope.
///
/// Reads and writes are immediately visible to every handle on the same
/// scope. Individual operations on one key are atomic; use
/// [`StoreHandle::update`] for a read-modify-write that must not interleave
/// with other writers of the same key.
pub struct Store {
    mapper: Entries,
    scripts: DashMap<String, Entries>,
    mapper_dirty: Arc<AtomicBool>,
    persistence: Option<Arc<dyn StatePersistence>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("mapper", &self.mapper.len())
            .field("scripts", &self.scripts.len())
            .field("persistence", &self.persistence.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// A store whose mapper scope is backed by `persistence`.
    /// Call [`Store::restore`] to load previously saved entries.
    pub fn with_persistence(persistence: Arc<dyn StatePersistence>) -> Arc<Self> {
        Arc::new(Self::build(Some(persistence)))
    }

    fn build(persistence: Option<Arc<dyn StatePersistence>>) -> Self {
        Self {
            mapper: Arc::new(DashMap::new()),
            scripts: DashMap::new(),
            mapper_dirty: Arc::new(AtomicBool::new(false)),
            persistence,
        }
    }

    pub fn get(&self, scope: &Scope, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.handle(scope)?.get(key))
    }

    pub fn set(&self, scope: &Scope, key: &str, value: Value) -> Result<(), StoreError> {
        self.handle(scope)?.set(key, value);
        Ok(())
    }

    pub fn has(&self, scope: &Scope, key: &str) -> Result<bool, StoreError> {
        Ok(self.handle(scope)?.has(key))
    }

    /// A handle bound to one scope. Fails for a script scope whose flow was
    /// never registered (or has been unregistered).
    pub fn handle(&self, scope: &Scope) -> Result<StoreHandle, StoreError> {
        match scope {
            Scope::Mapper => Ok(self.mapper()),
            Scope::Script(flow_id) => {
                let entries = self
                    .scripts
                    .get(flow_id)
                    .map(|e| e.value().clone())
                    .ok_or_else(|| StoreError::UnknownScope(scope.clone()))?;
                Ok(StoreHandle {
                    scope: scope.clone(),
                    entries,
                    dirty: None,
                })
            }
        }
    }

    pub fn mapper(&self) -> StoreHandle {
        StoreHandle {
            scope: Scope::Mapper,
            entries: self.mapper.clone(),
            dirty: Some(self.mapper_dirty.clone()),
        }
    }

    /// Create the script scope of `flow_id` if it does not exist yet.
    pub fn create_script_scope(&self, flow_id: &str) {
        self.scripts
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()));
    }

    pub fn drop_script_scope(&self, flow_id: &str) {
        if self.scripts.remove(flow_id).is_some() {
            debug!(flow = flow_id, "dropped script scope");
        }
    }

    pub fn has_scope(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Mapper => true,
            Scope::Script(flow_id) => self.scripts.contains_key(flow_id),
        }
    }

    pub fn snapshot(&self, scope: &Scope) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self.handle(scope)?.all().into_iter().collect())
    }

    /// Whether the mapper scope changed since the last successful flush.
    pub fn is_dirty(&self) -> bool {
        self.mapper_dirty.load(Ordering::Acquire)
    }

    /// Load persisted mapper entries, overwriting keys already present.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let entries = persistence.load().await?;
        let count = entries.len();
        for (key, value) in entries {
            self.mapper.insert(key, value);
        }
        info!(count, store = persistence.name(), "restored mapper state");
        Ok(count)
    }

    /// Persist the mapper scope if it changed. Script scopes are never persisted.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(false);
        };
        if !self.mapper_dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.snapshot(&Scope::Mapper)?;
        if let Err(err) = persistence.save(&snapshot).await {
            self.mapper_dirty.store(true, Ordering::Release);
            warn!(error = %err, "could not persist mapper state");
            return Err(err);
        }
        debug!(count = snapshot.len(), "persisted mapper state");
        Ok(true)
    }
}

/// A view on a single scope of the [`Store`]. Cheap to clone.
#[derive(Clone)]
pub struct StoreHandle {
    scope: Scope,
    entries: Entries,
    dirty: Option<Arc<AtomicBool>>,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("scope", &self.scope)
            .field("len", &self.entries.len())
            .finish()
    }
}

impl StoreHandle {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Returns `None` when the key is absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
        self.touch();
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Atomically replace the value of `key`.
    ///
    /// `f` receives the current value (if any) and returns the new value plus
    /// a result handed back to the caller. The key stays locked while `f`
    /// runs, so concurrent updates of the same key never interleave.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(Option<&Value>) -> (Value, R)) -> R {
        let result = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let (value, result) = f(Some(entry.get()));
                entry.insert(value);
                result
            }
            Entry::Vacant(entry) => {
                let (value, result) = f(None);
                entry.insert(value);
                result
            }
        };
        self.touch();
        result
    }

    /// Store `new` under `key` only if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    pub fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: Value) -> bool {
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) if expected == Some(entry.get()) => {
                entry.insert(new);
                true
            }
            Entry::Vacant(entry) if expected.is_none() => {
                entry.insert(new);
                true
            }
            _ => false,
        };
        if swapped {
            self.touch();
        }
        swapped
    }

    pub fn all(&self) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&self) {
        if let Some(dirty) = &self.dirty {
            dirty.store(true, Ordering::Release);
        }
    }
}

/// Durable backing for the mapper scope.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, Value>, StoreError>;
    async fn save(&self, state: &HashMap<String, Value>) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn StatePersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatePersistence")
            .field("impl", &self.name())
            .finish()
    }
}

/// Keeps the mapper scope in a JSON object on disk.
///
/// Writes go to a sibling temporary file first and are renamed into place.
pub struct JsonFileState {
    path: PathBuf,
}

impl JsonFileState {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl StatePersistence for JsonFileState {
    async fn load(&self) -> Result<HashMap<String, Value>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(StoreError::Persistence(format!(
                    "read {}: {err}",
                    self.path.display()
                )));
            }
        };
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).map_err(|err| {
            StoreError::Persistence(format!("parse {}: {err}", self.path.display()))
        })
    }

    async fn save(&self, state: &HashMap<String, Value>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|err| StoreError::Persistence(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    StoreError::Persistence(format!("create {}: {err}", parent.display()))
                })?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|err| StoreError::Persistence(format!("write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|err| {
            StoreError::Persistence(format!("rename to {}: {err}", self.path.display()))
        })
    }

    fn name(&self) -> &'static str {
        "JsonFileState"
    }
}
