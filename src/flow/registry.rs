use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    flow::{FlowDefinition, InvocationOptions},
    state::Store,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("flow id must not be empty")]
    EmptyId,
    #[error("flow `{0}` is already registered")]
    DuplicateFlow(String),
    #[error("flow `{0}` has no topic filters")]
    NoTopics(String),
    #[error("flow `{0}` is not registered")]
    UnknownFlow(String),
}

/// What changed in the registry. Listeners are called after the change is
/// visible to [`FlowRegistry::match_topic`].
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(Arc<FlowDefinition>),
    Replaced(Arc<FlowDefinition>),
    Unregistered(String),
}

pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// The set of loaded flows, in registration order.
///
/// Registering a flow also creates its script scope in the [`Store`];
/// unregistering drops it. Every mutation either fully applies or leaves the
/// registry untouched.
pub struct FlowRegistry {
    flows: RwLock<Vec<Arc<FlowDefinition>>>,
    overrides: DashMap<String, Map<String, Value>>,
    store: Arc<Store>,
    listeners: RwLock<Vec<RegistryListener>>,
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.ids())
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl FlowRegistry {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            flows: RwLock::new(Vec::new()),
            overrides: DashMap::new(),
            store,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn subscribe(&self, listener: RegistryListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify(&self, event: RegistryEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(&event);
        }
    }

    fn check(definition: &FlowDefinition) -> Result<(), RegistryError> {
        if definition.id().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if definition.topics().is_empty() {
            return Err(RegistryError::NoTopics(definition.id().to_string()));
        }
        Ok(())
    }

    /// Add a new flow at the end of the registration order.
    pub fn register(&self, definition: FlowDefinition) -> Result<Arc<FlowDefinition>, RegistryError> {
        Self::check(&definition)?;
        let definition = Arc::new(definition);
        {
            let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
            if flows.iter().any(|f| f.id() == definition.id()) {
                return Err(RegistryError::DuplicateFlow(definition.id().to_string()));
            }
            self.store.create_script_scope(definition.id());
            flows.push(definition.clone());
        }
        info!(flow = definition.id(), topics = ?definition.topics(), "registered flow");
        self.notify(RegistryEvent::Registered(definition.clone()));
        Ok(definition)
    }

    /// Swap in a new definition for an existing id. The flow keeps its
    /// position and its script-scope state; in-flight invocations finish
    /// with the old definition.
    pub fn replace(&self, definition: FlowDefinition) -> Result<Arc<FlowDefinition>, RegistryError> {
        Self::check(&definition)?;
        let definition = Arc::new(definition);
        {
            let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
            let slot = flows
                .iter_mut()
                .find(|f| f.id() == definition.id())
                .ok_or_else(|| RegistryError::UnknownFlow(definition.id().to_string()))?;
            *slot = definition.clone();
        }
        info!(flow = definition.id(), "replaced flow");
        self.notify(RegistryEvent::Replaced(definition.clone()));
        Ok(definition)
    }

    /// Register, or replace when the id is already known.
    pub fn upsert(&self, definition: FlowDefinition) -> Result<Arc<FlowDefinition>, RegistryError> {
        Self::check(&definition)?;
        let definition = Arc::new(definition);
        let replaced = {
            let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
            match flows.iter_mut().find(|f| f.id() == definition.id()) {
                Some(slot) => {
                    *slot = definition.clone();
                    true
                }
                None => {
                    self.store.create_script_scope(definition.id());
                    flows.push(definition.clone());
                    false
                }
            }
        };
        if replaced {
            info!(flow = definition.id(), "replaced flow");
            self.notify(RegistryEvent::Replaced(definition.clone()));
        } else {
            info!(flow = definition.id(), topics = ?definition.topics(), "registered flow");
            self.notify(RegistryEvent::Registered(definition.clone()));
        }
        Ok(definition)
    }

    pub fn unregister(&self, id: &str) -> Result<Arc<FlowDefinition>, RegistryError> {
        let removed = {
            let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
            let pos = flows
                .iter()
                .position(|f| f.id() == id)
                .ok_or_else(|| RegistryError::UnknownFlow(id.to_string()))?;
            self.overrides.remove(id);
            self.store.drop_script_scope(id);
            flows.remove(pos)
        };
        info!(flow = id, "unregistered flow");
        self.notify(RegistryEvent::Unregistered(id.to_string()));
        Ok(removed)
    }

    /// Flows subscribed to `topic`, in registration order.
    pub fn match_topic(&self, topic: &str) -> Vec<Arc<FlowDefinition>> {
        let matched: Vec<_> = self
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|f| f.matches(topic))
            .cloned()
            .collect();
        debug!(topic, matched = matched.len(), "matched flows");
        matched
    }

    pub fn get(&self, id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.id() == id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|f| f.id().to_string())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<FlowDefinition>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.flows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Options that take precedence over a flow's defaults on every call.
    pub fn set_overrides(&self, id: &str, overrides: Map<String, Value>) -> Result<(), RegistryError> {
        let flows = self.flows.read().unwrap_or_else(PoisonError::into_inner);
        if !flows.iter().any(|f| f.id() == id) {
            return Err(RegistryError::UnknownFlow(id.to_string()));
        }
        self.overrides.insert(id.to_string(), overrides);
        Ok(())
    }

    pub fn options_for(&self, definition: &FlowDefinition) -> InvocationOptions {
        let overrides = self.overrides.get(definition.id());
        InvocationOptions::merged(definition.default_options(), overrides.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::builtin::{AlertsFlow, IdentityFlow, UnitsFlow},
        state::Scope,
        topic::TopicFilter,
    };
    use serde_json::json;
    use std::sync::Mutex;

    fn def(id: &str, topics: &[&str]) -> FlowDefinition {
        let topics = topics.iter().map(|t| TopicFilter::new(*t).unwrap()).collect();
        FlowDefinition::new(id, topics, UnitsFlow)
    }

    #[test]
    fn test_match_preserves_registration_order() {
        let registry = FlowRegistry::new(Store::new());
        registry.register(def("b", &["te/#"])).unwrap();
        registry.register(def("a", &["te/+/+/+/+/m/+"])).unwrap();
        registry.register(def("c", &["other"])).unwrap();

        let matched: Vec<_> = registry
            .match_topic("te/device/main///m/env")
            .iter()
            .map(|f| f.id().to_string())
            .collect();
        assert_eq!(matched, vec!["b", "a"]);
        assert!(registry.match_topic("nothing/here").is_empty());
    }

    #[test]
    fn test_register_rejects_duplicates_and_empty_topics() {
        let store = Store::new();
        let registry = FlowRegistry::new(store.clone());
        registry.register(def("a", &["x"])).unwrap();

        assert_eq!(
            registry.register(def("a", &["y"])).unwrap_err(),
            RegistryError::DuplicateFlow("a".into())
        );
        assert_eq!(
            registry.register(def("b", &[])).unwrap_err(),
            RegistryError::NoTopics("b".into())
        );
        assert_eq!(registry.register(def("", &["x"])).unwrap_err(), RegistryError::EmptyId);

        assert_eq!(registry.ids(), vec!["a"]);
        assert!(!store.has_scope(&Scope::Script("b".into())));
        // the duplicate did not change the original's topics
        assert!(registry.get("a").unwrap().matches("x"));
        assert!(!registry.get("a").unwrap().matches("y"));
    }

    #[test]
    fn test_replace_keeps_position_and_state() {
        let store = Store::new();
        let registry = FlowRegistry::new(store.clone());
        registry.register(def("a", &["x"])).unwrap();
        registry.register(def("b", &["x"])).unwrap();
        store.set(&Scope::Script("a".into()), "count", json!(5)).unwrap();

        let topics = vec![TopicFilter::new("x").unwrap(), TopicFilter::new("y").unwrap()];
        registry.replace(FlowDefinition::new("a", topics, AlertsFlow)).unwrap();

        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert!(registry.get("a").unwrap().matches("y"));
        assert_eq!(store.get(&Scope::Script("a".into()), "count").unwrap(), Some(json!(5)));
        assert_eq!(
            registry.replace(def("zzz", &["x"])).unwrap_err(),
            RegistryError::UnknownFlow("zzz".into())
        );
    }

    #[test]
    fn test_unregister_drops_scope_and_overrides() {
        let store = Store::new();
        let registry = FlowRegistry::new(store.clone());
        registry.register(def("a", &["x"])).unwrap();
        registry.set_overrides("a", Map::new()).unwrap();

        registry.unregister("a").unwrap();
        assert!(registry.is_empty());
        assert!(!store.has_scope(&Scope::Script("a".into())));
        assert!(registry.match_topic("x").is_empty());
        assert!(matches!(registry.unregister("a"), Err(RegistryError::UnknownFlow(_))));
        assert!(registry.set_overrides("a", Map::new()).is_err());
    }

    #[test]
    fn test_racing_unregister_and_upsert_keep_scope_consistent() {
        let store = Store::new();
        let registry = FlowRegistry::new(store.clone());
        let scope = Scope::Script("a".into());

        for _ in 0..500 {
            registry.upsert(def("a", &["x"])).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    let _ = registry.unregister("a");
                });
                s.spawn(|| {
                    registry.upsert(def("a", &["x"])).unwrap();
                });
            });
            assert_eq!(registry.contains("a"), store.has_scope(&scope));
        }
    }

    #[test]
    fn test_options_for_merges_overrides() {
        let registry = FlowRegistry::new(Store::new());
        let topics = vec![TopicFilter::new("x").unwrap()];
        let alerts = registry
            .register(
                FlowDefinition::new("alerts", topics, AlertsFlow)
                    .with_option("high", 80)
                    .with_option("warn", 60),
            )
            .unwrap();

        assert_eq!(registry.options_for(&alerts).get("high"), Some(&json!(80)));

        let overrides = json!({"high": 100}).as_object().cloned().unwrap();
        registry.set_overrides("alerts", overrides).unwrap();
        let options = registry.options_for(&alerts);
        assert_eq!(options.get("high"), Some(&json!(100)));
        assert_eq!(options.get("warn"), Some(&json!(60)));
    }

    #[test]
    fn test_listeners_see_changes() {
        let registry = FlowRegistry::new(Store::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(Arc::new(move |event| {
            let label = match event {
                RegistryEvent::Registered(f) => format!("+{}", f.id()),
                RegistryEvent::Replaced(f) => format!("~{}", f.id()),
                RegistryEvent::Unregistered(id) => format!("-{id}"),
            };
            sink.lock().unwrap().push(label);
        }));

        let topics = vec![TopicFilter::new("x").unwrap()];
        registry.upsert(FlowDefinition::new("id", topics.clone(), IdentityFlow)).unwrap();
        registry.upsert(FlowDefinition::new("id", topics, IdentityFlow)).unwrap();
        registry.unregister("id").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["+id", "~id", "-id"]);
    }
}
