use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_api::{FlowOutput, Message, PayloadError};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{context::FlowContext, topic::TopicFilter};

pub mod builtin;
pub mod file;
pub mod registry;
pub mod script;

pub use file::{FlowFile, load_flow_file};
pub use registry::{FlowRegistry, RegistryError};

/// Failure reported by a transform. The executor turns it into an
/// invocation error; it never reaches other flows.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Any other failure of a native transform.
    #[error("{0}")]
    Failed(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("flow setup failed: {0}")]
    Setup(String),
}

/// Settings available to transforms while they are being prepared.
#[derive(Debug, Clone)]
pub struct PrepareEnv {
    /// Directory that relative script paths are resolved against.
    pub base_dir: Option<PathBuf>,
    /// Upper bound on the number of script operations per invocation.
    pub max_operations: u64,
}

impl Default for PrepareEnv {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_operations: 1_000_000,
        }
    }
}

/// The transform capability of a flow.
///
/// Implementations are named in flow files through `typetag`, e.g.
/// `transform: { alerts: ~ }` or `transform: { rhai: { path: events.rhai } }`.
#[async_trait]
#[typetag::serde]
pub trait FlowTransform: Send + Sync + fmt::Debug {
    /// Handle one inbound message.
    async fn on_message(&self, message: &Message, context: &FlowContext) -> Result<FlowOutput, FlowError>;

    /// Handle a periodic tick. Only called for flows with an interval.
    async fn on_interval(&self, _now: DateTime<Utc>, _context: &FlowContext) -> Result<FlowOutput, FlowError> {
        Ok(FlowOutput::NoOutput)
    }

    /// One-time preparation before the flow is registered, e.g. compiling a script.
    fn prepare(&mut self, _env: &PrepareEnv) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Options passed to one invocation: the flow's defaults overridden key by
/// key by the registry's overrides. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOptions(Arc<Map<String, Value>>);

impl InvocationOptions {
    pub fn merged(defaults: &Map<String, Value>, overrides: Option<&Map<String, Value>>) -> Self {
        let mut merged = defaults.clone();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        Self(Arc::new(merged))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    /// `key` as a number, or `default` when absent or not numeric.
    pub fn number_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for InvocationOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self(Arc::new(map))
    }
}

/// A loaded flow: which topics it listens to, what it does, and its default
/// options. Immutable once built; replace it in the registry to change it.
#[derive(Clone)]
pub struct FlowDefinition {
    id: String,
    topics: Vec<TopicFilter>,
    transform: Arc<dyn FlowTransform>,
    default_options: Map<String, Value>,
    interval: Option<Duration>,
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .field("transform", &self.transform)
            .field("interval", &self.interval)
            .finish()
    }
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, topics: Vec<TopicFilter>, transform: impl FlowTransform + 'static) -> Self {
        Self::from_arc(id, topics, Arc::new(transform))
    }

    pub fn from_boxed(id: impl Into<String>, topics: Vec<TopicFilter>, transform: Box<dyn FlowTransform>) -> Self {
        Self::from_arc(id, topics, Arc::from(transform))
    }

    fn from_arc(id: impl Into<String>, topics: Vec<TopicFilter>, transform: Arc<dyn FlowTransform>) -> Self {
        let mut unique: Vec<TopicFilter> = Vec::with_capacity(topics.len());
        for topic in topics {
            if !unique.contains(&topic) {
                unique.push(topic);
            }
        }
        Self {
            id: id.into(),
            topics: unique,
            transform,
            default_options: Map::new(),
            interval: None,
        }
    }

    pub fn with_default_options(mut self, options: Map<String, Value>) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_options.insert(key.into(), value.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topics(&self) -> &[TopicFilter] {
        &self.topics
    }

    pub fn transform(&self) -> &Arc<dyn FlowTransform> {
        &self.transform
    }

    pub fn default_options(&self) -> &Map<String, Value> {
        &self.default_options
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.topics.iter().any(|filter| filter.matches(topic))
    }
}
