use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use flow_api::{LogLevel, Qos};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    flow::{
        FlowDefinition, PrepareEnv,
        file::{FlowFile, FlowFileError},
    },
    logger::LogConfig,
    runtime::{DEFAULT_QUEUE_DEPTH, DEFAULT_WORKER_IDLE, OverflowPolicy, RuntimeOptions},
};

pub const ENV_LOG_LEVEL: &str = "FLOWS_LOG_LEVEL";
pub const ENV_INVOCATION_TIMEOUT_MS: &str = "FLOWS_INVOCATION_TIMEOUT_MS";
pub const ENV_QUEUE_DEPTH: &str = "FLOWS_QUEUE_DEPTH";
pub const ENV_STATE_PATH: &str = "FLOWS_STATE_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
    #[error(transparent)]
    Flow(#[from] FlowFileError),
}

/// Engine settings.
///
/// Loaded from YAML or JSON; every field has a default, so an empty file is
/// a valid configuration.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    #[schemars(with = "String")]
    pub log_level: LogLevel,
    /// Also write logs to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
    /// Emit engine logs as JSON.
    pub log_json: bool,
    /// Upper bound on one flow invocation, in milliseconds.
    pub invocation_timeout_ms: u64,
    /// Upper bound on the operations one script invocation may run. 0 disables it.
    pub max_operations: u64,
    /// Messages that may wait per inbound topic.
    pub queue_depth: usize,
    pub overflow_policy: OverflowPolicy,
    /// Seconds a topic worker may sit idle before it is retired.
    pub worker_idle_secs: u64,
    /// QoS of outputs that do not set one (0, 1 or 2).
    #[schemars(with = "u8")]
    pub default_qos: Qos,
    /// JSON file keeping the mapper scope across restarts.
    pub mapper_state_path: Option<PathBuf>,
    /// Directory of `*.flow.yaml` / `*.flow.json` files.
    pub flows_dir: Option<PathBuf>,
    /// Reload flows when files in `flows_dir` change.
    pub watch_flows: bool,
    /// Flows declared inline.
    #[schemars(with = "Vec<serde_json::Value>")]
    pub flows: Vec<FlowFile>,
    #[serde(skip)]
    #[schemars(skip)]
    base_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            log_json: false,
            invocation_timeout_ms: 1000,
            max_operations: PrepareEnv::default().max_operations,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            overflow_policy: OverflowPolicy::default(),
            worker_idle_secs: DEFAULT_WORKER_IDLE.as_secs(),
            default_qos: Qos::default(),
            mapper_state_path: None,
            flows_dir: None,
            watch_flows: false,
            flows: Vec::new(),
            base_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load `path` (YAML unless it ends in `.json`). Relative paths inside
    /// the file resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let mut config = if is_json {
            Self::from_json(&text)
        } else {
            Self::from_yaml(&text)
        }
        .map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;

        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.resolve_paths(&base);
        info!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, String> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_bw::from_str(text).map_err(|e| e.to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut Option<PathBuf>| {
            if let Some(path) = p {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        };
        resolve(&mut self.log_dir);
        resolve(&mut self.mapper_state_path);
        resolve(&mut self.flows_dir);
        self.base_dir = Some(base.to_path_buf());
    }

    /// Load an optional `.env` file, then let `FLOWS_*` variables override
    /// the loaded values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        self.apply_vars(|name| env::var(name).ok())
    }

    /// Apply overrides from `lookup`, the seam used by [`apply_env`](Self::apply_env).
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level.parse().map_err(|reason| ConfigError::Env {
                var: ENV_LOG_LEVEL,
                reason,
            })?;
        }
        if let Some(ms) = lookup(ENV_INVOCATION_TIMEOUT_MS) {
            self.invocation_timeout_ms = ms.trim().parse().map_err(|e| ConfigError::Env {
                var: ENV_INVOCATION_TIMEOUT_MS,
                reason: format!("{e}"),
            })?;
        }
        if let Some(depth) = lookup(ENV_QUEUE_DEPTH) {
            self.queue_depth = depth.trim().parse().map_err(|e| ConfigError::Env {
                var: ENV_QUEUE_DEPTH,
                reason: format!("{e}"),
            })?;
        }
        if let Some(path) = lookup(ENV_STATE_PATH) {
            self.mapper_state_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        Ok(())
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms.max(1))
    }

    pub fn prepare_env(&self) -> PrepareEnv {
        PrepareEnv {
            base_dir: self.base_dir.clone(),
            max_operations: self.max_operations,
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            queue_depth: self.queue_depth,
            overflow_policy: self.overflow_policy,
            idle_timeout: Duration::from_secs(self.worker_idle_secs.max(1)),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log_level, self.log_dir.clone(), self.log_json)
    }

    /// Prepare the inline flows, in declaration order.
    pub fn take_inline_flows(&mut self) -> Result<Vec<FlowDefinition>, ConfigError> {
        let env = self.prepare_env();
        std::mem::take(&mut self.flows)
            .into_iter()
            .map(|file| file.into_definition(&env).map_err(ConfigError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_yaml("").unwrap();
        assert_eq!(config.invocation_timeout(), Duration::from_millis(1000));
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.default_qos, Qos::AtLeastOnce);
        assert!(config.flows.is_empty());
    }

    #[test]
    fn test_yaml_with_inline_flows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(
            &path,
            r#"
log_level: debug
invocation_timeout_ms: 250
overflow_policy: reject_newest
worker_idle_secs: 5
default_qos: 0
mapper_state_path: state/mapper.json
flows:
  - id: units
    topics: ["sensors/#"]
    transform: { units: ~ }
  - id: identity
    topics: ["config/device"]
    transform: { identity: ~ }
"#,
        )
        .unwrap();

        let mut config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.invocation_timeout(), Duration::from_millis(250));
        assert_eq!(config.overflow_policy, OverflowPolicy::RejectNewest);
        assert_eq!(config.runtime_options().idle_timeout, Duration::from_secs(5));
        assert_eq!(config.default_qos, Qos::AtMostOnce);
        assert_eq!(config.mapper_state_path, Some(dir.path().join("state/mapper.json")));

        let flows = config.take_inline_flows().unwrap();
        let ids: Vec<_> = flows.iter().map(|f| f.id().to_string()).collect();
        assert_eq!(ids, vec!["units", "identity"]);
        assert!(config.flows.is_empty());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(EngineConfig::from_yaml("queue_dept: 3").is_err());
        assert!(EngineConfig::from_json(r#"{"default_qos": 7}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG_LEVEL, "warn"),
            (ENV_INVOCATION_TIMEOUT_MS, "50"),
            (ENV_QUEUE_DEPTH, "8"),
            (ENV_STATE_PATH, "/tmp/mapper.json"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.invocation_timeout_ms, 50);
        assert_eq!(config.queue_depth, 8);
        assert_eq!(config.mapper_state_path, Some(PathBuf::from("/tmp/mapper.json")));

        let err = config
            .apply_vars(|name| (name == ENV_QUEUE_DEPTH).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_QUEUE_DEPTH, .. }));
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = schemars::schema_for!(EngineConfig);
        let text = serde_json::to_string(&schema).unwrap();
        assert!(text.contains("invocation_timeout_ms"));
        assert!(text.contains("reject_newest"));
    }
}
