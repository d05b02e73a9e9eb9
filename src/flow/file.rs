use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    flow::{FlowDefinition, FlowError, FlowTransform, PrepareEnv},
    topic::TopicFilter,
};

const FLOW_SUFFIXES: [&str; 3] = [".flow.yaml", ".flow.yml", ".flow.json"];

#[derive(Debug, Error)]
pub enum FlowFileError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("{0} is not a flow file (expected .flow.yaml or .flow.json)")]
    UnsupportedExtension(PathBuf),
    #[error("flow `{id}` cannot be prepared: {source}")]
    Setup {
        id: String,
        #[source]
        source: FlowError,
    },
}

/// A flow as written on disk or inline in the engine configuration.
///
/// ```yaml
/// id: alerts
/// topics: ["te/+/+/+/+/m/+"]
/// config: { high: 80, warn: 60 }
/// transform: { alerts: ~ }
/// ```
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowFile {
    pub id: String,
    pub topics: Vec<TopicFilter>,
    /// Default options handed to every invocation.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    pub transform: Box<dyn FlowTransform>,
}

impl FlowFile {
    /// Prepare the transform (compiling scripts) and build the definition.
    pub fn into_definition(self, env: &PrepareEnv) -> Result<FlowDefinition, FlowFileError> {
        let FlowFile {
            id,
            topics,
            config,
            interval_secs,
            mut transform,
        } = self;
        transform
            .prepare(env)
            .map_err(|source| FlowFileError::Setup { id: id.clone(), source })?;

        let mut definition = FlowDefinition::from_boxed(id, topics, transform).with_default_options(config);
        if let Some(secs) = interval_secs {
            definition = definition.with_interval(Duration::from_secs(secs));
        }
        Ok(definition)
    }

    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, FlowFileError> {
        serde_yaml_bw::from_str(text).map_err(|e| FlowFileError::Parse {
            path: path.to_path_buf(),
            reason: format!("YAML: {e}"),
        })
    }

    pub fn from_json(text: &str, path: &Path) -> Result<Self, FlowFileError> {
        serde_json::from_str(text).map_err(|e| FlowFileError::Parse {
            path: path.to_path_buf(),
            reason: format!("JSON: {e}"),
        })
    }
}

pub fn is_flow_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| FLOW_SUFFIXES.iter().any(|s| name.ends_with(s)))
}

/// Read, parse and prepare one flow file. Relative script paths resolve
/// against the file's directory.
pub fn load_flow_file(path: &Path, env: &PrepareEnv) -> Result<FlowDefinition, FlowFileError> {
    let text = fs::read_to_string(path).map_err(|source| FlowFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let file = if name.ends_with(".flow.json") {
        FlowFile::from_json(&text, path)?
    } else if name.ends_with(".flow.yaml") || name.ends_with(".flow.yml") {
        FlowFile::from_yaml(&text, path)?
    } else {
        return Err(FlowFileError::UnsupportedExtension(path.to_path_buf()));
    };

    let env = PrepareEnv {
        base_dir: path.parent().map(Path::to_path_buf),
        ..env.clone()
    };
    file.into_definition(&env)
}

/// Every flow file in `dir`, sorted by file name.
pub fn flow_files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_flow_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_builtin_flow() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alerts.flow.yaml");
        fs::write(
            &path,
            r#"
id: alerts
topics: ["te/+/+/+/+/m/+", "te/+/+/+/+/m/+"]
config:
  high: 90
transform:
  alerts: ~
"#,
        )
        .unwrap();

        let def = load_flow_file(&path, &PrepareEnv::default()).unwrap();
        assert_eq!(def.id(), "alerts");
        assert_eq!(def.topics().len(), 1);
        assert_eq!(def.default_options().get("high"), Some(&json!(90)));
        assert!(def.interval().is_none());
    }

    #[test]
    fn test_json_script_flow_with_relative_path() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("count.rhai"), "fn on_message(m, c) { () }").unwrap();
        let path = dir.path().join("count.flow.json");
        fs::write(
            &path,
            r#"{"id": "count", "topics": ["a/#"], "interval_secs": 10, "transform": {"rhai": {"path": "count.rhai"}}}"#,
        )
        .unwrap();

        let def = load_flow_file(&path, &PrepareEnv::default()).unwrap();
        assert_eq!(def.interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_errors() {
        let dir = TempDir::new().unwrap();

        let bad_topic = dir.path().join("bad.flow.yaml");
        fs::write(&bad_topic, "id: x\ntopics: [\"a/#/b\"]\ntransform: { units: ~ }\n").unwrap();
        assert!(matches!(
            load_flow_file(&bad_topic, &PrepareEnv::default()),
            Err(FlowFileError::Parse { .. })
        ));

        let bad_script = dir.path().join("script.flow.yaml");
        fs::write(&bad_script, "id: s\ntopics: [a]\ntransform: { rhai: { source: \"fn nope() {}\" } }\n").unwrap();
        assert!(matches!(
            load_flow_file(&bad_script, &PrepareEnv::default()),
            Err(FlowFileError::Setup { .. })
        ));

        let other = dir.path().join("notes.txt");
        fs::write(&other, "").unwrap();
        assert!(matches!(
            load_flow_file(&other, &PrepareEnv::default()),
            Err(FlowFileError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            load_flow_file(&dir.path().join("missing.flow.json"), &PrepareEnv::default()),
            Err(FlowFileError::Io { .. })
        ));

        let files = flow_files_in(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("bad.flow.yaml"));
    }
}
