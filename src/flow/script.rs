use std::{fmt, path::PathBuf, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_api::{FlowOutput, LogLevel, Message, Payload, Qos};
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, NativeCallContext, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    context::FlowContext,
    flow::{FlowError, FlowTransform, PrepareEnv},
    logger::FlowLogger,
    state::StoreHandle,
};

const ON_MESSAGE: &str = "on_message";
const ON_INTERVAL: &str = "on_interval";

/// A flow written in [Rhai](https://rhai.rs).
///
/// The script must define `fn on_message(message, context)` and may define
/// `fn on_interval(time, context)`. Inside the script:
///
/// - `message` is a map with `topic`, `payload` (string, or blob when the
///   payload is not UTF-8), `retain`, `qos` and `timestamp`.
/// - `context.mapper` and `context.script` offer `get`, `set`, `has` and
///   `remove`. Reading a missing key gives `()`. `update(key, |value| ...)`
///   replaces a value atomically with respect to other flows and returns the
///   stored result; the closure may run more than once under contention.
/// - `context.config` is the map of options for this invocation.
/// - `context.log(text)` / `context.log(level, text)` and `print` write to the
///   flow log.
/// - `from_json(text)` and `to_json(value)` convert between JSON text and
///   Rhai values.
///
/// Return `()` for no output, a map for one message or an array of maps for
/// several.
///
/// ```rhai
/// fn on_message(message, context) {
///     let count = context.script.get("count") ?? 1;
///     context.script.set("count", count + 1);
///     #{ topic: "out/count", payload: `${count}` }
/// }
/// ```
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RhaiFlow {
    /// Inline script source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Script file, relative to the flow file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    compiled: Option<Arc<CompiledScript>>,
}

impl fmt::Debug for RhaiFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiFlow")
            .field("path", &self.path)
            .field("inline", &self.source.is_some())
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct CompiledScript {
    ast: AST,
    max_operations: u64,
    has_on_interval: bool,
}

impl RhaiFlow {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Compile the script with default settings.
    pub fn compiled(mut self) -> Result<Self, FlowError> {
        self.prepare(&PrepareEnv::default())?;
        Ok(self)
    }

    pub fn has_on_interval(&self) -> bool {
        self.compiled.as_ref().is_some_and(|c| c.has_on_interval)
    }

    fn load_source(&self, env: &PrepareEnv) -> Result<String, FlowError> {
        match (&self.source, &self.path) {
            (Some(source), None) => Ok(source.clone()),
            (None, Some(path)) => {
                let full = match &env.base_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                std::fs::read_to_string(&full)
                    .map_err(|e| FlowError::Setup(format!("cannot read script {}: {e}", full.display())))
            }
            (Some(_), Some(_)) => Err(FlowError::Setup("set either `source` or `path`, not both".into())),
            (None, None) => Err(FlowError::Setup("script needs a `source` or a `path`".into())),
        }
    }

    fn script(&self) -> Result<Arc<CompiledScript>, FlowError> {
        self.compiled
            .clone()
            .ok_or_else(|| FlowError::Setup("script was not compiled".into()))
    }
}

#[async_trait]
#[typetag::serde(name = "rhai")]
impl FlowTransform for RhaiFlow {
    async fn on_message(&self, message: &Message, context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let script = self.script()?;
        let input = message_to_dynamic(message);
        let context = context.clone();
        tokio::task::spawn_blocking(move || script.call(ON_MESSAGE, input, &context))
            .await
            .map_err(|e| FlowError::Script(format!("script task failed: {e}")))?
    }

    async fn on_interval(&self, now: DateTime<Utc>, context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let script = self.script()?;
        if !script.has_on_interval {
            return Ok(FlowOutput::NoOutput);
        }
        let time = Dynamic::from(now.to_rfc3339());
        let context = context.clone();
        tokio::task::spawn_blocking(move || script.call(ON_INTERVAL, time, &context))
            .await
            .map_err(|e| FlowError::Script(format!("script task failed: {e}")))?
    }

    fn prepare(&mut self, env: &PrepareEnv) -> Result<(), FlowError> {
        let source = self.load_source(env)?;
        let ast = Engine::new()
            .compile(&source)
            .map_err(|e| FlowError::Setup(format!("script does not compile: {e}")))?;

        let defines = |name: &str| ast.iter_functions().any(|f| f.name == name && f.params.len() == 2);
        if !defines(ON_MESSAGE) {
            return Err(FlowError::Setup(format!("script does not define `{ON_MESSAGE}(message, context)`")));
        }
        let has_on_interval = defines(ON_INTERVAL);

        self.compiled = Some(Arc::new(CompiledScript {
            ast,
            max_operations: env.max_operations,
            has_on_interval,
        }));
        Ok(())
    }
}

impl CompiledScript {
    fn call(&self, entry: &str, arg: Dynamic, context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let engine = self.engine(context);
        let mut scope = Scope::new();
        let result = engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, entry, (arg, ScriptContext::new(context)))
            .map_err(|e| match *e {
                EvalAltResult::ErrorTerminated(..) => FlowError::Script("script exceeded its deadline".into()),
                other => FlowError::Script(other.to_string()),
            })?;
        normalize(result, context.logger())
    }

    fn engine(&self, context: &FlowContext) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);

        if let Some(deadline) = context.deadline() {
            engine.on_progress(move |_| {
                if Instant::now() >= deadline {
                    Some(Dynamic::from("deadline exceeded"))
                } else {
                    None
                }
            });
        }

        let logger = context.logger().clone();
        engine.on_print(move |text| logger.info(text));
        let logger = context.logger().clone();
        engine.on_debug(move |text, _, _| logger.debug(text));

        register_api(&mut engine);
        engine
    }
}

/// What a script sees as `context`.
#[derive(Clone)]
struct ScriptContext {
    flow_id: String,
    mapper: StoreApi,
    script: StoreApi,
    config: Dynamic,
    logger: FlowLogger,
}

impl ScriptContext {
    fn new(context: &FlowContext) -> Self {
        Self {
            flow_id: context.flow_id().to_string(),
            mapper: StoreApi(context.mapper().clone()),
            script: StoreApi(context.script().clone()),
            config: rhai::serde::to_dynamic(context.options().as_map()).unwrap_or(Dynamic::UNIT),
            logger: context.logger().clone(),
        }
    }
}

#[derive(Clone)]
struct StoreApi(StoreHandle);

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn json_to_dynamic(value: &Value) -> RhaiResult<Dynamic> {
    rhai::serde::to_dynamic(value)
}

fn dynamic_to_json(value: &Dynamic) -> RhaiResult<Value> {
    rhai::serde::from_dynamic(value)
}

fn register_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptContext>("Context")
        .register_get("flow_id", |c: &mut ScriptContext| c.flow_id.clone())
        .register_get("mapper", |c: &mut ScriptContext| c.mapper.clone())
        .register_get("script", |c: &mut ScriptContext| c.script.clone())
        .register_get("config", |c: &mut ScriptContext| c.config.clone())
        .register_fn("log", |c: &mut ScriptContext, text: &str| c.logger.info(text))
        .register_fn("log", |c: &mut ScriptContext, level: &str, text: &str| {
            c.logger.log(level.parse::<LogLevel>().unwrap_or_default(), text)
        });

    engine
        .register_type_with_name::<StoreApi>("Store")
        .register_fn("get", |s: &mut StoreApi, key: &str| -> RhaiResult<Dynamic> {
            match s.0.get(key) {
                Some(value) => json_to_dynamic(&value),
                None => Ok(Dynamic::UNIT),
            }
        })
        .register_fn("set", |s: &mut StoreApi, key: &str, value: Dynamic| -> RhaiResult<()> {
            s.0.set(key, dynamic_to_json(&value)?);
            Ok(())
        })
        .register_fn("has", |s: &mut StoreApi, key: &str| s.0.has(key))
        .register_fn(
            "update",
            |ctx: NativeCallContext, s: &mut StoreApi, key: &str, f: FnPtr| -> RhaiResult<Dynamic> {
                loop {
                    let current = s.0.get(key);
                    let arg = match &current {
                        Some(value) => json_to_dynamic(value)?,
                        None => Dynamic::UNIT,
                    };
                    let next = f.call_within_context::<Dynamic>(&ctx, (arg,))?;
                    let stored = dynamic_to_json(&next)?;
                    if s.0.compare_and_swap(key, current.as_ref(), stored) {
                        return Ok(next);
                    }
                }
            },
        )
        .register_fn("remove", |s: &mut StoreApi, key: &str| -> RhaiResult<Dynamic> {
            match s.0.remove(key) {
                Some(value) => json_to_dynamic(&value),
                None => Ok(Dynamic::UNIT),
            }
        });

    engine
        .register_fn("from_json", |text: &str| -> RhaiResult<Dynamic> {
            let value: Value = serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
            json_to_dynamic(&value)
        })
        .register_fn("to_json", |value: Dynamic| -> RhaiResult<String> {
            Ok(dynamic_to_json(&value)?.to_string())
        });
}

fn message_to_dynamic(message: &Message) -> Dynamic {
    let mut map = rhai::Map::new();
    map.insert("topic".into(), Dynamic::from(message.topic.clone()));
    let payload = match message.payload_str() {
        Some(text) => Dynamic::from(text.to_string()),
        None => Dynamic::from_blob(message.payload.as_bytes().to_vec()),
    };
    map.insert("payload".into(), payload);
    map.insert("retain".into(), Dynamic::from_bool(message.retain));
    map.insert(
        "qos".into(),
        message
            .qos
            .map(|q| Dynamic::from_int(u8::from(q) as rhai::INT))
            .unwrap_or(Dynamic::UNIT),
    );
    map.insert(
        "timestamp".into(),
        message
            .timestamp
            .map(|t| Dynamic::from(t.to_rfc3339()))
            .unwrap_or(Dynamic::UNIT),
    );
    Dynamic::from_map(map)
}

/// Turn a script result into flow output.
///
/// A record that cannot become a message (payload neither string nor blob,
/// non-string topic, bad qos) is dropped on its own; a result that is not
/// `()`, a map or an array of maps fails the whole invocation.
fn normalize(result: Dynamic, logger: &FlowLogger) -> Result<FlowOutput, FlowError> {
    if result.is_unit() {
        return Ok(FlowOutput::NoOutput);
    }
    if result.is_map() {
        let Some(map) = result.try_cast::<rhai::Map>() else {
            return Err(FlowError::MalformedOutput("unreadable map".into()));
        };
        return Ok(keep_valid(map, logger).into());
    }
    if result.is_array() {
        let items = result
            .into_array()
            .map_err(|t| FlowError::MalformedOutput(format!("expected array, got {t}")))?;
        let mut records = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let type_name = item.type_name();
            let map = item
                .try_cast::<rhai::Map>()
                .ok_or_else(|| FlowError::MalformedOutput(format!("element {i} is a {type_name}, not a map")))?;
            records.push(map);
        }
        let messages: Vec<Message> = records.into_iter().filter_map(|m| keep_valid(m, logger)).collect();
        return Ok(FlowOutput::Many(messages));
    }
    Err(FlowError::MalformedOutput(format!(
        "expected (), a map or an array of maps, got {}",
        result.type_name()
    )))
}

fn keep_valid(record: rhai::Map, logger: &FlowLogger) -> Option<Message> {
    match record_to_message(record) {
        Ok(message) => Some(message),
        Err(reason) => {
            warn!(%reason, "dropping script output record");
            logger.warn(&format!("dropping output record: {reason}"));
            None
        }
    }
}

fn record_to_message(mut record: rhai::Map) -> Result<Message, String> {
    let topic = match record.remove("topic") {
        Some(topic) if topic.is_string() => topic.into_string().map_err(|t| format!("topic is a {t}"))?,
        Some(other) => return Err(format!("topic is a {}, not a string", other.type_name())),
        None => return Err("record has no topic".into()),
    };
    let payload = match record.remove("payload") {
        Some(p) if p.is_string() => Payload::Text(p.into_string().map_err(|t| format!("payload is a {t}"))?),
        Some(p) if p.is_blob() => Payload::from(p.into_blob().map_err(|t| format!("payload is a {t}"))?),
        Some(other) => return Err(format!("payload of `{topic}` is a {}, not a string", other.type_name())),
        None => return Err(format!("record for `{topic}` has no payload")),
    };

    let mut message = Message::new(topic, payload);
    if let Some(retain) = record.remove("retain").filter(|r| !r.is_unit()) {
        message.retain = retain
            .as_bool()
            .map_err(|t| format!("retain is a {t}, not a bool"))?;
    }
    if let Some(qos) = record.remove("qos").filter(|q| !q.is_unit()) {
        let level = qos.as_int().map_err(|t| format!("qos is a {t}, not an integer"))?;
        let level = u8::try_from(level).map_err(|_| format!("invalid qos {level}"))?;
        message.qos = Some(Qos::try_from(level)?);
    }
    Ok(message)
}
