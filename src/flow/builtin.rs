//! Native transforms for the reference device flows.

use async_trait::async_trait;
use flow_api::{FlowOutput, Message};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use crate::{
    context::FlowContext,
    flow::{FlowError, FlowTransform},
};

pub const OVERHEAT_ALARM_TOPIC: &str = "te/device/main///a/overheat";
pub const TEMPERATURE_TOPIC: &str = "te/device/main///m/temperature";
pub const PRESSURE_TOPIC: &str = "te/device/main///m/pressure";
pub const EVENTS_OUT_TOPIC: &str = "c8y/mqtt/out/te/v1/events";

const PSI_TO_BAR: f64 = 0.0689476;

/// Render a number the way JSON authors expect: `0` rather than `0.0`.
pub(crate) fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn format_number(n: f64) -> String {
    number_value(n).to_string()
}

/// Numeric value of a JSON value under JavaScript relational coercion.
///
/// Strings are trimmed and parsed (empty means 0), booleans and null become
/// 1/0, arrays go through their joined string form. `None` stands for NaN,
/// which compares false against any threshold.
pub(crate) fn js_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        Value::String(s) => parse_js_number(s),
        Value::Array(_) => parse_js_number(&js_string(value)),
        Value::Object(_) => None,
    }
}

fn parse_js_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return Some(0.0);
    }
    match text {
        "Infinity" | "+Infinity" => return Some(f64::INFINITY),
        "-Infinity" => return Some(f64::NEG_INFINITY),
        _ => {}
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    let lower = text.to_ascii_lowercase();
    if lower.contains("inf") || lower.contains("nan") {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| !n.is_nan())
}

/// String form of a JSON value under JavaScript template interpolation.
pub(crate) fn js_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Raises or clears the overheat alarm.
///
/// Options: `high` (default 80) and `warn` (default 60).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsFlow;

#[async_trait]
#[typetag::serde(name = "alerts")]
impl FlowTransform for AlertsFlow {
    async fn on_message(&self, message: &Message, context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let payload = message.payload_json()?;
        let high = context.options().number_or("high", 80.0);
        let warn = context.options().number_or("warn", 60.0);

        let Some(value) = payload.get("temperature").cloned() else {
            return Ok(Message::clear(OVERHEAT_ALARM_TOPIC).into());
        };
        let alarm = match js_number(&value) {
            Some(t) if t > high => Some(("critical", format!("temperature is > {}°C", format_number(high)))),
            Some(t) if t > warn => Some((
                "major",
                format!(
                    "temperature is > {} but lower than {}°C",
                    format_number(warn),
                    format_number(high)
                ),
            )),
            _ => None,
        };

        let out = match alarm {
            Some((severity, text)) => {
                let body = json!({ "text": text, "severity": severity, "value": value });
                Message::new(OVERHEAT_ALARM_TOPIC, body.to_string()).with_retain(true)
            }
            None => Message::clear(OVERHEAT_ALARM_TOPIC),
        };
        Ok(out.into())
    }
}

/// Converts Fahrenheit temperatures to Celsius, or psi pressures to bar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitsFlow;

#[async_trait]
#[typetag::serde(name = "units")]
impl FlowTransform for UnitsFlow {
    async fn on_message(&self, message: &Message, _context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let payload = message.payload_json()?;

        if let Some(f) = payload.get("temperature").and_then(Value::as_f64) {
            let celsius = (f - 32.0) * 5.0 / 9.0;
            let body = json!({ "temperature": number_value(celsius) });
            return Ok(Message::new(TEMPERATURE_TOPIC, body.to_string()).into());
        }
        if let Some(psi) = payload.get("pressure").and_then(Value::as_f64) {
            let body = json!({ "pressure": number_value(psi * PSI_TO_BAR) });
            return Ok(Message::new(PRESSURE_TOPIC, body.to_string()).into());
        }
        Ok(FlowOutput::NoOutput)
    }
}

/// Binds the device identity from `device.id=<value>` messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityFlow;

pub const DEVICE_ID_KEY: &str = "device.id";

#[async_trait]
#[typetag::serde(name = "identity")]
impl FlowTransform for IdentityFlow {
    async fn on_message(&self, message: &Message, context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let text = message.payload_str().unwrap_or_default();
        if let Some((key, value)) = text.split_once('=') {
            if !key.is_empty() && !value.is_empty() && key == DEVICE_ID_KEY {
                context.logger().info(&format!("key={key}, value={value}"));
                context.mapper().set(key, Value::String(value.to_string()));
            }
        }
        Ok(FlowOutput::NoOutput)
    }
}

/// Turns local event messages into cloud events, numbering them per flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsFlow;

fn log_message(text: Option<Value>) -> String {
    let text = match text {
        Some(text) if js_truthy(&text) => js_string(&text),
        _ => "test event".to_string(),
    };
    format!("{text} (from mqtt-service)")
}

#[async_trait]
#[typetag::serde(name = "events")]
impl FlowTransform for EventsFlow {
    async fn on_message(&self, message: &Message, context: &FlowContext) -> Result<FlowOutput, FlowError> {
        let event_type = message.topic_suffix().to_string();
        let source = match context.mapper().get(DEVICE_ID_KEY) {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => {
                context
                    .logger()
                    .info("Skipping message as the source could not be determined");
                return Ok(FlowOutput::NoOutput);
            }
        };

        let count = context.script().update("count", |current| {
            let count = current
                .and_then(Value::as_u64)
                .filter(|n| *n != 0)
                .unwrap_or(1);
            (json!(count + 1), count)
        });

        let payload = message.payload_json()?;
        context.logger().info(&format!("Processing message {payload}"));

        let mut properties = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let text = properties.shift_remove("text");
        properties.insert("logMessage".into(), Value::String(log_message(text)));
        properties.insert("tedgeFlowInstanceMessageCount".into(), json!(count));
        properties.insert("type".into(), Value::String(event_type));
        properties.insert("payloadType".into(), json!("event"));
        properties.insert("source".into(), Value::String(source));

        let body = Value::Object(properties).to_string();
        Ok(FlowOutput::Many(vec![Message::new(EVENTS_OUT_TOPIC, body)]))
    }
}

/// Republishes every message unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityForward;

#[async_trait]
#[typetag::serde(name = "forward")]
impl FlowTransform for IdentityForward {
    async fn on_message(&self, message: &Message, _context: &FlowContext) -> Result<FlowOutput, FlowError> {
        Ok(message.clone().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flow::InvocationOptions, logger::MemoryLogger, state::Store};
    use std::sync::Arc;

    fn context(store: &Arc<Store>, flow: &str, options: Value) -> FlowContext {
        store.create_script_scope(flow);
        let options = options.as_object().cloned().unwrap_or_default();
        FlowContext::new(store, flow, MemoryLogger::new(), InvocationOptions::from(options)).unwrap()
    }

    fn body(msg: &Message) -> Value {
        msg.payload_json().unwrap()
    }

    #[test]
    fn test_number_value() {
        assert_eq!(number_value(0.0).to_string(), "0");
        assert_eq!(number_value(-17.5).to_string(), "-17.5");
        assert_eq!(number_value(f64::NAN), Value::Null);
    }

    #[tokio::test]
    async fn test_alerts_thresholds() {
        let store = Store::new();
        let ctx = context(&store, "alerts", json!({"high": 80, "warn": 60}));

        let critical = AlertsFlow
            .on_message(&Message::new("t", r#"{"temperature": 85.5}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(critical.len(), 1);
        assert!(critical[0].retain);
        assert_eq!(critical[0].topic, OVERHEAT_ALARM_TOPIC);
        assert_eq!(
            body(&critical[0]),
            json!({"text": "temperature is > 80°C", "severity": "critical", "value": 85.5})
        );

        let major = AlertsFlow
            .on_message(&Message::new("t", r#"{"temperature": 80}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(body(&major[0])["severity"], "major");
        assert_eq!(body(&major[0])["text"], "temperature is > 60 but lower than 80°C");
        assert_eq!(body(&major[0])["value"], json!(80));

        let clear = AlertsFlow
            .on_message(&Message::new("t", r#"{"temperature": 60}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert!(clear[0].is_clear());

        let garbage = AlertsFlow.on_message(&Message::new("t", "not json"), &ctx).await;
        assert!(matches!(garbage, Err(FlowError::Payload(_))));
    }

    #[test]
    fn test_js_coercion() {
        assert_eq!(js_number(&json!("95")), Some(95.0));
        assert_eq!(js_number(&json!(" 7.5 ")), Some(7.5));
        assert_eq!(js_number(&json!("")), Some(0.0));
        assert_eq!(js_number(&json!("hot")), None);
        assert_eq!(js_number(&json!("nan")), None);
        assert_eq!(js_number(&json!(true)), Some(1.0));
        assert_eq!(js_number(&json!(null)), Some(0.0));
        assert_eq!(js_number(&json!([91])), Some(91.0));
        assert_eq!(js_number(&json!([1, 2])), None);
        assert_eq!(js_number(&json!({"c": 1})), None);

        assert_eq!(js_string(&json!(["a", null, 3])), "a,,3");
        assert_eq!(js_string(&json!({"a": 1})), "[object Object]");
        assert_eq!(js_string(&json!(4.0)), "4");
    }

    #[tokio::test]
    async fn test_alerts_coerce_string_temperatures() {
        let store = Store::new();
        let ctx = context(&store, "alerts", json!({}));

        let out = AlertsFlow
            .on_message(&Message::new("t", r#"{"temperature": "95"}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(
            out[0].payload_str(),
            Some(r#"{"text":"temperature is > 80°C","severity":"critical","value":"95"}"#)
        );

        for payload in [r#"{"temperature": "hot"}"#, r#"{"temperature": {"c": 95}}"#, "{}"] {
            let out = AlertsFlow
                .on_message(&Message::new("t", payload), &ctx)
                .await
                .unwrap()
                .into_messages();
            assert!(out[0].is_clear(), "{payload}");
        }
    }

    #[tokio::test]
    async fn test_alerts_default_thresholds() {
        let store = Store::new();
        let ctx = context(&store, "alerts", json!({}));
        let out = AlertsFlow
            .on_message(&Message::new("t", r#"{"temperature": 70}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(body(&out[0])["severity"], "major");
    }

    #[tokio::test]
    async fn test_units() {
        let store = Store::new();
        let ctx = context(&store, "units", json!({}));

        let out = UnitsFlow
            .on_message(&Message::new("t", r#"{"temperature": 32}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(out[0].topic, TEMPERATURE_TOPIC);
        assert_eq!(out[0].payload_str(), Some(r#"{"temperature":0}"#));

        let out = UnitsFlow
            .on_message(&Message::new("t", r#"{"pressure": 1}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(out[0].topic, PRESSURE_TOPIC);
        assert_eq!(body(&out[0]), json!({"pressure": 0.0689476}));

        let none = UnitsFlow
            .on_message(&Message::new("t", r#"{"humidity": 40, "temperature": "hot"}"#), &ctx)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_identity_binds_device_id_only() {
        let store = Store::new();
        let ctx = context(&store, "identity", json!({}));

        let out = IdentityFlow
            .on_message(&Message::new("t", "device.id=abc123"), &ctx)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(store.mapper().get(DEVICE_ID_KEY), Some(json!("abc123")));

        IdentityFlow
            .on_message(&Message::new("t", "other.key=x"), &ctx)
            .await
            .unwrap();
        IdentityFlow.on_message(&Message::new("t", "device.id="), &ctx).await.unwrap();
        assert_eq!(store.mapper().len(), 1);
        assert_eq!(store.mapper().get(DEVICE_ID_KEY), Some(json!("abc123")));

        IdentityFlow
            .on_message(&Message::new("t", "device.id=a=b"), &ctx)
            .await
            .unwrap();
        assert_eq!(store.mapper().get(DEVICE_ID_KEY), Some(json!("a=b")));
    }

    #[tokio::test]
    async fn test_events_skip_without_device_id() {
        let store = Store::new();
        let ctx = context(&store, "events", json!({}));
        let out = EventsFlow
            .on_message(&Message::new("te/device/main///e/login", r#"{"text":"hi"}"#), &ctx)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert!(ctx.script().is_empty());
    }

    #[tokio::test]
    async fn test_events_enrich_and_count() {
        let store = Store::new();
        store.mapper().set(DEVICE_ID_KEY, json!("abc123"));
        let ctx = context(&store, "events", json!({}));

        for expected in 1..=3 {
            let out = EventsFlow
                .on_message(
                    &Message::new("te/device/main///e/login", r#"{"text":"user logged in","user":"bob"}"#),
                    &ctx,
                )
                .await
                .unwrap()
                .into_messages();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].topic, EVENTS_OUT_TOPIC);
            assert_eq!(
                body(&out[0]),
                json!({
                    "user": "bob",
                    "logMessage": "user logged in (from mqtt-service)",
                    "tedgeFlowInstanceMessageCount": expected,
                    "type": "login",
                    "payloadType": "event",
                    "source": "abc123",
                })
            );
        }

        let out = EventsFlow
            .on_message(&Message::new("te/device/main///e/boot", "{}"), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(body(&out[0])["logMessage"], "test event (from mqtt-service)");
        assert_eq!(body(&out[0])["type"], "boot");
    }

    #[tokio::test]
    async fn test_events_keep_key_order_and_stringify_text() {
        let store = Store::new();
        store.mapper().set(DEVICE_ID_KEY, json!("abc123"));
        let ctx = context(&store, "events", json!({}));

        let out = EventsFlow
            .on_message(
                &Message::new("te/device/main///e/door", r#"{"zone":"b","text":["a","b"],"level":2}"#),
                &ctx,
            )
            .await
            .unwrap()
            .into_messages();
        assert_eq!(
            out[0].payload_str(),
            Some(concat!(
                r#"{"zone":"b","level":2,"logMessage":"a,b (from mqtt-service)","#,
                r#""tedgeFlowInstanceMessageCount":1,"type":"door","payloadType":"event","source":"abc123"}"#
            ))
        );

        let out = EventsFlow
            .on_message(&Message::new("te/device/main///e/door", r#"{"text":0}"#), &ctx)
            .await
            .unwrap()
            .into_messages();
        assert_eq!(body(&out[0])["logMessage"], "test event (from mqtt-service)");
    }

    #[tokio::test]
    async fn test_forward_echoes_message() {
        let store = Store::new();
        let ctx = context(&store, "fwd", json!({}));
        let msg = Message::new("a/b", "x").with_retain(true);
        let out = IdentityForward.on_message(&msg, &ctx).await.unwrap().into_messages();
        assert_eq!(out, vec![msg]);
    }
}
