use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flow_api::{Message, Qos};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

use crate::{
    broker::Broker,
    context::FlowContext,
    executor::Executor,
    flow::{FlowDefinition, FlowRegistry, registry::RegistryEvent},
    logger::LoggerType,
    topic::{TopicError, validate_topic},
};

/// A produced message that cannot be published.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("output from `{flow}` has an invalid topic: {source}")]
    Topic {
        flow: String,
        #[source]
        source: TopicError,
    },
}

/// Outcome of processing one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub matched: usize,
    pub failed: usize,
    pub published: usize,
    pub dropped: usize,
}

type FlowLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Routes inbound messages to the flows subscribed to their topic and
/// republishes what those flows produce.
///
/// Matched flows run concurrently, but outputs are published in
/// registration order. Invocations of the same flow never overlap and start
/// in arrival order.
pub struct Dispatcher {
    registry: Arc<FlowRegistry>,
    executor: Executor,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn LoggerType>,
    default_qos: Qos,
    locks: FlowLocks,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .field("broker", &self.broker.name())
            .field("default_qos", &self.default_qos)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<FlowRegistry>,
        executor: Executor,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn LoggerType>,
    ) -> Self {
        let locks: FlowLocks = Arc::new(DashMap::new());
        let forget = locks.clone();
        registry.subscribe(Arc::new(move |event| {
            if let RegistryEvent::Unregistered(id) = event {
                forget.remove(id);
            }
        }));
        Self {
            registry,
            executor,
            broker,
            sink,
            default_qos: Qos::default(),
            locks,
        }
    }

    /// QoS used for outputs that do not carry one.
    pub fn with_default_qos(mut self, qos: Qos) -> Self {
        self.default_qos = qos;
        self
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    fn lock_for(&self, flow: &str) -> Arc<Mutex<()>> {
        self.locks.entry(flow.to_string()).or_default().clone()
    }

    fn context_for(&self, definition: &FlowDefinition) -> Option<FlowContext> {
        let options = self.registry.options_for(definition);
        match FlowContext::new(self.registry.store(), definition.id(), self.sink.clone(), options) {
            Ok(context) => Some(context),
            Err(err) => {
                error!(flow = definition.id(), error = %err, "cannot bind flow context");
                None
            }
        }
    }

    /// Route `message` to every matching flow and publish their outputs.
    #[instrument(skip_all, fields(topic = %message.topic))]
    pub async fn process(&self, mut message: Message) -> ProcessReport {
        let mut report = ProcessReport::default();
        if message.timestamp.is_none() {
            message.timestamp = Some(Utc::now());
        }

        let matched = self.registry.match_topic(&message.topic);
        report.matched = matched.len();
        if matched.is_empty() {
            debug!("no flow subscribed");
            return report;
        }

        let runs = matched.iter().map(|definition| self.invoke(definition, &message));
        let results = join_all(runs).await;

        let mut outputs = Vec::new();
        for (definition, result) in matched.iter().zip(results) {
            match result {
                Some(messages) => outputs.extend(messages.into_iter().map(|m| (definition.id(), m))),
                None => report.failed += 1,
            }
        }

        let (published, dropped) = self.publish_all(outputs).await;
        report.published = published;
        report.dropped = dropped;
        self.flush_state().await;
        report
    }

    /// Run the interval entry point of `definition` and publish its outputs.
    #[instrument(skip_all, fields(flow = definition.id()))]
    pub async fn tick(&self, definition: &Arc<FlowDefinition>, now: DateTime<Utc>) -> ProcessReport {
        let mut report = ProcessReport {
            matched: 1,
            ..Default::default()
        };
        let lock = self.lock_for(definition.id());
        let _guard = lock.lock().await;
        let Some(context) = self.context_for(definition) else {
            report.failed = 1;
            return report;
        };
        let outputs = match self.executor.tick(definition, now, context).await {
            Ok(messages) => messages,
            Err(_) => {
                report.failed = 1;
                Vec::new()
            }
        };
        let (published, dropped) = self
            .publish_all(outputs.into_iter().map(|m| (definition.id(), m)).collect())
            .await;
        report.published = published;
        report.dropped = dropped;
        self.flush_state().await;
        report
    }

    async fn invoke(&self, definition: &Arc<FlowDefinition>, message: &Message) -> Option<Vec<Message>> {
        let lock = self.lock_for(definition.id());
        let _guard = lock.lock().await;
        let context = self.context_for(definition)?;
        self.executor.run(definition, message, context).await.ok()
    }

    pub fn validate_output(flow: &str, message: &Message) -> Result<(), OutputError> {
        validate_topic(&message.topic).map_err(|source| OutputError::Topic {
            flow: flow.to_string(),
            source,
        })
    }

    async fn publish_all(&self, outputs: Vec<(&str, Message)>) -> (usize, usize) {
        let (mut published, mut dropped) = (0, 0);
        for (flow, message) in outputs {
            if let Err(err) = Self::validate_output(flow, &message) {
                warn!(error = %err, "dropping output message");
                dropped += 1;
                continue;
            }
            let qos = message.qos.unwrap_or(self.default_qos);
            match self
                .broker
                .publish(&message.topic, &message.payload, message.retain, qos)
                .await
            {
                Ok(()) => published += 1,
                Err(err) => {
                    error!(flow, topic = %message.topic, error = %err, "publish failed");
                    dropped += 1;
                }
            }
        }
        (published, dropped)
    }

    /// Persist the mapper scope when it changed. Failures are logged only.
    pub async fn flush_state(&self) {
        let store = self.registry.store();
        if store.is_dirty() {
            if let Err(err) = store.flush().await {
                warn!(error = %err, "mapper state not persisted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MemoryBroker,
        flow::{
            builtin::{AlertsFlow, IdentityForward, UnitsFlow},
            script::RhaiFlow,
        },
        logger::MemoryLogger,
        state::Store,
        topic::TopicFilter,
    };
    use flow_api::LogLevel;

    fn def(id: &str, topic: &str, transform: impl crate::flow::FlowTransform + 'static) -> FlowDefinition {
        FlowDefinition::new(id, vec![TopicFilter::new(topic).unwrap()], transform)
    }

    fn dispatcher() -> (Arc<Dispatcher>, Arc<MemoryBroker>) {
        let registry = FlowRegistry::new(Store::new());
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = Dispatcher::new(registry, Executor::default(), broker.clone(), MemoryLogger::new());
        (Arc::new(dispatcher), broker)
    }

    #[tokio::test]
    async fn test_unmatched_message_is_dropped_silently() {
        let (dispatcher, broker) = dispatcher();
        let report = dispatcher.process(Message::new("nobody/listens", "x")).await;
        assert_eq!(report, ProcessReport::default());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_outputs_follow_registration_order() {
        let (dispatcher, broker) = dispatcher();
        let registry = dispatcher.registry();
        registry.register(def("alerts", "sensors/#", AlertsFlow)).unwrap();
        registry.register(def("units", "sensors/+", UnitsFlow)).unwrap();

        let report = dispatcher
            .process(Message::new("sensors/t1", r#"{"temperature": 90}"#))
            .await;
        assert_eq!(report.matched, 2);
        assert_eq!(report.published, 2);

        let topics: Vec<_> = broker.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["te/device/main///a/overheat", "te/device/main///m/temperature"]);
    }

    #[tokio::test]
    async fn test_invalid_output_dropped_alone() {
        let (dispatcher, broker) = dispatcher();
        let script = RhaiFlow::from_source(
            r#"fn on_message(message, context) {
                [#{ topic: "a/+", payload: "bad" }, #{ topic: "", payload: "bad" }, #{ topic: "a/ok", payload: "good" }]
            }"#,
        )
        .compiled()
        .unwrap();
        dispatcher.registry().register(def("script", "in", script)).unwrap();

        let report = dispatcher.process(Message::new("in", "")).await;
        assert_eq!((report.published, report.dropped), (1, 2));
        let published = broker.published();
        assert_eq!(published[0].topic, "a/ok");
        assert_eq!(published[0].qos, Some(Qos::AtLeastOnce));
    }

    #[tokio::test]
    async fn test_failing_flow_does_not_block_others() {
        let registry = FlowRegistry::new(Store::new());
        let broker = Arc::new(MemoryBroker::new());
        let logs = MemoryLogger::new();
        let dispatcher = Dispatcher::new(registry, Executor::default(), broker.clone(), logs.clone());
        dispatcher.registry().register(def("units", "in", UnitsFlow)).unwrap();
        dispatcher.registry().register(def("fwd", "in", IdentityForward)).unwrap();

        let report = dispatcher.process(Message::new("in", "not json")).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 1);
        assert_eq!(broker.published()[0].payload_str(), Some("not json"));
        let failures = logs.lines().into_iter().filter(|l| l.level == LogLevel::Error).count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_inbound_messages_are_timestamped() {
        let (dispatcher, broker) = dispatcher();
        let script = RhaiFlow::from_source(
            r#"fn on_message(message, context) { #{ topic: "ts", payload: message.timestamp } }"#,
        )
        .compiled()
        .unwrap();
        dispatcher.registry().register(def("ts", "in", script)).unwrap();
        dispatcher.process(Message::new("in", "x")).await;

        let stamp = broker.published()[0].payload_str().unwrap().to_string();
        assert!(DateTime::parse_from_rfc3339(&stamp).is_ok());

        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc);
        dispatcher.process(Message::new("in", "x").with_timestamp(at)).await;
        assert_eq!(broker.published()[1].payload_str(), Some(at.to_rfc3339().as_str()));
    }

    #[tokio::test]
    async fn test_broker_failure_drops_only_that_message() {
        let (dispatcher, broker) = dispatcher();
        broker.refuse("te/device/main///a/overheat");
        dispatcher.registry().register(def("alerts", "in", AlertsFlow)).unwrap();
        dispatcher.registry().register(def("fwd", "in", IdentityForward)).unwrap();

        let report = dispatcher.process(Message::new("in", r#"{"temperature": 99}"#)).await;
        assert_eq!((report.published, report.dropped), (1, 1));
        assert_eq!(broker.published()[0].topic, "in");
    }
}
