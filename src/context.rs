use std::{sync::Arc, time::Instant};

use crate::{
    flow::InvocationOptions,
    logger::{FlowLogger, LoggerType},
    state::{Scope, Store, StoreError, StoreHandle},
};

/// Everything a flow may touch during one invocation.
///
/// A context is built fresh for every invocation and dropped afterwards. It
/// borrows the engine's [`Store`] through two scoped handles and is the only
/// way a flow can read or write state or emit log lines.
#[derive(Debug, Clone)]
pub struct FlowContext {
    flow_id: Arc<str>,
    mapper: StoreHandle,
    script: StoreHandle,
    logger: FlowLogger,
    options: InvocationOptions,
    deadline: Option<Instant>,
}

impl FlowContext {
    /// Bind a context to `flow_id`'s scopes. Fails when the flow has no
    /// script scope, which means it is not registered.
    pub fn new(
        store: &Store,
        flow_id: &str,
        sink: Arc<dyn LoggerType>,
        options: InvocationOptions,
    ) -> Result<Self, StoreError> {
        let script = store.handle(&Scope::Script(flow_id.to_string()))?;
        let flow_id: Arc<str> = Arc::from(flow_id);
        Ok(Self {
            mapper: store.mapper(),
            script,
            logger: FlowLogger::new(sink, flow_id.clone()),
            flow_id,
            options,
            deadline: None,
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// State shared by all flows: device identity and other cross-flow facts.
    pub fn mapper(&self) -> &StoreHandle {
        &self.mapper
    }

    /// State private to this flow.
    pub fn script(&self) -> &StoreHandle {
        &self.script
    }

    pub fn logger(&self) -> &FlowLogger {
        &self.logger
    }

    pub fn options(&self) -> &InvocationOptions {
        &self.options
    }

    /// Point in time after which the invocation will be abandoned.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
