use std::{any::Any, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use flow_api::Message;
use thiserror::Error;
use tracing::{Instrument, debug, error, info_span};

use crate::{
    context::FlowContext,
    flow::{FlowDefinition, FlowError},
};

pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Why an invocation produced nothing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationError {
    #[error("inbound message has an empty topic")]
    EmptyTopic,
    #[error("flow `{flow}` failed: {source}")]
    Failed {
        flow: String,
        #[source]
        source: FlowError,
    },
    #[error("flow `{flow}` exceeded its {timeout:?} time limit")]
    TimedOut { flow: String, timeout: Duration },
    #[error("flow `{flow}` panicked: {message}")]
    Panicked { flow: String, message: String },
}

enum Trigger {
    Message(Message),
    Interval(DateTime<Utc>),
}

/// Runs one transform against one message, bounded in time and isolated
/// from the caller.
///
/// Every invocation runs on its own task: a panic or an abort stays inside
/// that task and comes back as an [`InvocationError`]. Store writes made
/// before a failure are kept.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_INVOCATION_TIMEOUT)
    }
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `definition` on `message`. Failures are logged with the flow id
    /// and topic, to tracing and to the flow log, before being returned.
    pub async fn run(
        &self,
        definition: &Arc<FlowDefinition>,
        message: &Message,
        context: FlowContext,
    ) -> Result<Vec<Message>, InvocationError> {
        let logger = context.logger().clone();
        let result = if message.topic.is_empty() {
            Err(InvocationError::EmptyTopic)
        } else {
            let span = info_span!("invocation", flow = definition.id(), topic = %message.topic);
            self.invoke(definition, Trigger::Message(message.clone()), context)
                .instrument(span)
                .await
        };
        if let Err(err) = &result {
            error!(flow = definition.id(), topic = %message.topic, error = %err, "invocation failed");
            logger.error(&format!("invocation on `{}` failed: {err}", message.topic));
        }
        result
    }

    /// Run the interval entry point of `definition`.
    pub async fn tick(
        &self,
        definition: &Arc<FlowDefinition>,
        now: DateTime<Utc>,
        context: FlowContext,
    ) -> Result<Vec<Message>, InvocationError> {
        let logger = context.logger().clone();
        let span = info_span!("interval", flow = definition.id());
        let result = self
            .invoke(definition, Trigger::Interval(now), context)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            error!(flow = definition.id(), error = %err, "interval invocation failed");
            logger.error(&format!("interval invocation failed: {err}"));
        }
        result
    }

    async fn invoke(
        &self,
        definition: &Arc<FlowDefinition>,
        trigger: Trigger,
        context: FlowContext,
    ) -> Result<Vec<Message>, InvocationError> {
        let flow = definition.id().to_string();
        let transform = definition.transform().clone();
        let context = context.with_deadline(std::time::Instant::now() + self.timeout);

        let task = tokio::spawn(
            async move {
                match trigger {
                    Trigger::Message(message) => transform.on_message(&message, &context).await,
                    Trigger::Interval(now) => transform.on_interval(now, &context).await,
                }
            }
            .in_current_span(),
        );
        let abort = task.abort_handle();

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                abort.abort();
                Err(InvocationError::TimedOut {
                    flow,
                    timeout: self.timeout,
                })
            }
            Ok(Err(join)) if join.is_panic() => Err(InvocationError::Panicked {
                flow,
                message: panic_message(join.into_panic()),
            }),
            Ok(Err(join)) => Err(InvocationError::Panicked {
                flow,
                message: join.to_string(),
            }),
            Ok(Ok(Err(source))) => Err(InvocationError::Failed { flow, source }),
            Ok(Ok(Ok(output))) => {
                debug!(outputs = output.len(), "invocation succeeded");
                Ok(output.into_messages())
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
