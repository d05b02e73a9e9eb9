use std::{
    collections::HashSet,
    fmt,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use dashmap::DashMap;
use flow_api::{Message, Payload, Qos};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish to `{topic}` was refused: {reason}")]
    Refused { topic: String, reason: String },
    #[error("could not encode message for `{topic}`: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The transport outbound messages are handed to.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Payload, retain: bool, qos: Qos) -> Result<(), BrokerError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Records everything published and keeps retained values per topic,
/// clearing them on retained empty payloads.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<Message>>,
    retained: DashMap<String, Message>,
    refused: Mutex<HashSet<String>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Message> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the published messages.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.published.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.retained.get(topic).map(|m| m.value().clone())
    }

    /// Make every publish to `topic` fail.
    pub fn refuse(&self, topic: impl Into<String>) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.into());
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &Payload, retain: bool, qos: Qos) -> Result<(), BrokerError> {
        if self
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
        {
            return Err(BrokerError::Refused {
                topic: topic.to_string(),
                reason: "topic refused".into(),
            });
        }
        let message = Message::new(topic, payload.clone())
            .with_retain(retain)
            .with_qos(qos);
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), message.clone());
            }
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryBroker"
    }
}

/// Writes each published message as one JSON line on stdout.
#[derive(Debug)]
pub struct StdoutBroker {
    out: tokio::sync::Mutex<tokio::io::Stdout>,
}

impl Default for StdoutBroker {
    fn default() -> Self {
        Self {
            out: tokio::sync::Mutex::new(tokio::io::stdout()),
        }
    }
}

impl StdoutBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for StdoutBroker {
    async fn publish(&self, topic: &str, payload: &Payload, retain: bool, qos: Qos) -> Result<(), BrokerError> {
        let message = Message::new(topic, payload.clone())
            .with_retain(retain)
            .with_qos(qos);
        let mut line = serde_json::to_vec(&message).map_err(|source| BrokerError::Encode {
            topic: topic.to_string(),
            source,
        })?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "StdoutBroker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_broker_retained_semantics() {
        let broker = MemoryBroker::new();
        let topic = "te/device/main///a/overheat";

        broker.publish(topic, &Payload::from("hot"), true, Qos::AtLeastOnce).await.unwrap();
        assert_eq!(broker.retained(topic).unwrap().payload_str(), Some("hot"));

        broker.publish(topic, &Payload::from(""), true, Qos::AtLeastOnce).await.unwrap();
        assert!(broker.retained(topic).is_none());

        broker.publish("plain", &Payload::from("x"), false, Qos::AtMostOnce).await.unwrap();
        assert!(broker.retained("plain").is_none());

        let published = broker.take();
        assert_eq!(published.len(), 3);
        assert!(published[1].is_clear());
        assert_eq!(published[2].qos, Some(Qos::AtMostOnce));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_memory_broker_refusal() {
        let broker = MemoryBroker::new();
        broker.refuse("nope");
        let err = broker.publish("nope", &Payload::from("x"), false, Qos::AtLeastOnce).await;
        assert!(matches!(err, Err(BrokerError::Refused { .. })));
        assert!(broker.published().is_empty());
    }
}
