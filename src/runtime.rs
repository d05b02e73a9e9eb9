use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use flow_api::Message;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::Notify,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::Dispatcher,
    flow::{FlowDefinition, registry::RegistryEvent},
    topic::{TopicError, validate_topic},
};

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(60);

/// What to do when a topic queue is full.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming message.
    RejectNewest,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("invalid inbound topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("queue for `{topic}` is full ({depth} messages)")]
    QueueFull { topic: String, depth: usize },
    #[error("engine is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub queue_depth: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long a topic worker waits for work before it is retired.
    pub idle_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            overflow_policy: OverflowPolicy::default(),
            idle_timeout: DEFAULT_WORKER_IDLE,
        }
    }
}

#[derive(Default)]
struct TopicQueue {
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl TopicQueue {
    fn pop(&self) -> Option<Message> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct Worker {
    queue: Arc<TopicQueue>,
    task: JoinHandle<()>,
}

type Workers = Arc<DashMap<String, Worker>>;

/// Feeds inbound messages to the [`Dispatcher`].
///
/// Each inbound topic gets its own bounded FIFO queue drained by one worker
/// task, so messages on a topic are processed in arrival order while
/// different topics proceed in parallel. A worker that stays idle for
/// [`RuntimeOptions::idle_timeout`] is retired and respawned on the next
/// message for its topic. Flows with an interval are ticked by their own
/// timer task.
pub struct Runtime {
    dispatcher: Arc<Dispatcher>,
    options: RuntimeOptions,
    workers: Workers,
    tickers: DashMap<String, JoinHandle<()>>,
    stopping: AtomicBool,
}

impl Runtime {
    pub fn new(dispatcher: Arc<Dispatcher>, options: RuntimeOptions) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            options,
            workers: Arc::new(DashMap::new()),
            tickers: DashMap::new(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Restore persisted state, start interval timers for the flows already
    /// registered and follow later registry changes.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let registry = self.dispatcher.registry().clone();
        match registry.store().restore().await {
            Ok(0) => {}
            Ok(count) => info!(count, "mapper state restored"),
            Err(err) => warn!(error = %err, "starting with empty mapper state"),
        }

        for definition in registry.all() {
            self.start_ticker(&definition);
        }

        let handle = Handle::current();
        let runtime: Weak<Runtime> = Arc::downgrade(self);
        registry.subscribe(Arc::new(move |event| {
            let Some(runtime) = runtime.upgrade() else {
                return;
            };
            let _entered = handle.enter();
            match event {
                RegistryEvent::Registered(definition) | RegistryEvent::Replaced(definition) => {
                    runtime.start_ticker(definition);
                }
                RegistryEvent::Unregistered(id) => runtime.stop_ticker(id),
            }
        }));
        info!(flows = registry.len(), "runtime started");
        Ok(())
    }

    fn start_ticker(self: &Arc<Self>, definition: &Arc<FlowDefinition>) {
        self.stop_ticker(definition.id());
        let Some(period) = definition.interval().filter(|p| !p.is_zero()) else {
            return;
        };
        let id = definition.id().to_string();
        let dispatcher = self.dispatcher.clone();
        let flow = id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(definition) = dispatcher.registry().get(&flow) else {
                    break;
                };
                dispatcher.tick(&definition, Utc::now()).await;
            }
        });
        debug!(flow = %id, ?period, "interval timer started");
        self.tickers.insert(id, task);
    }

    fn stop_ticker(&self, id: &str) {
        if let Some((_, task)) = self.tickers.remove(id) {
            task.abort();
        }
    }

    /// Queue `message` for processing.
    pub fn submit(&self, message: Message) -> Result<(), SubmitError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        validate_topic(&message.topic)?;

        // The entry guard is held until the message is queued, so an idle
        // worker cannot retire in between.
        let worker = self
            .workers
            .entry(message.topic.clone())
            .or_insert_with(|| self.spawn_worker(&message.topic));
        let depth = self.options.queue_depth.max(1);
        let mut items = worker.queue.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() >= depth {
            match self.options.overflow_policy {
                OverflowPolicy::DropOldest => {
                    items.pop_front();
                    warn!(topic = %message.topic, depth, "queue full, dropped oldest message");
                }
                OverflowPolicy::RejectNewest => {
                    warn!(topic = %message.topic, depth, "queue full, rejected message");
                    return Err(SubmitError::QueueFull {
                        topic: message.topic,
                        depth,
                    });
                }
            }
        }
        items.push_back(message);
        drop(items);
        worker.queue.notify.notify_one();
        Ok(())
    }

    fn spawn_worker(&self, topic: &str) -> Worker {
        let queue = Arc::new(TopicQueue::default());
        let task = tokio::spawn(drain(
            topic.to_string(),
            queue.clone(),
            self.dispatcher.clone(),
            Arc::downgrade(&self.workers),
            self.options.idle_timeout,
        ));
        debug!(topic, "topic worker started");
        Worker { queue, task }
    }

    /// Number of topics that currently have a worker.
    pub fn active_topics(&self) -> usize {
        self.workers.len()
    }

    /// Number of messages waiting on `topic`.
    pub fn queued(&self, topic: &str) -> usize {
        self.workers
            .get(topic)
            .map(|w| w.queue.items.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Stop accepting messages, drain the queues, stop the timers and
    /// persist the mapper state.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.stopping.store(true, Ordering::Release);
        let tickers: Vec<String> = self.tickers.iter().map(|t| t.key().clone()).collect();
        for id in tickers {
            self.stop_ticker(&id);
        }

        let topics: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        for topic in topics {
            let Some((_, worker)) = self.workers.remove(&topic) else {
                continue;
            };
            worker.queue.close();
            let abort = worker.task.abort_handle();
            if tokio::time::timeout(drain_timeout, worker.task).await.is_err() {
                warn!(%topic, "queue not drained in time");
                abort.abort();
            }
        }

        if let Err(err) = self.dispatcher.registry().store().flush().await {
            warn!(error = %err, "mapper state not persisted at shutdown");
        }
        info!("runtime stopped");
    }
}

async fn drain(
    topic: String,
    queue: Arc<TopicQueue>,
    dispatcher: Arc<Dispatcher>,
    workers: Weak<DashMap<String, Worker>>,
    idle: Duration,
) {
    loop {
        match queue.pop() {
            Some(message) => {
                dispatcher.process(message).await;
            }
            None if queue.closed.load(Ordering::Acquire) => break,
            None => {
                if tokio::time::timeout(idle, queue.notify.notified()).await.is_ok() {
                    continue;
                }
                let Some(workers) = workers.upgrade() else {
                    break;
                };
                let retired = workers.remove_if(&topic, |_, worker| {
                    Arc::ptr_eq(&worker.queue, &queue)
                        && worker.queue.items.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
                });
                if retired.is_some() {
                    debug!(%topic, "idle topic worker retired");
                    break;
                }
            }
        }
    }
}
