//! Topic-routed flow engine for device telemetry.
//!
//! Inbound messages are matched against the topic filters of registered
//! flows; each matching flow transforms the message into zero or more
//! outbound messages which are republished through a [`broker::Broker`].

pub mod broker;
pub mod cli;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod flow;
pub mod logger;
pub mod runtime;
pub mod state;
pub mod topic;
pub mod watcher;

pub use flow_api::{FlowOutput, LogLevel, Message, Payload, Qos};

pub use context::FlowContext;
pub use dispatcher::{Dispatcher, ProcessReport};
pub use executor::Executor;
pub use flow::{FlowDefinition, FlowError, FlowRegistry, FlowTransform};
pub use runtime::{Runtime, RuntimeOptions};
pub use state::Store;
