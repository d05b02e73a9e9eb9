pub mod message;
pub mod output;

pub use message::{LogLevel, Message, Payload, PayloadError, Qos};
pub use output::FlowOutput;
