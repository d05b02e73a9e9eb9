use crate::message::Message;

/// What a flow hands back for one invocation.
///
/// The engine flattens this into an ordered sequence before dispatching:
/// `NoOutput` is empty, `One` a singleton, `Many` is passed through as is.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FlowOutput {
    #[default]
    NoOutput,
    One(Message),
    Many(Vec<Message>),
}

impl FlowOutput {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            FlowOutput::NoOutput => Vec::new(),
            FlowOutput::One(message) => vec![message],
            FlowOutput::Many(messages) => messages,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FlowOutput::NoOutput => 0,
            FlowOutput::One(_) => 1,
            FlowOutput::Many(messages) => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Message> for FlowOutput {
    fn from(message: Message) -> Self {
        FlowOutput::One(message)
    }
}

impl From<Vec<Message>> for FlowOutput {
    fn from(messages: Vec<Message>) -> Self {
        FlowOutput::Many(messages)
    }
}

impl From<Option<Message>> for FlowOutput {
    fn from(message: Option<Message>) -> Self {
        message.map_or(FlowOutput::NoOutput, FlowOutput::One)
    }
}
