use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic `{0}` contains a wildcard")]
    Wildcard(String),
    #[error("topic `{0}` contains a NUL character")]
    Nul(String),
    #[error("invalid topic filter `{0}`: `#` must be the last level")]
    MisplacedMultiLevel(String),
    #[error("invalid topic filter `{0}`: wildcards must occupy a whole level")]
    PartialWildcard(String),
}

/// Check that `topic` can be published to: non-empty, no wildcard, no NUL.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::Wildcard(topic.to_string()));
    }
    if topic.contains('\0') {
        return Err(TopicError::Nul(topic.to_string()));
    }
    Ok(())
}

/// An MQTT subscription pattern.
///
/// `+` matches exactly one level, `#` matches the remaining levels
/// (including none), both only as whole levels. A filter starting with a
/// wildcard never matches topics whose first level starts with `$`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    pattern: String,
}

impl TopicFilter {
    pub fn new(pattern: impl Into<String>) -> Result<Self, TopicError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }
        if pattern.contains('\0') {
            return Err(TopicError::Nul(pattern));
        }
        let levels: Vec<&str> = pattern.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            match *level {
                "#" if i + 1 != levels.len() => {
                    return Err(TopicError::MisplacedMultiLevel(pattern));
                }
                "#" | "+" => {}
                other if other.contains(['+', '#']) => {
                    return Err(TopicError::PartialWildcard(pattern));
                }
                _ => {}
            }
        }
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        let mut filter = self.pattern.split('/');
        let mut levels = topic.split('/');

        if topic.starts_with('$') && self.pattern.starts_with(['+', '#']) {
            return false;
        }

        loop {
            match (filter.next(), levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(f), Some(t)) if f == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicFilter").field(&self.pattern).finish()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = TopicError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        TopicFilter::new(value)
    }
}

impl Serialize for TopicFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for TopicFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TopicFilter::new(raw).map_err(serde::de::Error::custom)
    }
}
