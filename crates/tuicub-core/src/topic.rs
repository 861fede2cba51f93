//! Topics name the fan-out channels: one per game or gameroom, plus one
//! personal topic per session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

pub const MAX_TOPIC_LEN: usize = 256;

const SESSION_PREFIX: &str = "session:";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic exceeds 256 bytes")]
    TooLong,
    #[error("topic contains control characters")]
    ControlCharacter,
}

/// An opaque game or gameroom identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TopicError::Empty);
        }
        if name.len() > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong);
        }
        if name.chars().any(char::is_control) {
            return Err(TopicError::ControlCharacter);
        }
        Ok(Self(name))
    }

    /// The personal topic every connection of `session_id` is subscribed to.
    pub fn for_session(session_id: &SessionId) -> Self {
        Self(format!("{SESSION_PREFIX}{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_control_characters() {
        assert_eq!(Topic::new(""), Err(TopicError::Empty));
        assert_eq!(Topic::new("room\n1"), Err(TopicError::ControlCharacter));
        assert_eq!(Topic::new("x".repeat(MAX_TOPIC_LEN + 1)), Err(TopicError::TooLong));
        assert!(Topic::new("x".repeat(MAX_TOPIC_LEN)).is_ok());
    }

    #[test]
    fn personal_topic_is_derived_from_session() {
        let topic = Topic::for_session(&SessionId::from_raw("alice"));
        assert_eq!(topic.as_str(), "session:alice");
        assert_eq!(Topic::new("session:alice").unwrap(), topic);
    }

    #[test]
    fn deserialize_validates() {
        let ok: Topic = serde_json::from_str(r#""room-1""#).unwrap();
        assert_eq!(ok.as_str(), "room-1");
        assert!(serde_json::from_str::<Topic>(r#""""#).is_err());
    }
}
