use thiserror::Error;

/// Failures raised by the broker side of the bridge.
///
/// Only [`BridgeError::Connection`] ever reaches `main`; everything else is
/// logged at the place it happens or folded into a tool result string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("cannot connect to broker {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("subscription to '{topic}' failed: {reason}")]
    Subscription { topic: String, reason: String },
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("malformed payload on '{topic}': {reason}")]
    Decode { topic: String, reason: String },
}

impl BridgeError {
    pub fn publish(topic: &str, reason: impl ToString) -> Self {
        BridgeError::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(topic: &str, reason: impl ToString) -> Self {
        BridgeError::Decode {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
